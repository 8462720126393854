// Core modules
pub mod core;
pub mod camera;
pub mod service;
pub mod common;

// Re-export commonly used types
pub use crate::common::{CameraConfig, Config, FrameSample, FrameStore, RelayError, Result, RuntimeSettings};
pub use crate::core::{DetectorFactory, FaceBox, FaceDetect, FaceGate, OnnxDetectorFactory, QualityReport};
pub use crate::camera::{StreamOpener, SystemStreamOpener, VideoStream};
pub use crate::service::{
    CameraSupervisor, CollectorTransport, FrameOutcome, HttpTransport, Shutdown, StreamWorker, Uploader,
};

