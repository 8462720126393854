pub mod detector;
pub mod face_gate;
pub mod quality;

pub use detector::{DetectorFactory, FaceBox, FaceDetect, OnnxDetectorFactory, OnnxFaceDetector};
pub use face_gate::FaceGate;
pub use quality::QualityReport;
