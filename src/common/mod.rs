pub mod config;
pub mod error;
pub mod frame;
pub mod paths;

pub use config::{CameraConfig, Config, RuntimeSettings};
pub use error::{RelayError, Result};
pub use frame::FrameSample;
pub use paths::FrameStore;
