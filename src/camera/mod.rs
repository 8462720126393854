pub mod ffmpeg;
pub mod source;
pub mod v4l2;

pub use source::{SourceKind, StreamOpener, SystemStreamOpener, VideoStream};
