use crate::camera::ffmpeg::FfmpegStream;
use crate::camera::v4l2::V4lStream;
use crate::common::config::CaptureConfig;
use crate::common::error::Result;
use image::DynamicImage;

/// An open video source. Dropping it releases the underlying handle.
pub trait VideoStream {
    /// `Ok(None)` marks a clean end of stream.
    fn read_frame(&mut self) -> Result<Option<DynamicImage>>;
}

pub trait StreamOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn VideoStream>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Local V4L2 device node.
    V4l(String),
    /// Anything ffmpeg can demux: rtsp, http, files.
    Ffmpeg(String),
}

impl SourceKind {
    pub fn from_url(url: &str) -> Self {
        if let Some(index) = url.strip_prefix("v4l://") {
            return SourceKind::V4l(format!("/dev/video{}", index));
        }
        if url.starts_with("/dev/video") {
            return SourceKind::V4l(url.to_string());
        }
        SourceKind::Ffmpeg(url.to_string())
    }
}

/// Opens real camera streams, routing each URL to the matching backend.
pub struct SystemStreamOpener {
    capture: CaptureConfig,
}

impl SystemStreamOpener {
    pub fn new(capture: CaptureConfig) -> Self {
        Self { capture }
    }
}

impl StreamOpener for SystemStreamOpener {
    fn open(&self, url: &str) -> Result<Box<dyn VideoStream>> {
        match SourceKind::from_url(url) {
            SourceKind::V4l(path) => Ok(Box::new(V4lStream::open(&path, &self.capture)?)),
            SourceKind::Ffmpeg(url) => Ok(Box::new(FfmpegStream::open(&url, &self.capture)?)),
        }
    }
}
