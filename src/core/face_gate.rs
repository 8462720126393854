use crate::core::detector::FaceDetect;
use crate::common::error::Result;
use image::DynamicImage;

/// Reduces a detector's output to "does this frame contain a face".
pub struct FaceGate {
    detector: Box<dyn FaceDetect>,
}

impl FaceGate {
    pub fn new(detector: Box<dyn FaceDetect>) -> Self {
        Self { detector }
    }

    pub fn has_subject(&mut self, frame: &DynamicImage) -> Result<bool> {
        let faces = self.detector.detect(frame)?;
        tracing::trace!("Detector found {} face(s)", faces.len());
        Ok(!faces.is_empty())
    }
}
