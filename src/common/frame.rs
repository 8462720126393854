use chrono::{DateTime, Local};
use image::DynamicImage;

/// One frame selected by the sampler, alive only for a single loop iteration.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub camera_id: String,
    pub frame_index: u64,
    pub image: DynamicImage,
    pub captured_at: DateTime<Local>,
}

impl FrameSample {
    pub fn new(camera_id: &str, frame_index: u64, image: DynamicImage) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            frame_index,
            image,
            captured_at: Local::now(),
        }
    }
}
