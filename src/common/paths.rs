use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use crate::common::error::Result;
use crate::common::frame::FrameSample;

/// Ephemeral on-disk storage for frames waiting on the collector.
///
/// The directory is shared by every worker; file names carry the camera id,
/// frame index and capture time so workers never collide.
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
    jpeg_quality: u8,
}

impl FrameStore {
    pub fn new(dir: impl Into<PathBuf>, jpeg_quality: u8) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, jpeg_quality })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(sample: &FrameSample) -> String {
        let timestamp = sample.captured_at.format("%Y%m%d%H%M%S");
        format!(
            "{}_frame_{}_{}.jpg",
            sanitize_id(&sample.camera_id),
            sample.frame_index,
            timestamp
        )
    }

    /// Encode the sample as JPEG and write it under its generated name.
    pub fn persist(&self, sample: &FrameSample) -> Result<PathBuf> {
        let path = self.dir.join(Self::file_name(sample));
        let rgb = sample.image.to_rgb8();

        let writer = BufWriter::new(File::create(&path)?);
        let mut encoder = JpegEncoder::new_with_quality(writer, self.jpeg_quality);
        encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;

        tracing::debug!(camera_id = %sample.camera_id, "Persisted frame to {}", path.display());
        Ok(path)
    }

    pub fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }
}

/// Filename-safe form of a camera id. Anything outside `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
