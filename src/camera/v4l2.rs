use crate::camera::source::VideoStream;
use crate::common::config::CaptureConfig;
use crate::common::error::{RelayError, Result};
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb, RgbImage};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Streaming capture from a local V4L2 device node.
pub struct V4lStream {
    stream: v4l::io::mmap::Stream<'static>,
    _device: Device,
    format: v4l::Format,
}

impl V4lStream {
    pub fn open(path: &str, capture: &CaptureConfig) -> Result<Self> {
        let device = Device::with_path(path)
            .map_err(|e| RelayError::Camera(format!("Failed to open {}: {}", path, e)))?;

        let caps = device.query_caps()
            .map_err(|e| RelayError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("{} ({}) may not support standard video capture", path, caps.card);
        }

        let mut fmt = device.format()
            .map_err(|e| RelayError::Camera(format!("Failed to get format: {}", e)))?;
        fmt.width = capture.width;
        fmt.height = capture.height;

        // Keep GREY for IR sensors, otherwise ask for MJPG
        if fmt.fourcc.repr != *b"GREY" {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set format on {}: {}. Using device defaults.", path, e);
        }

        let format = device.format()
            .map_err(|e| RelayError::Camera(format!("Failed to get final format: {}", e)))?;
        tracing::debug!(
            "{} streaming {}x{} {}",
            path,
            format.width,
            format.height,
            format.fourcc.str().unwrap_or("????")
        );

        let stream = v4l::io::mmap::Stream::with_buffers(&device, Type::VideoCapture, 4)
            .map_err(|e| RelayError::Camera(format!("Failed to create stream: {}", e)))?;

        Ok(Self {
            stream,
            _device: device,
            format,
        })
    }
}

impl VideoStream for V4lStream {
    fn read_frame(&mut self) -> Result<Option<DynamicImage>> {
        let (buf, _meta) = self.stream.next()
            .map_err(|e| RelayError::Camera(format!("Failed to capture: {}", e)))?;

        decode_frame(&self.format.fourcc.repr, buf, self.format.width, self.format.height).map(Some)
    }
}

pub fn decode_frame(fourcc: &[u8; 4], data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    match fourcc {
        b"MJPG" => Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?),
        b"GREY" => {
            let needed = (width * height) as usize;
            let pixels = data.get(..needed).map(<[u8]>::to_vec).unwrap_or_default();
            let buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixels)
                .ok_or_else(|| RelayError::InvalidFrame("Short GREY buffer".into()))?;
            Ok(DynamicImage::ImageLuma8(buffer))
        }
        b"YUYV" => yuyv_to_rgb(data, width, height).map(DynamicImage::ImageRgb8),
        other => Err(RelayError::Camera(format!(
            "Unsupported pixel format {}", String::from_utf8_lossy(other)
        ))),
    }
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let needed = (width * height * 2) as usize;
    if width % 2 != 0 || data.len() < needed {
        return Err(RelayError::InvalidFrame("Short YUYV buffer".into()));
    }

    let mut out = RgbImage::new(width, height);
    for (i, chunk) in data[..needed].chunks_exact(4).enumerate() {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        let x = (i as u32 * 2) % width;
        let y = (i as u32 * 2) / width;
        out.put_pixel(x, y, yuv_to_rgb(y0, u, v));
        out.put_pixel(x + 1, y, yuv_to_rgb(y1, u, v));
    }
    Ok(out)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    Rgb([
        clamp(1.164 * c + 1.596 * e),
        clamp(1.164 * c - 0.392 * d - 0.813 * e),
        clamp(1.164 * c + 2.017 * d),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_grey_frames() {
        let data: Vec<u8> = (0..12).collect();
        let frame = decode_frame(b"GREY", &data, 4, 3).unwrap();
        assert!(matches!(frame, DynamicImage::ImageLuma8(_)));
        assert_eq!((frame.width(), frame.height()), (4, 3));
    }

    #[test]
    fn short_grey_buffer_is_invalid() {
        assert!(matches!(decode_frame(b"GREY", &[0u8; 5], 4, 3), Err(RelayError::InvalidFrame(_))));
    }

    #[test]
    fn decodes_yuyv_neutral_gray() {
        // Y=126, U=V=128 -> mid gray
        let data = [126u8, 128, 126, 128].repeat(4);
        let frame = decode_frame(b"YUYV", &data, 4, 2).unwrap().to_rgb8();
        let p = frame.get_pixel(3, 1);
        assert!(p[0] == p[1] && p[1] == p[2]);
        assert!((p[0] as i16 - 128).abs() <= 2);
    }

    #[test]
    fn rejects_unknown_fourcc() {
        assert!(matches!(decode_frame(b"H264", &[], 1, 1), Err(RelayError::Camera(_))));
    }
}
