//! Frame-level quality checks: sharpness, brightness and low-light enhancement.
//!
//! Everything here is a pure function of its input frame. Empty frames fail
//! with [`RelayError::InvalidFrame`], which callers treat like a blurry frame.

use crate::common::config::QualityConfig;
use crate::common::error::{RelayError, Result};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::definitions::Image;
use imageproc::filter::filter3x3;

/// 4-neighbour discrete Laplacian.
const LAPLACIAN: [i32; 9] = [0, 1, 0, 1, -4, 1, 0, 1, 0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    pub blur_score: f64,
    pub brightness: f64,
    pub blurry: bool,
    pub low_light: bool,
}

impl QualityReport {
    pub fn assess(frame: &DynamicImage, config: &QualityConfig) -> Result<Self> {
        let gray = to_gray(frame)?;
        let blur_score = laplacian_variance(&gray);
        let brightness = mean_intensity(&gray);

        Ok(Self {
            blur_score,
            brightness,
            blurry: blur_score < config.blur_threshold,
            low_light: brightness < config.low_light_threshold,
        })
    }
}

pub fn to_gray(frame: &DynamicImage) -> Result<GrayImage> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(RelayError::InvalidFrame(format!(
            "empty frame ({}x{})", frame.width(), frame.height()
        )));
    }
    Ok(frame.to_luma8())
}

/// Variance of the Laplacian of the intensity image. Low values mean few edges.
pub fn blur_score(frame: &DynamicImage) -> Result<f64> {
    Ok(laplacian_variance(&to_gray(frame)?))
}

pub fn is_blurry(frame: &DynamicImage, threshold: f64) -> Result<bool> {
    Ok(blur_score(frame)? < threshold)
}

pub fn mean_brightness(frame: &DynamicImage) -> Result<f64> {
    Ok(mean_intensity(&to_gray(frame)?))
}

pub fn is_low_light(frame: &DynamicImage, threshold: f64) -> Result<bool> {
    Ok(mean_brightness(frame)? < threshold)
}

fn laplacian_variance(gray: &GrayImage) -> f64 {
    let laplacian: Image<Luma<i16>> = filter3x3(gray, &LAPLACIAN);

    let count = laplacian.len() as f64;
    let (sum, sum_sq) = laplacian.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p[0] as f64;
        (s + v, sq + v * v)
    });

    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

fn mean_intensity(gray: &GrayImage) -> f64 {
    let sum: u64 = gray.pixels().map(|p| p[0] as u64).sum();
    sum as f64 / gray.len() as f64
}

/// Local-contrast enhancement for dark frames.
///
/// Runs CLAHE on the L channel of CIE L*a*b* and leaves a*/b* untouched.
/// Grayscale input stays grayscale.
pub fn enhance(frame: &DynamicImage, clip_limit: f32, tile_grid: u32) -> Result<DynamicImage> {
    let gray = to_gray(frame)?;

    if !frame.color().has_color() {
        return Ok(DynamicImage::ImageLuma8(clahe(&gray, clip_limit, tile_grid)));
    }

    let rgb = frame.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut lightness = GrayImage::new(width, height);
    let mut chroma = Vec::with_capacity((width * height) as usize);
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (l, a, b) = rgb_to_lab(pixel);
        let scaled = (l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8;
        lightness.put_pixel(x, y, Luma([scaled]));
        chroma.push((a, b));
    }

    let equalized = clahe(&lightness, clip_limit, tile_grid);

    let mut out = RgbImage::new(width, height);
    for (pixel, (l, (a, b))) in out
        .pixels_mut()
        .zip(equalized.pixels().map(|p| p[0] as f32 * 100.0 / 255.0).zip(chroma))
    {
        *pixel = lab_to_rgb(l, a, b);
    }

    Ok(DynamicImage::ImageRgb8(out))
}

/// Contrast-limited adaptive histogram equalization over a `grid` x `grid`
/// tiling, bilinearly interpolating between neighbouring tile mappings.
pub fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }

    let grid = grid.max(1);
    let tile_w = (width + grid.min(width) - 1) / grid.min(width);
    let tile_h = (height + grid.min(height) - 1) / grid.min(height);
    let tiles_x = (width + tile_w - 1) / tile_w;
    let tiles_y = (height + tile_h - 1) / tile_h;

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                }
            }

            let area = (x1 - x0) * (y1 - y0);
            let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
            clip_histogram(&mut hist, limit);
            luts.push(tile_lut(&hist, area));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let (ty0, ty1, wy) = neighbours(fy, tiles_y);

        for x in 0..width {
            let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let (tx0, tx1, wx) = neighbours(fx, tiles_x);

            let v = gray.get_pixel(x, y)[0] as usize;
            let top = (1.0 - wx) * lut_at(tx0, ty0)[v] as f32 + wx * lut_at(tx1, ty0)[v] as f32;
            let bottom = (1.0 - wx) * lut_at(tx0, ty1)[v] as f32 + wx * lut_at(tx1, ty1)[v] as f32;
            let value = (1.0 - wy) * top + wy * bottom;

            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }

    out
}

fn neighbours(pos: f32, tiles: u32) -> (u32, u32, f32) {
    let base = pos.floor();
    let weight = pos - base;
    let last = tiles as i64 - 1;
    let first = (base as i64).clamp(0, last) as u32;
    let second = (base as i64 + 1).clamp(0, last) as u32;
    (first, second, weight)
}

fn clip_histogram(hist: &mut [u32; 256], limit: u32) {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let per_bin = excess / 256;
    let residual = excess % 256;
    for bin in hist.iter_mut() {
        *bin += per_bin;
    }
    if residual > 0 {
        let step = (256 / residual).max(1) as usize;
        for bin in hist.iter_mut().step_by(step).take(residual as usize) {
            *bin += 1;
        }
    }
}

fn tile_lut(hist: &[u32; 256], area: u32) -> [u8; 256] {
    let scale = 255.0 / area.max(1) as f32;
    let mut lut = [0u8; 256];
    let mut cumulative = 0u32;
    for (entry, count) in lut.iter_mut().zip(hist.iter()) {
        cumulative += count;
        *entry = (cumulative as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

// sRGB (D65) <-> CIE L*a*b*

const WHITE: (f32, f32, f32) = (0.950_47, 1.0, 1.088_83);
const EPSILON: f32 = 6.0 / 29.0;

fn srgb_to_linear(c: u8) -> f32 {
    let c = c as f32 / 255.0;
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let v = if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn lab_f(t: f32) -> f32 {
    if t > EPSILON.powi(3) {
        t.cbrt()
    } else {
        t / (3.0 * EPSILON * EPSILON) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    if t > EPSILON {
        t.powi(3)
    } else {
        3.0 * EPSILON * EPSILON * (t - 4.0 / 29.0)
    }
}

pub fn rgb_to_lab(pixel: &Rgb<u8>) -> (f32, f32, f32) {
    let r = srgb_to_linear(pixel[0]);
    let g = srgb_to_linear(pixel[1]);
    let b = srgb_to_linear(pixel[2]);

    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b;
    let z = 0.019_333_9 * r + 0.119_192_0 * g + 0.950_304_1 * b;

    let fx = lab_f(x / WHITE.0);
    let fy = lab_f(y / WHITE.1);
    let fz = lab_f(z / WHITE.2);

    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

pub fn lab_to_rgb(l: f32, a: f32, b: f32) -> Rgb<u8> {
    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;

    let x = WHITE.0 * lab_f_inv(fx);
    let y = WHITE.1 * lab_f_inv(fy);
    let z = WHITE.2 * lab_f_inv(fz);

    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266_0 * x + 1.876_010_8 * y + 0.041_556_0 * z;
    let bl = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;

    Rgb([linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(bl)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([value, value, value])))
    }

    fn checkerboard(low: u8, high: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| {
            let v = if (x / 2 + y / 2) % 2 == 0 { low } else { high };
            Rgb([v, v, v])
        }))
    }

    fn dark_tinted_gradient() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(256, 256, |x, y| {
            let v = (10 + (x + y) / 32) as u8;
            Rgb([v + 6, v + 3, v])
        }))
    }

    fn luma_std_dev(frame: &DynamicImage) -> f64 {
        let gray = frame.to_luma8();
        let mean = mean_intensity(&gray);
        let var = gray.pixels().map(|p| (p[0] as f64 - mean).powi(2)).sum::<f64>() / gray.len() as f64;
        var.sqrt()
    }

    fn mean_chroma(frame: &DynamicImage) -> (f32, f32) {
        let rgb = frame.to_rgb8();
        let n = rgb.len() as f32 / 3.0;
        let (a, b) = rgb.pixels().fold((0.0, 0.0), |(sa, sb), p| {
            let (_, a, b) = rgb_to_lab(p);
            (sa + a, sb + b)
        });
        (a / n, b / n)
    }

    #[test]
    fn flat_frame_is_blurry() {
        assert_eq!(blur_score(&uniform(128)).unwrap(), 0.0);
        assert!(is_blurry(&uniform(128), 60.0).unwrap());
    }

    #[test]
    fn textured_frame_is_sharp() {
        let frame = checkerboard(0, 255);
        assert!(blur_score(&frame).unwrap() > 1000.0);
        assert!(!is_blurry(&frame, 60.0).unwrap());
    }

    #[test]
    fn empty_frame_is_invalid() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(is_blurry(&empty, 60.0), Err(RelayError::InvalidFrame(_))));
        assert!(matches!(is_low_light(&empty, 50.0), Err(RelayError::InvalidFrame(_))));
        assert!(matches!(enhance(&empty, 3.0, 8), Err(RelayError::InvalidFrame(_))));
    }

    #[test]
    fn low_light_uses_mean_intensity() {
        assert!(is_low_light(&uniform(20), 50.0).unwrap());
        assert!(!is_low_light(&uniform(120), 50.0).unwrap());
        assert!((mean_brightness(&uniform(77)).unwrap() - 77.0).abs() < 1.0);
    }

    #[test]
    fn assess_combines_checks() {
        let report = QualityReport::assess(&checkerboard(0, 40), &QualityConfig::default()).unwrap();
        assert!(!report.blurry);
        assert!(report.low_light);
        assert!(report.brightness < 50.0);
    }

    #[test]
    fn enhance_keeps_dimensions_and_raises_contrast() {
        let frame = dark_tinted_gradient();
        let enhanced = enhance(&frame, 3.0, 2).unwrap();

        assert_eq!(enhanced.width(), frame.width());
        assert_eq!(enhanced.height(), frame.height());
        assert!(luma_std_dev(&enhanced) > luma_std_dev(&frame));
    }

    #[test]
    fn enhance_preserves_chrominance() {
        let frame = dark_tinted_gradient();
        let enhanced = enhance(&frame, 3.0, 2).unwrap();

        let (a_before, b_before) = mean_chroma(&frame);
        let (a_after, b_after) = mean_chroma(&enhanced);
        assert!((a_before - a_after).abs() < 3.0, "a* drifted: {} -> {}", a_before, a_after);
        assert!((b_before - b_after).abs() < 3.0, "b* drifted: {} -> {}", b_before, b_after);
    }

    #[test]
    fn enhance_keeps_grayscale_frames_grayscale() {
        let frame = DynamicImage::ImageLuma8(GrayImage::from_fn(32, 32, |x, _| Luma([(x * 2) as u8])));
        let enhanced = enhance(&frame, 3.0, 4).unwrap();
        assert!(matches!(enhanced, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn lab_round_trip_is_stable() {
        for pixel in [Rgb([0, 0, 0]), Rgb([255, 255, 255]), Rgb([200, 30, 90]), Rgb([12, 140, 250])] {
            let (l, a, b) = rgb_to_lab(&pixel);
            let back = lab_to_rgb(l, a, b);
            for c in 0..3 {
                assert!((back[c] as i16 - pixel[c] as i16).abs() <= 1, "{:?} -> {:?}", pixel, back);
            }
        }
    }

    #[test]
    fn clahe_handles_frames_smaller_than_grid() {
        let tiny = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 40 + y * 10) as u8]));
        let out = clahe(&tiny, 3.0, 8);
        assert_eq!(out.dimensions(), (3, 2));
    }
}
