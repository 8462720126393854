use crate::common::config::{CameraConfig, DetectorConfig};
use crate::common::error::{RelayError, Result};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A face detector owned by exactly one worker.
///
/// Takes `&mut self` so implementations are free to keep scratch state
/// between calls; nothing here is shared across threads.
pub trait FaceDetect {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
}

/// Prepares a fresh detector for a worker. Called on the worker's own thread.
pub trait DetectorFactory: Send + Sync {
    fn prepare(&self, camera: &CameraConfig) -> Result<Box<dyn FaceDetect>>;
}

impl<F> DetectorFactory for F
where
    F: Fn(&CameraConfig) -> Result<Box<dyn FaceDetect>> + Send + Sync,
{
    fn prepare(&self, camera: &CameraConfig) -> Result<Box<dyn FaceDetect>> {
        self(camera)
    }
}

/// YOLO-style single-class face detector running on ONNX Runtime.
pub struct OnnxFaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    config: DetectorConfig,
}

impl OnnxFaceDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let model_path = &config.model_path;
        if !model_path.exists() {
            return Err(RelayError::Model(
                format!("Detector model not found at: {:?}", model_path)
            ));
        }

        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| RelayError::Model(format!("Failed to create environment: {}", e)))?
        );

        let opt_level = match config.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(opt_level)?
            .with_model_from_file(model_path)?;

        Ok(Self {
            session,
            _environment: environment,
            config: config.clone(),
        })
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let rgb = img.to_rgb8();
        let width = rgb.width() as usize;
        let height = rgb.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 * norm_factor;
            array[[0, 1, y, x]] = pixel[1] as f32 * norm_factor;
            array[[0, 2, y, x]] = pixel[2] as f32 * norm_factor;
        }

        array
    }
}

impl FaceDetect for OnnxFaceDetector {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;
        let (input_width, input_height) = (self.config.input_width, self.config.input_height);

        let img_array = if image.width() == input_width && image.height() == input_height {
            self.image_to_array(image)
        } else {
            let resized = image.resize_exact(input_width, input_height, FilterType::Triangle);
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let output = outputs
            .first()
            .ok_or_else(|| RelayError::Model("Detector produced no outputs".into()))?
            .try_extract::<f32>()?;
        let view = output.view();
        let shape = view.shape().to_vec();
        let data: Vec<f32> = view.iter().copied().collect();

        let mut faces = decode_predictions(&data, &shape, &self.config);

        let scale_x = orig_width / input_width as f32;
        let scale_y = orig_height / input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }
}

/// Builds one [`OnnxFaceDetector`] per worker from the shared detector config.
pub struct OnnxDetectorFactory {
    config: DetectorConfig,
}

impl OnnxDetectorFactory {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
}

impl DetectorFactory for OnnxDetectorFactory {
    fn prepare(&self, camera: &CameraConfig) -> Result<Box<dyn FaceDetect>> {
        tracing::info!(camera_id = %camera.id, "Loading face detector from {}", self.config.model_path.display());
        Ok(Box::new(OnnxFaceDetector::new(&self.config)?))
    }
}

/// Decode raw YOLO output into face boxes in model-input pixel space.
///
/// Accepts `[1, N, C]`, `[1, C, N]` (transposed) and `[N, C]` layouts where each
/// prediction is `[cx, cy, w, h, score, ...]`.
pub fn decode_predictions(data: &[f32], shape: &[usize], config: &DetectorConfig) -> Vec<FaceBox> {
    let (num_predictions, prediction_length, is_transposed) = match shape {
        [_, a, b] if b > a && *a <= 10 => (*b, *a, true),
        [_, a, b] => (*a, *b, false),
        [a, b] => (*a, *b, false),
        _ => {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Vec::new();
        }
    };

    if prediction_length < 5 || data.len() < num_predictions * prediction_length {
        tracing::warn!("Detector output too small for shape {:?}", shape);
        return Vec::new();
    }

    let at = |i: usize, field: usize| {
        if is_transposed {
            data[field * num_predictions + i]
        } else {
            data[i * prediction_length + field]
        }
    };

    let input_width = config.input_width as f32;
    let input_height = config.input_height as f32;

    let mut faces = Vec::new();
    for i in 0..num_predictions {
        let confidence = at(i, 4);
        if confidence < config.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));

        // Some exports emit normalized coordinates.
        let (sx, sy) = if cx <= 1.0 && cy <= 1.0 && w <= 1.0 && h <= 1.0 {
            (input_width, input_height)
        } else {
            (1.0, 1.0)
        };
        let (cx, cy, w, h) = (cx * sx, cy * sy, w * sx, h * sy);

        let x1 = (cx - w / 2.0).max(0.0);
        let y1 = (cy - h / 2.0).max(0.0);
        let x2 = (cx + w / 2.0).min(input_width);
        let y2 = (cy + h / 2.0).min(input_height);

        if x2 > x1 && y2 > y1 {
            faces.push(FaceBox { x1, y1, x2, y2, confidence });
        }
    }

    apply_nms(faces, config.nms_iou)
}

pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| kept.iou(&candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig {
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.5,
            nms_iou: 0.45,
            ..DetectorConfig::default()
        }
    }

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&face(20.0, 20.0, 30.0, 30.0, 0.9)), 0.0);
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let boxes = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.7),
            face(5.0, 5.0, 105.0, 105.0, 0.9),
            face(300.0, 300.0, 400.0, 400.0, 0.6),
        ];
        let kept = apply_nms(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.6);
    }

    #[test]
    fn decodes_row_major_output() {
        // [1, 6, 5]: two confident overlapping faces, one weak prediction, padding
        let data = vec![
            320.0, 320.0, 100.0, 100.0, 0.95,
            322.0, 321.0, 100.0, 100.0, 0.80,
            100.0, 100.0, 50.0, 50.0, 0.10,
            0.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0, 0.0,
        ];
        let faces = decode_predictions(&data, &[1, 6, 5], &config());
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0], face(270.0, 270.0, 370.0, 370.0, 0.95));
    }

    #[test]
    fn decodes_transposed_normalized_output() {
        // [1, 5, 6]: fields are rows, predictions are columns
        let data = vec![
            0.5, 0.1, 0.0, 0.0, 0.0, 0.0,
            0.5, 0.1, 0.0, 0.0, 0.0, 0.0,
            0.25, 0.05, 0.0, 0.0, 0.0, 0.0,
            0.25, 0.05, 0.0, 0.0, 0.0, 0.0,
            0.9, 0.2, 0.0, 0.0, 0.0, 0.0,
        ];
        let faces = decode_predictions(&data, &[1, 5, 6], &config());
        assert_eq!(faces.len(), 1);
        assert!((faces[0].x1 - 240.0).abs() < 1e-3);
        assert!((faces[0].x2 - 400.0).abs() < 1e-3);
    }

    #[test]
    fn unexpected_shape_yields_no_faces() {
        assert!(decode_predictions(&[0.0; 4], &[4], &config()).is_empty());
        assert!(decode_predictions(&[0.0; 4], &[1, 1, 4], &config()).is_empty());
    }

    #[test]
    fn missing_model_is_a_model_error() {
        let config = DetectorConfig {
            model_path: "/nonexistent/face.onnx".into(),
            ..config()
        };
        assert!(matches!(OnnxFaceDetector::new(&config), Err(RelayError::Model(_))));
    }
}
