use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use crate::common::error::{RelayError, Result};
use crate::common::paths::sanitize_id;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(flatten)]
    pub settings: RuntimeSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub id: String,
    pub url: String,
}

/// Settings shared read-only by every worker.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RuntimeSettings {
    pub server_url: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u64,
    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

fn default_sample_rate() -> u64 { 30 }
fn default_frames_dir() -> PathBuf { PathBuf::from("frames") }
fn default_true() -> bool { true }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_true")]
    pub blur_detection: bool,
    #[serde(default = "default_blur_threshold")]
    pub blur_threshold: f64,
    #[serde(default = "default_true")]
    pub low_light_check: bool,
    #[serde(default = "default_low_light_threshold")]
    pub low_light_threshold: f64,
    #[serde(default = "default_true")]
    pub enhance_low_light: bool,
    #[serde(default = "default_clip_limit")]
    pub clahe_clip_limit: f32,
    #[serde(default = "default_tile_grid")]
    pub clahe_tile_grid: u32,
}

fn default_blur_threshold() -> f64 { 60.0 }
fn default_low_light_threshold() -> f64 { 50.0 }
fn default_clip_limit() -> f32 { 3.0 }
fn default_tile_grid() -> u32 { 8 }

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            blur_detection: true,
            blur_threshold: default_blur_threshold(),
            low_light_check: true,
            low_light_threshold: default_low_light_threshold(),
            enhance_low_light: true,
            clahe_clip_limit: default_clip_limit(),
            clahe_tile_grid: default_tile_grid(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_model_path() -> PathBuf { PathBuf::from("models/face_detector.onnx") }
fn default_input_size() -> u32 { 640 }
fn default_confidence() -> f32 { 0.5 }
fn default_nms_iou() -> f32 { 0.45 }
fn default_optimization_level() -> u32 { 3 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_width: default_input_size(),
            input_height: default_input_size(),
            confidence_threshold: default_confidence(),
            nms_iou: default_nms_iou(),
            optimization_level: default_optimization_level(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_open_retry")]
    pub open_retry_secs: u64,
    #[serde(default = "default_read_retry")]
    pub read_retry_secs: u64,
}

fn default_open_retry() -> u64 { 10 }
fn default_read_retry() -> u64 { 5 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            open_retry_secs: default_open_retry(),
            read_retry_secs: default_read_retry(),
        }
    }
}

impl ReconnectConfig {
    pub fn open_retry(&self) -> Duration {
        Duration::from_secs(self.open_retry_secs)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_secs(self.read_retry_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RestartConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_base")]
    pub base_delay_secs: u64,
    #[serde(default = "default_restart_max")]
    pub max_delay_secs: u64,
}

fn default_max_restarts() -> u32 { 5 }
fn default_restart_base() -> u64 { 5 }
fn default_restart_max() -> u64 { 300 }

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            base_delay_secs: default_restart_base(),
            max_delay_secs: default_restart_max(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_upload_timeout() -> u64 { 30 }
fn default_jpeg_quality() -> u8 { 90 }

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upload_timeout(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_width")]
    pub width: u32,
    #[serde(default = "default_capture_height")]
    pub height: u32,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_capture_width() -> u32 { 1280 }
fn default_capture_height() -> u32 { 720 }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_rtsp_transport() -> String { "tcp".to_string() }
fn default_read_timeout() -> u64 { 10 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_capture_width(),
            height: default_capture_height(),
            ffmpeg_path: default_ffmpeg_path(),
            rtsp_transport: default_rtsp_transport(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_idle_interval() -> u64 { 5 }
fn default_shutdown_grace() -> u64 { 10 }

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: default_idle_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl RuntimeSettings {
    /// Settings with every optional section at its default.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            sample_rate: default_sample_rate(),
            frames_dir: default_frames_dir(),
            quality: QualityConfig::default(),
            detector: DetectorConfig::default(),
            reconnect: ReconnectConfig::default(),
            restart: RestartConfig::default(),
            upload: UploadConfig::default(),
            capture: CaptureConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new("config.json"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RelayError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let is_toml = path.extension().map_or(false, |ext| ext == "toml");
        let config = Self::parse(&contents, is_toml)?;

        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str, is_toml: bool) -> Result<Self> {
        let config: Config = if is_toml {
            toml::from_str(contents)?
        } else {
            serde_json::from_str(contents)?
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let settings = &self.settings;

        match reqwest::Url::parse(&settings.server_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => {
                return Err(RelayError::Config(format!(
                    "server_url must be http or https, got scheme '{}'", url.scheme()
                )));
            }
            Err(e) => {
                return Err(RelayError::Config(format!(
                    "Invalid server_url '{}': {}", settings.server_url, e
                )));
            }
        }

        if settings.sample_rate == 0 {
            return Err(RelayError::Config("sample_rate must be a positive integer".into()));
        }

        let mut seen = HashSet::new();
        let mut file_prefixes = HashMap::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(RelayError::Config("Camera id must not be empty".into()));
            }
            if camera.url.trim().is_empty() {
                return Err(RelayError::Config(format!(
                    "Camera '{}' has an empty url", camera.id
                )));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "Duplicate camera id: {}", camera.id
                )));
            }
            if let Some(other) = file_prefixes.insert(sanitize_id(&camera.id), camera.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "Camera ids '{}' and '{}' map to the same frame file names", other, camera.id
                )));
            }
        }

        if settings.quality.clahe_tile_grid == 0 {
            return Err(RelayError::Config("clahe_tile_grid must be at least 1".into()));
        }
        if settings.quality.clahe_clip_limit <= 0.0 {
            return Err(RelayError::Config(format!(
                "clahe_clip_limit must be positive, got {}", settings.quality.clahe_clip_limit
            )));
        }

        if settings.capture.width == 0 || settings.capture.height == 0 {
            return Err(RelayError::Config(format!(
                "Capture size must be non-zero, got {}x{}",
                settings.capture.width, settings.capture.height
            )));
        }

        let detector = &settings.detector;
        if detector.input_width == 0 || detector.input_width > 4096 {
            return Err(RelayError::Config(format!(
                "Detector input width must be between 1 and 4096, got {}", detector.input_width
            )));
        }
        if detector.input_height == 0 || detector.input_height > 4096 {
            return Err(RelayError::Config(format!(
                "Detector input height must be between 1 and 4096, got {}", detector.input_height
            )));
        }
        if !(0.0..=1.0).contains(&detector.confidence_threshold) {
            return Err(RelayError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                detector.confidence_threshold
            )));
        }

        if settings.upload.jpeg_quality == 0 || settings.upload.jpeg_quality > 100 {
            return Err(RelayError::Config(format!(
                "jpeg_quality must be between 1 and 100, got {}", settings.upload.jpeg_quality
            )));
        }

        Ok(())
    }

    /// Splits into the camera list and the shared settings snapshot.
    pub fn into_parts(self) -> (Vec<CameraConfig>, Arc<RuntimeSettings>) {
        (self.cameras, Arc::new(self.settings))
    }
}
