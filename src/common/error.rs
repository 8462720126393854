use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Collector rejected frame with status {status} (kept at {})", path.display())]
    Rejected { status: u16, path: PathBuf },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Connectivity problems are retried by the worker instead of ending it.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RelayError::Camera(_) | RelayError::EndOfStream)
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
