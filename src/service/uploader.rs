use crate::common::config::UploadConfig;
use crate::common::error::{RelayError, Result};
use crate::common::frame::FrameSample;
use crate::common::paths::FrameStore;
use reqwest::blocking::multipart::{Form, Part};
use std::sync::Arc;
use std::time::Duration;

/// One frame ready to be posted to the collector.
#[derive(Debug, Clone)]
pub struct FrameUpload<'a> {
    pub file_name: &'a str,
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub camera_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct CollectorResponse {
    pub status: u16,
    pub body: String,
}

impl CollectorResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body as JSON, or as a plain string when it is not JSON.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|_| serde_json::Value::String(self.body.clone()))
    }
}

/// HTTP capability used by the uploader. Shared by every worker.
pub trait CollectorTransport: Send + Sync {
    fn post_frame(&self, url: &str, upload: FrameUpload<'_>) -> Result<CollectorResponse>;
}

/// Blocking reqwest client posting multipart forms.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl CollectorTransport for HttpTransport {
    fn post_frame(&self, url: &str, upload: FrameUpload<'_>) -> Result<CollectorResponse> {
        let part = Part::bytes(upload.bytes)
            .file_name(upload.file_name.to_string())
            .mime_str(upload.mime)
            .map_err(|e| RelayError::Transport(format!("Invalid mime type: {}", e)))?;

        let form = Form::new()
            .part("file", part)
            .text("camera_id", upload.camera_id.to_string());

        let response = self.client
            .post(url)
            .multipart(form)
            .send()
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| RelayError::Transport(format!("Failed to read response body: {}", e)))?;

        Ok(CollectorResponse { status, body })
    }
}

/// Persists a frame locally, submits it, and deletes the local copy only once
/// the collector accepted it.
pub struct Uploader {
    store: FrameStore,
    transport: Arc<dyn CollectorTransport>,
    collector_url: String,
}

impl Uploader {
    pub fn new(store: FrameStore, transport: Arc<dyn CollectorTransport>, collector_url: impl Into<String>) -> Self {
        Self {
            store,
            transport,
            collector_url: collector_url.into(),
        }
    }

    /// Returns the collector's response body on success.
    ///
    /// On a rejected status or a transport failure the persisted file stays
    /// on disk for later reconciliation; nothing is retried here.
    pub fn dispatch(&self, sample: &FrameSample) -> Result<serde_json::Value> {
        let camera_id = sample.camera_id.as_str();
        let path = match self.store.persist(sample) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(camera_id, frame_index = sample.frame_index, "Failed to persist frame: {}", e);
                return Err(e);
            }
        };
        let file_name = FrameStore::file_name(sample);

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(camera_id, "Failed to read back {}: {}", path.display(), e);
                return Err(e.into());
            }
        };

        let upload = FrameUpload {
            file_name: &file_name,
            bytes,
            mime: "image/jpeg",
            camera_id,
        };

        let response = match self.transport.post_frame(&self.collector_url, upload) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(camera_id, "Send failed for {}: {}", file_name, e);
                return Err(e);
            }
        };

        if !response.is_success() {
            tracing::error!(camera_id, "Server error {} for {}", response.status, file_name);
            return Err(RelayError::Rejected { status: response.status, path });
        }

        let metadata = response.metadata();
        tracing::info!(camera_id, frame_index = sample.frame_index, "Frame sent to server: {}", metadata);

        if let Err(e) = self.store.remove(&path) {
            tracing::warn!(camera_id, "Failed to remove {}: {}", path.display(), e);
        }

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range_is_2xx() {
        let ok = CollectorResponse { status: 201, body: String::new() };
        let redirect = CollectorResponse { status: 302, body: String::new() };
        let error = CollectorResponse { status: 500, body: String::new() };
        assert!(ok.is_success());
        assert!(!redirect.is_success());
        assert!(!error.is_success());
    }

    #[test]
    fn metadata_falls_back_to_text() {
        let json = CollectorResponse { status: 200, body: r#"{"faces": 1}"#.into() };
        assert_eq!(json.metadata()["faces"], 1);

        let text = CollectorResponse { status: 200, body: "stored".into() };
        assert_eq!(text.metadata(), serde_json::Value::String("stored".into()));
    }
}
