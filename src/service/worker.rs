//! Per-camera ingestion loop.
//!
//! A [`StreamWorker`] drives one camera through
//! `Disconnected -> Connecting -> Streaming -> Disconnected ...` until shutdown.
//! Every read frame bumps `frame_index`; only every `sample_rate`-th frame is
//! gated and possibly dispatched. The index survives reconnects.

use crate::camera::source::{StreamOpener, VideoStream};
use crate::camera::ffmpeg::redact;
use crate::common::config::{CameraConfig, RuntimeSettings};
use crate::common::error::RelayError;
use crate::common::frame::FrameSample;
use crate::core::face_gate::FaceGate;
use crate::core::quality;
use crate::service::shutdown::Shutdown;
use crate::service::uploader::Uploader;
use image::DynamicImage;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Streaming,
}

/// What happened to one read frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    NotSampled,
    Blurry,
    InvalidFrame,
    NoSubject,
    DetectorFailed,
    Dispatched,
    DispatchFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames_read: u64,
    pub sampled: u64,
    pub blurry: u64,
    pub invalid: u64,
    pub enhanced: u64,
    pub no_subject: u64,
    pub detector_failed: u64,
    pub dispatched: u64,
    pub dispatch_failed: u64,
    pub reconnects: u64,
}

pub struct StreamWorker {
    camera: CameraConfig,
    settings: Arc<RuntimeSettings>,
    opener: Arc<dyn StreamOpener>,
    face_gate: FaceGate,
    uploader: Uploader,
    shutdown: Shutdown,
    frame_index: u64,
    state: WorkerState,
    stats: WorkerStats,
}

impl StreamWorker {
    pub fn new(
        camera: CameraConfig,
        settings: Arc<RuntimeSettings>,
        opener: Arc<dyn StreamOpener>,
        face_gate: FaceGate,
        uploader: Uploader,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            camera,
            settings,
            opener,
            face_gate,
            uploader,
            shutdown,
            frame_index: 0,
            state: WorkerState::Disconnected,
            stats: WorkerStats::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Runs until shutdown is requested. Connectivity problems never end the loop.
    pub fn run(&mut self) {
        let camera_id = self.camera.id.clone();
        tracing::info!(camera_id = %camera_id, "Starting processing from {}", redact(&self.camera.url));

        while !self.shutdown.is_requested() {
            self.state = WorkerState::Connecting;
            let stream = match self.opener.open(&self.camera.url) {
                Ok(stream) => stream,
                Err(e) => {
                    self.state = WorkerState::Disconnected;
                    let delay = self.settings.reconnect.open_retry();
                    tracing::warn!(
                        camera_id = %camera_id,
                        "Camera offline or unreachable ({}). Retrying in {}s",
                        e,
                        delay.as_secs()
                    );
                    if self.shutdown.wait_timeout(delay) {
                        break;
                    }
                    continue;
                }
            };

            tracing::info!(camera_id = %camera_id, "Camera stream opened");
            self.state = WorkerState::Streaming;
            let interrupted = self.stream_frames(stream);
            self.state = WorkerState::Disconnected;

            if !interrupted {
                break;
            }

            self.stats.reconnects += 1;
            let delay = self.settings.reconnect.read_retry();
            tracing::info!(
                camera_id = %camera_id,
                stats = ?self.stats,
                "Reconnecting in {}s",
                delay.as_secs()
            );
            if self.shutdown.wait_timeout(delay) {
                break;
            }
        }

        self.state = WorkerState::Disconnected;
        tracing::info!(camera_id = %camera_id, stats = ?self.stats, "Worker stopped");
    }

    /// Reads until the stream fails or shutdown is requested. The stream is
    /// dropped (closed) before returning. Returns `true` on a read failure.
    fn stream_frames(&mut self, mut stream: Box<dyn VideoStream>) -> bool {
        loop {
            if self.shutdown.is_requested() {
                return false;
            }

            let error = match stream.read_frame() {
                Ok(Some(frame)) => {
                    self.handle_frame(frame);
                    continue;
                }
                Ok(None) => RelayError::EndOfStream,
                Err(e) => e,
            };

            if error.is_connectivity() {
                tracing::warn!(camera_id = %self.camera.id, "Camera stream lost ({}). Restarting capture", error);
            } else {
                tracing::error!(camera_id = %self.camera.id, "Frame read failed: {}. Restarting capture", error);
            }
            return true;
        }
    }

    /// Applies the sampling policy to one successfully read frame.
    pub fn handle_frame(&mut self, frame: DynamicImage) -> FrameOutcome {
        let index = self.frame_index;
        self.frame_index += 1;
        self.stats.frames_read += 1;

        if index % self.settings.sample_rate != 0 {
            return FrameOutcome::NotSampled;
        }

        self.stats.sampled += 1;
        let sample = FrameSample::new(&self.camera.id, index, frame);
        let outcome = self.process_sample(sample);
        self.record(outcome);
        outcome
    }

    fn process_sample(&mut self, mut sample: FrameSample) -> FrameOutcome {
        let camera_id = self.camera.id.as_str();
        let q = &self.settings.quality;

        if q.blur_detection {
            match quality::is_blurry(&sample.image, q.blur_threshold) {
                Ok(false) => {}
                Ok(true) => {
                    tracing::info!(camera_id, frame_index = sample.frame_index, "Skipping blurry frame");
                    return FrameOutcome::Blurry;
                }
                Err(e) => return invalid(camera_id, sample.frame_index, &e),
            }
        }

        if q.low_light_check {
            match quality::is_low_light(&sample.image, q.low_light_threshold) {
                Ok(true) if q.enhance_low_light => {
                    match quality::enhance(&sample.image, q.clahe_clip_limit, q.clahe_tile_grid) {
                        Ok(enhanced) => {
                            sample.image = enhanced;
                            self.stats.enhanced += 1;
                            tracing::info!(camera_id, frame_index = sample.frame_index, "Frame enhanced due to low light");
                        }
                        Err(e) => return invalid(camera_id, sample.frame_index, &e),
                    }
                }
                Ok(_) => {}
                Err(e) => return invalid(camera_id, sample.frame_index, &e),
            }
        }

        match self.face_gate.has_subject(&sample.image) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(camera_id, frame_index = sample.frame_index, "No face detected");
                return FrameOutcome::NoSubject;
            }
            Err(e) => {
                tracing::warn!(camera_id, frame_index = sample.frame_index, "Face detection failed: {}", e);
                return FrameOutcome::DetectorFailed;
            }
        }

        match self.uploader.dispatch(&sample) {
            Ok(_) => FrameOutcome::Dispatched,
            Err(e) => {
                tracing::debug!(camera_id, frame_index = sample.frame_index, "Dispatch failed: {}", e);
                FrameOutcome::DispatchFailed
            }
        }
    }

    fn record(&mut self, outcome: FrameOutcome) {
        let stats = &mut self.stats;
        match outcome {
            FrameOutcome::NotSampled => {}
            FrameOutcome::Blurry => stats.blurry += 1,
            FrameOutcome::InvalidFrame => stats.invalid += 1,
            FrameOutcome::NoSubject => stats.no_subject += 1,
            FrameOutcome::DetectorFailed => stats.detector_failed += 1,
            FrameOutcome::Dispatched => stats.dispatched += 1,
            FrameOutcome::DispatchFailed => stats.dispatch_failed += 1,
        }
    }
}

fn invalid(camera_id: &str, frame_index: u64, error: &RelayError) -> FrameOutcome {
    tracing::info!(camera_id, frame_index, "Skipping invalid frame: {}", error);
    FrameOutcome::InvalidFrame
}
