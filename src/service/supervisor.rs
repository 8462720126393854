use crate::camera::source::StreamOpener;
use crate::common::config::{CameraConfig, RestartConfig, RuntimeSettings};
use crate::common::error::{RelayError, Result};
use crate::common::paths::FrameStore;
use crate::core::detector::DetectorFactory;
use crate::core::face_gate::FaceGate;
use crate::service::shutdown::Shutdown;
use crate::service::uploader::{CollectorTransport, Uploader};
use crate::service::worker::StreamWorker;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bounded restart policy for a worker that died.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &RestartConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// Exponential backoff for the given zero-based restart attempt, capped at
    /// `max_delay`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus up to 10% random jitter so restarts do not line up.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Everything a worker thread needs, cloned per camera.
#[derive(Clone)]
pub struct WorkerContext {
    pub settings: Arc<RuntimeSettings>,
    pub opener: Arc<dyn StreamOpener>,
    pub detectors: Arc<dyn DetectorFactory>,
    pub transport: Arc<dyn CollectorTransport>,
    pub store: FrameStore,
    pub shutdown: Shutdown,
}

impl WorkerContext {
    /// Prepares the detector and runs one worker to completion.
    pub fn run_once(&self, camera: &CameraConfig) -> Result<()> {
        let detector = self.detectors.prepare(camera)?;
        let uploader = Uploader::new(
            self.store.clone(),
            self.transport.clone(),
            self.settings.server_url.clone(),
        );

        let mut worker = StreamWorker::new(
            camera.clone(),
            self.settings.clone(),
            self.opener.clone(),
            FaceGate::new(detector),
            uploader,
            self.shutdown.clone(),
        );
        worker.run();
        Ok(())
    }

    /// Runs a camera under the restart policy. A worker that ends with an
    /// error or a panic is restarted from scratch until the policy gives up.
    /// Returns the number of restarts performed.
    pub fn supervise(&self, camera: &CameraConfig, policy: &RestartPolicy) -> u32 {
        let mut restarts = 0;

        loop {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_once(camera)));

            match outcome {
                Ok(Ok(())) if self.shutdown.is_requested() => break,
                Ok(Ok(())) => {
                    tracing::warn!(camera_id = %camera.id, "Worker returned without shutdown");
                }
                Ok(Err(e)) => {
                    tracing::error!(camera_id = %camera.id, "Error in worker: {}", e);
                }
                Err(panic) => {
                    tracing::error!(camera_id = %camera.id, "Worker panicked: {}", panic_message(&panic));
                }
            }

            if self.shutdown.is_requested() {
                break;
            }
            if restarts >= policy.max_restarts {
                tracing::error!(
                    camera_id = %camera.id,
                    "Giving up after {} restart(s); camera is no longer processed",
                    restarts
                );
                break;
            }

            let delay = policy.delay_for(restarts);
            restarts += 1;
            tracing::warn!(
                camera_id = %camera.id,
                "Restarting worker in {:.1}s (attempt {}/{})",
                delay.as_secs_f32(),
                restarts,
                policy.max_restarts
            );
            if self.shutdown.wait_timeout(delay) {
                break;
            }
        }

        restarts
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct WorkerHandle {
    pub camera_id: String,
    pub thread: JoinHandle<()>,
}

/// Launches one independent worker thread per configured camera and idles
/// until shutdown.
pub struct CameraSupervisor {
    cameras: Vec<CameraConfig>,
    context: WorkerContext,
    policy: RestartPolicy,
}

impl CameraSupervisor {
    pub fn new(
        cameras: Vec<CameraConfig>,
        settings: Arc<RuntimeSettings>,
        opener: Arc<dyn StreamOpener>,
        detectors: Arc<dyn DetectorFactory>,
        transport: Arc<dyn CollectorTransport>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let store = FrameStore::new(&settings.frames_dir, settings.upload.jpeg_quality)?;
        tracing::info!("Saving frames to {}", store.dir().display());
        let policy = RestartPolicy::from_config(&settings.restart);

        Ok(Self {
            cameras,
            context: WorkerContext {
                settings,
                opener,
                detectors,
                transport,
                store,
                shutdown,
            },
            policy,
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.context.shutdown.clone()
    }

    /// Spawns the worker threads. Each sends its camera id on `done` when it exits.
    pub fn spawn_workers(&self, done: &Sender<String>) -> Result<Vec<WorkerHandle>> {
        let mut handles = Vec::with_capacity(self.cameras.len());

        for camera in &self.cameras {
            let context = self.context.clone();
            let policy = self.policy.clone();
            let camera = camera.clone();
            let camera_id = camera.id.clone();
            let done = done.clone();

            let thread = thread::Builder::new()
                .name(format!("cam-{}", camera.id))
                .spawn(move || {
                    context.supervise(&camera, &policy);
                    let _ = done.send(camera.id);
                })
                .map_err(|e| RelayError::Other(anyhow::anyhow!("Failed to spawn worker thread: {}", e)))?;

            tracing::info!(camera_id = %camera_id, "Thread started for camera");
            handles.push(WorkerHandle { camera_id, thread });
        }

        Ok(handles)
    }

    /// Starts every worker, then idles until shutdown is requested. On
    /// shutdown, waits up to the configured grace period for workers to
    /// release their streams and detectors.
    pub fn run(self) -> Result<()> {
        if self.cameras.is_empty() {
            tracing::warn!("No cameras defined in config");
            return Ok(());
        }

        tracing::info!("Starting camera processing for {} camera(s)", self.cameras.len());

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let handles = self.spawn_workers(&done_tx)?;
        drop(done_tx);

        let shutdown = &self.context.shutdown;
        let idle = Duration::from_secs(self.context.settings.supervisor.idle_interval_secs.max(1));
        let mut finished = Vec::new();

        while !shutdown.wait_timeout(idle) {
            finished.extend(done_rx.try_iter());
            tracing::debug!("{}/{} worker(s) running", handles.len() - finished.len(), handles.len());
        }

        tracing::info!("Shutting down camera workers");
        let grace = Duration::from_secs(self.context.settings.supervisor.shutdown_grace_secs);
        finished.extend(done_rx.try_iter());
        let stragglers = wait_for_workers(&done_rx, handles.len() - finished.len(), grace);

        for handle in handles {
            if handle.thread.is_finished() {
                let _ = handle.thread.join();
            } else {
                tracing::warn!(camera_id = %handle.camera_id, "Worker did not stop in time");
            }
        }

        if stragglers > 0 {
            tracing::warn!("{} worker(s) still busy at exit", stragglers);
        }
        Ok(())
    }
}

/// Waits for `pending` completion messages. Returns how many never arrived.
fn wait_for_workers(done: &Receiver<String>, mut pending: usize, grace: Duration) -> usize {
    let deadline = Instant::now() + grace;
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            Ok(camera_id) => {
                tracing::debug!(camera_id = %camera_id, "Worker finished");
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_secs(5));
        assert_eq!(p.backoff(1), Duration::from_secs(10));
        assert_eq!(p.backoff(2), Duration::from_secs(20));
        assert_eq!(p.backoff(4), Duration::from_secs(60));
        assert_eq!(p.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let p = policy();
        for attempt in 0..6 {
            let base = p.backoff(attempt);
            let delay = p.delay_for(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 10);
        }
    }

    #[test]
    fn zero_base_delay_has_no_jitter() {
        let p = RestartPolicy { base_delay: Duration::ZERO, ..policy() };
        assert_eq!(p.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&boxed), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&boxed), "bang");
    }
}
