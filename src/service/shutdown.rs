use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Process-wide stop request shared by the supervisor and every worker.
///
/// Nothing is ever sent on the stop channel. Requesting shutdown drops the
/// only sender, which disconnects every receiver at once, so waits go
/// through [`Shutdown::wait_timeout`] and a pending stop cuts any reconnect
/// or restart delay short.
#[derive(Clone)]
pub struct Shutdown {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(trigger))),
            signal,
        }
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.trigger.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_requested(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `duration` or until shutdown is requested.
    /// Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        match self.signal.recv_timeout(duration) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) => self.is_requested(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_times_out_without_request() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
        assert!(!shutdown.is_requested());
    }

    #[test]
    fn request_wakes_waiters_early() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.request();
        });

        let start = Instant::now();
        assert!(shutdown.wait_timeout(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }

    #[test]
    fn zero_wait_returns_immediately() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::ZERO));
        shutdown.request();
        assert!(shutdown.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn every_clone_sees_a_request_and_repeats_are_harmless() {
        let shutdown = Shutdown::new();
        let workers: Vec<_> = (0..3).map(|_| shutdown.clone()).collect();

        workers[1].request();
        workers[2].request();

        assert!(shutdown.is_requested());
        assert!(workers.iter().all(Shutdown::is_requested));
    }
}
