//! Cooperative shutdown: a shared stop flag plus joining of registered threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest single sleep slice before the stop flag is re-checked.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Clone-safe handle to the stop flag.
#[derive(Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop. Returns `true` only for the first request.
    pub fn stop(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `dur`, waking early if stop is requested.
    ///
    /// Returns `true` if stop was requested.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Owns the stop flag and the capture threads that observe it.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: StopToken,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    /// Register a thread to be joined on shutdown.
    pub fn register(&self, name: &str, handle: JoinHandle<()>) {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), handle));
    }

    /// Set the stop flag. Safe to call any number of times.
    pub fn stop(&self) {
        if self.token.stop() {
            tracing::info!("stop requested");
        }
    }

    /// Join every registered thread. Returns how many were joined.
    ///
    /// Threads are drained from the registry, so a second call is a no-op.
    pub fn join_all(&self) -> usize {
        let threads: Vec<_> = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = threads.len();
        for (name, handle) in threads {
            match handle.join() {
                Ok(()) => tracing::debug!(thread = %name, "thread joined"),
                Err(_) => tracing::error!(thread = %name, "thread panicked"),
            }
        }
        count
    }

    /// Stop and join.
    pub fn shutdown(&self) -> usize {
        self.stop();
        self.join_all()
    }
}

/// Runs [`ShutdownCoordinator::shutdown`] when dropped, on every exit path.
pub struct ExitHandler(pub Arc<ShutdownCoordinator>);

impl Drop for ExitHandler {
    fn drop(&mut self) {
        let joined = self.0.shutdown();
        tracing::info!(joined, "capture threads stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let token = StopToken::new();
        assert!(!token.is_stopped());
        assert!(token.stop());
        assert!(!token.stop());
        assert!(token.is_stopped());
    }

    #[test]
    fn test_sleep_wakes_on_stop() {
        let token = StopToken::new();
        let remote = token.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.stop();
        });
        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        t.join().unwrap();
    }

    #[test]
    fn test_sleep_full_duration() {
        let token = StopToken::new();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_join_all_drains() {
        let coordinator = ShutdownCoordinator::new();
        for name in ["a", "b"] {
            let token = coordinator.token();
            let handle = std::thread::spawn(move || while !token.sleep(Duration::from_millis(5)) {});
            coordinator.register(name, handle);
        }
        assert_eq!(coordinator.shutdown(), 2);
        assert_eq!(coordinator.shutdown(), 0);
    }

    #[test]
    fn test_exit_handler_stops_on_drop() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let token = coordinator.token();
        drop(ExitHandler(Arc::clone(&coordinator)));
        assert!(token.is_stopped());
    }
}
