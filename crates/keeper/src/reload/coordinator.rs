//! Shutdown drain coordination.
//!
//! Tracks in-flight units of work (a reload execution in the watcher, a
//! publish in the issuer) so that a termination signal means "finish the
//! current unit, then exit" rather than being killed mid-write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

/// Counts in-flight operations and waits for them on shutdown.
#[derive(Debug, Clone)]
pub struct DrainCoordinator {
    inflight: Arc<AtomicUsize>,
    max_drain_time: Duration,
}

/// RAII marker for one in-flight operation.
#[derive(Debug)]
pub struct InflightGuard {
    inflight: Arc<AtomicUsize>,
}

impl DrainCoordinator {
    pub fn new(max_drain_time: Duration) -> Self {
        debug!(
            max_drain_time_secs = max_drain_time.as_secs(),
            "Creating drain coordinator"
        );
        Self {
            inflight: Arc::new(AtomicUsize::new(0)),
            max_drain_time,
        }
    }

    /// Mark an operation as started; dropping the guard marks it finished.
    pub fn begin(&self) -> InflightGuard {
        let count = self.inflight.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(inflight = count, "Operation started");
        InflightGuard {
            inflight: Arc::clone(&self.inflight),
        }
    }

    /// Current in-flight count.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Wait for in-flight operations to finish.
    ///
    /// Returns `true` if everything drained within the timeout, `false` if
    /// the timeout was reached with work still in flight.
    pub async fn wait_idle(&self) -> bool {
        let start = Instant::now();
        let initial = self.inflight();

        if initial == 0 {
            return true;
        }

        info!(
            inflight = initial,
            max_drain_time_secs = self.max_drain_time.as_secs(),
            "Draining in-flight work before shutdown"
        );

        while self.inflight() > 0 {
            if start.elapsed() > self.max_drain_time {
                warn!(
                    remaining = self.inflight(),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, work still in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "All in-flight work drained"
        );
        true
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let count = self.inflight.fetch_sub(1, Ordering::Relaxed) - 1;
        trace!(inflight = count, "Operation completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_with_no_work() {
        let coordinator = DrainCoordinator::new(Duration::from_secs(1));
        assert!(coordinator.wait_idle().await);
    }

    #[tokio::test]
    async fn test_guard_tracks_inflight() {
        let coordinator = DrainCoordinator::new(Duration::from_secs(1));

        let a = coordinator.begin();
        let b = coordinator.begin();
        assert_eq!(coordinator.inflight(), 2);

        drop(a);
        assert_eq!(coordinator.inflight(), 1);

        drop(b);
        assert!(coordinator.wait_idle().await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_slow_work() {
        let coordinator = DrainCoordinator::new(Duration::from_secs(5));

        let guard = coordinator.begin();
        let background = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(guard);

        assert!(background.await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let coordinator = DrainCoordinator::new(Duration::from_millis(100));
        let _guard = coordinator.begin();
        assert!(!coordinator.wait_idle().await);
    }
}
