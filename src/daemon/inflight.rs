//! In-flight operation tracker for graceful shutdown: a single map keyed by
//! operation id, `start`/`complete` are O(1), `wait_for_all` returns true if
//! the map drains within the deadline.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InFlightTracker {
    operations: DashMap<Uuid, Instant>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self { operations: DashMap::new() }
    }

    /// Registers a new in-flight operation and returns its id.
    pub fn start(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.operations.insert(id, Instant::now());
        id
    }

    pub fn complete(&self, id: Uuid) {
        self.operations.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.operations.len()
    }

    /// Polls until the map is empty or `timeout` elapses. Never aborts
    /// outstanding tasks itself; the caller decides what to do if this
    /// returns `false`.
    pub async fn wait_for_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.operations.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// RAII guard that completes its operation when dropped, even on panic or
/// early return from the pipeline.
pub struct InFlightGuard<'a> {
    tracker: &'a InFlightTracker,
    id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    pub fn new(tracker: &'a InFlightTracker) -> Self {
        let id = tracker.start();
        Self { tracker, id }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.complete(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_all_returns_true_when_empty() {
        let tracker = InFlightTracker::new();
        assert!(tracker.wait_for_all(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn guard_completes_on_drop() {
        let tracker = InFlightTracker::new();
        {
            let _guard = InFlightGuard::new(&tracker);
            assert_eq!(tracker.count(), 1);
        }
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn wait_for_all_times_out_while_busy() {
        let tracker = InFlightTracker::new();
        let _guard = InFlightGuard::new(&tracker);
        assert!(!tracker.wait_for_all(Duration::from_millis(20)).await);
    }
}
