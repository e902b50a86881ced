//! Per-provider sliding-window rate limiter, request counters and health
//! tracking, with one record per provider behind a single mutex.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);
const STALE_AFTER: Duration = Duration::from_secs(10 * 60);
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// `spec.md` §3 `ProviderHealth`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_successful_request: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            last_successful_request: None,
            consecutive_failures: 0,
        }
    }
}

impl ProviderHealth {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let newest = match (self.last_check, self.last_successful_request) {
            (None, None) => return true,
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
        };
        now - newest > chrono::Duration::from_std(STALE_AFTER).unwrap()
    }

    fn record_success(&mut self, now: DateTime<Utc>) {
        self.healthy = true;
        self.last_successful_request = Some(now);
        self.last_check = Some(now);
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.last_check = Some(now);
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            self.healthy = false;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub model: String,
    pub requests_today: u64,
    pub requests_total: u64,
    pub requests_last_minute: usize,
    pub rate_limited: bool,
    pub rpm_limit: Option<u32>,
    pub healthy: bool,
    pub health_stale: bool,
}

struct Counters {
    total: u64,
    today: u64,
    last_reset: NaiveDate,
}

impl Counters {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total: 0,
            today: 0,
            last_reset: now.date_naive(),
        }
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.last_reset {
            self.today = 0;
            self.last_reset = now.date_naive();
        }
        self.today += 1;
        self.total += 1;
    }
}

struct Inner {
    window: VecDeque<Instant>,
    retry_after: Option<Instant>,
    counters: Counters,
    health: ProviderHealth,
    rpm_limit: Option<u32>,
}

/// Rate limiter, request accounting and health record for a single provider
/// endpoint, owned behind one `tokio::sync::Mutex` per `spec.md` §5 "Shared
/// Resource Policy".
pub struct ProviderState {
    name: String,
    inner: Mutex<Inner>,
}

impl ProviderState {
    pub fn new(name: impl Into<String>, rpm_limit: Option<u32>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                window: VecDeque::new(),
                retry_after: None,
                counters: Counters::new(Utc::now()),
                health: ProviderHealth::default(),
                rpm_limit,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission control per `spec.md` §4.7 "Acquire semantics": waits out
    /// any parked `retry_after` deadline, then waits out the sliding window
    /// if an RPM limit is configured, then records this acquisition.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                if let Some(deadline) = inner.retry_after {
                    if deadline > Instant::now() {
                        Some(deadline - Instant::now())
                    } else {
                        inner.retry_after = None;
                        None
                    }
                } else {
                    None
                }
            };
            match wait {
                Some(d) => tokio::time::sleep(d).await,
                None => break,
            }
        }

        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                let cutoff = now - WINDOW;
                while matches!(inner.window.front(), Some(t) if *t < cutoff) {
                    inner.window.pop_front();
                }
                match inner.rpm_limit {
                    Some(limit) if inner.window.len() as u32 >= limit => {
                        let oldest = *inner.window.front().unwrap();
                        Some((oldest + WINDOW + Duration::from_millis(100)) - now)
                    }
                    _ => None,
                }
            };
            match wait {
                Some(d) => tokio::time::sleep(d).await,
                None => break,
            }
        }

        let mut inner = self.inner.lock().await;
        inner.window.push_back(Instant::now());
    }

    /// Parks the limiter until `retry_after` elapses, per the `Retry-After`
    /// header handling in `spec.md` §4.6 step 4.
    pub async fn park_until(&self, delay: Duration) {
        let mut inner = self.inner.lock().await;
        inner.retry_after = Some(Instant::now() + delay);
    }

    pub async fn record_request(&self) {
        let mut inner = self.inner.lock().await;
        inner.counters.bump(Utc::now());
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.health.record_success(Utc::now());
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.health.record_failure(Utc::now());
    }

    pub async fn health(&self) -> ProviderHealth {
        self.inner.lock().await.health.clone()
    }

    pub async fn stats(&self, model: &str) -> ProviderStats {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        ProviderStats {
            name: self.name.clone(),
            model: model.to_string(),
            requests_today: inner.counters.today,
            requests_total: inner.counters.total,
            requests_last_minute: inner.window.len(),
            rate_limited: inner.retry_after.map(|d| d > Instant::now()).unwrap_or(false),
            rpm_limit: inner.rpm_limit,
            healthy: inner.health.healthy,
            health_stale: inner.health.is_stale(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_prunes_window_on_release() {
        let state = ProviderState::new("test", None);
        state.acquire().await;
        state.acquire().await;
        let stats = state.stats("gpt").await;
        assert_eq!(stats.requests_last_minute, 2);
    }

    #[tokio::test]
    async fn three_failures_flip_unhealthy() {
        let state = ProviderState::new("test", None);
        for _ in 0..3 {
            state.record_failure().await;
        }
        assert!(!state.health().await.healthy);
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let state = ProviderState::new("test", None);
        state.record_failure().await;
        state.record_failure().await;
        state.record_success().await;
        let health = state.health().await;
        assert!(health.healthy);
        assert_eq!(health.consecutive_failures, 0);
    }
}
