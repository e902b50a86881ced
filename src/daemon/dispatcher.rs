//! Work Dispatcher: per-folder debounce and coalescing behind a
//! `dashmap::DashMap`, bounded-concurrency batches handed to the Message
//! Processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{AccountConfig, GlobalConfig, LlmProviderConfig};
use crate::imap::session::AsyncImapOps;

use super::inflight::{InFlightGuard, InFlightTracker};
use super::processor::MessageProcessor;

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct KeyState {
    processing: bool,
    redo: bool,
}

/// Per-key (one dispatcher instance per account, folder is the key) debounce
/// and coalescing state, plus an observability snapshot of the queue.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStatus {
    pub processing: bool,
    pub pending: bool,
}

pub struct WorkDispatcher<'a, T: AsyncImapOps> {
    processor: MessageProcessor<'a, T>,
    session: &'a T,
    inflight: &'a InFlightTracker,
    last_triggered: DashMap<String, Instant>,
    key_state: DashMap<String, Arc<Mutex<KeyState>>>,
    shutdown: Arc<AtomicBool>,
}

impl<'a, T: AsyncImapOps> WorkDispatcher<'a, T> {
    pub fn new(
        session: &'a T,
        processor: MessageProcessor<'a, T>,
        inflight: &'a InFlightTracker,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            processor,
            session,
            inflight,
            last_triggered: DashMap::new(),
            key_state: DashMap::new(),
            shutdown,
        }
    }

    pub fn status(&self, folder: &str) -> QueueStatus {
        match self.key_state.get(folder) {
            Some(state) => match state.try_lock() {
                Ok(state) => QueueStatus { processing: state.processing, pending: state.redo },
                Err(_) => QueueStatus { processing: true, pending: false },
            },
            None => QueueStatus::default(),
        }
    }

    /// Handles one "process this folder now" trigger: drops it if inside
    /// the debounce window, coalesces it into a redo if a cycle for this
    /// folder is already running, otherwise runs (possibly several, if
    /// redo bits accumulate) processing cycles until no redo remains.
    pub async fn trigger(
        &self,
        account: &AccountConfig,
        provider: &LlmProviderConfig,
        global: &GlobalConfig,
        folder: &str,
    ) {
        let now = Instant::now();
        if let Some(last) = self.last_triggered.get(folder) {
            if now.duration_since(*last) < DEBOUNCE_WINDOW {
                debug!("dropping debounced trigger for folder '{folder}'");
                return;
            }
        }

        let state_lock = self
            .key_state
            .entry(folder.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(KeyState::default())))
            .clone();

        {
            let mut state = state_lock.lock().await;
            if state.processing {
                state.redo = true;
                return;
            }
            state.processing = true;
        }
        self.last_triggered.insert(folder.to_string(), now);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.run_cycle(account, provider, global, folder).await {
                warn!("processing cycle for folder '{folder}' failed: {e}");
            }

            let mut state = state_lock.lock().await;
            if state.redo && !self.shutdown.load(Ordering::SeqCst) {
                state.redo = false;
                continue;
            }
            state.processing = false;
            break;
        }
    }

    async fn run_cycle(
        &self,
        account: &AccountConfig,
        provider: &LlmProviderConfig,
        global: &GlobalConfig,
        folder: &str,
    ) -> Result<(), crate::imap::error::ImapError> {
        self.session.select_folder(folder).await?;
        let uids = self.session.search_emails("UNSEEN").await?;
        if uids.is_empty() {
            return Ok(());
        }

        let emails = self.session.fetch_emails(&uids).await?;
        let mut targets: Vec<(u32, String)> = emails
            .into_iter()
            .filter_map(|e| e.envelope.as_ref().and_then(|env| env.message_id.clone()).map(|mid| (e.uid, mid)))
            .collect();
        targets.sort_by_key(|(uid, _)| *uid);

        let batch_size = account.concurrency_limit.max(1);
        for batch in targets.chunks(batch_size) {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("shutdown requested, stopping mid-cycle for folder '{folder}'");
                break;
            }
            let futures = batch.iter().map(|(uid, message_id)| {
                let _guard = InFlightGuard::new(self.inflight);
                async move {
                    let result = self.processor.process(account, provider, global, folder, *uid, message_id).await;
                    drop(_guard);
                    result
                }
            });
            let results = futures::future::join_all(futures).await;
            for result in results {
                if let Err(e) = result {
                    warn!("unexpected pipeline error in folder '{folder}': {e}");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_status_defaults_to_idle() {
        let status = QueueStatus::default();
        assert!(!status.processing);
        assert!(!status.pending);
    }
}
