//! Account Supervisor (`spec.md` §4.1): owns the lifecycle of one account's
//! IMAP session and its Folder Watchers, reconnecting with indefinite
//! exponential backoff, built directly on `CloneableImapSessionFactory` and
//! `ImapClient` the way the teacher already connects per-account sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{info, warn};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::{AccountConfig, AuthMode, GlobalConfig, LlmProviderConfig, WebhookEvent};
use crate::imap::client::ImapClient;
use crate::imap::error::ImapError;
use crate::imap::session::AsyncImapSessionWrapper;
use crate::imap::CloneableImapSessionFactory;
use crate::llm::client::LlmClient;
use crate::models::DeadLetterEntry;
use crate::services::{TextExtractor, TokenRefresher, VirusScanner};

use super::dispatcher::{QueueStatus, WorkDispatcher};
use super::error::PipelineError;
use super::inflight::InFlightTracker;
use super::processor::MessageProcessor;
use super::state::StateStore;
use super::watcher;
use super::webhook::{WebhookDispatcher, WebhookPayload};

const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const NOOP_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Collaborators shared by every account's supervisor, owned once by
/// [`super::Mailpilot`] and handed around behind an `Arc`.
pub struct DaemonContext {
    pub factory: CloneableImapSessionFactory,
    pub store: StateStore,
    pub llm: LlmClient,
    pub webhook: WebhookDispatcher,
    pub global: GlobalConfig,
    pub providers: HashMap<String, LlmProviderConfig>,
    pub extractor: Box<dyn TextExtractor>,
    pub virus_scanner: Box<dyn VirusScanner>,
    pub shutdown: Arc<AtomicBool>,
    pub inflight: InFlightTracker,
    /// Pluggable per-account access-token source for `AuthMode::Oauth2`
    /// accounts, nullable like the broadcasters (`Mailpilot::set_*`): the
    /// real OAuth2 refresh-token HTTP flow is out of scope for this crate
    /// (`spec.md` §1), but an account configured for `oauth2` auth still
    /// needs a token from *somewhere* to connect, so this seam is wired all
    /// the way to `connect_with_backoff` rather than left unreachable.
    pub token_refresher: RwLock<Option<Box<dyn TokenRefresher>>>,
}

/// Per-account snapshot exposed through `Stats()` (`spec.md` §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountStatus {
    pub name: String,
    pub connected: bool,
    pub paused: bool,
    pub supports_idle: bool,
    pub queues: HashMap<String, QueueStatus>,
}

enum SessionExit {
    Stopped,
    Paused,
    Reconnect,
    Lost,
}

pub struct AccountSupervisor {
    config: AccountConfig,
    paused: AtomicBool,
    connected: AtomicBool,
    supports_idle: AtomicBool,
    stopped: AtomicBool,
    stop_notify: Notify,
    reconnect_notify: Notify,
    watcher_stops: DashMap<String, Arc<Notify>>,
    queue_status: DashMap<String, QueueStatus>,
    trigger_tx: mpsc::UnboundedSender<String>,
    current_client: RwLock<Option<ImapClient<AsyncImapSessionWrapper>>>,
}

impl AccountSupervisor {
    /// Spawns the supervising task and returns both the handle callers use
    /// for control operations and its `JoinHandle`, so the owner can await a
    /// clean exit during shutdown.
    pub fn start(account: AccountConfig, ctx: Arc<DaemonContext>) -> (Arc<Self>, JoinHandle<()>) {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let paused = account.paused;
        let supervisor = Arc::new(Self {
            config: account,
            paused: AtomicBool::new(paused),
            connected: AtomicBool::new(false),
            supports_idle: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            reconnect_notify: Notify::new(),
            watcher_stops: DashMap::new(),
            queue_status: DashMap::new(),
            trigger_tx,
            current_client: RwLock::new(None),
        });

        let task_handle = supervisor.clone();
        let join = tokio::spawn(async move { task_handle.run(ctx, trigger_rx).await });
        (supervisor, join)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Stops all watchers for this account, disconnects, and re-runs
    /// `Start` (`spec.md` §4.1).
    pub fn reconnect(&self) {
        self.reconnect_notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        self.reconnect_notify.notify_waiters();
        for entry in self.watcher_stops.iter() {
            entry.value().notify_one();
        }
    }

    /// `TriggerProcess(account, folder?)`: `None` fans out to every watched
    /// folder (`spec.md` §6).
    pub fn trigger(&self, folder: Option<&str>) {
        match folder {
            Some(folder) => {
                let _ = self.trigger_tx.send(folder.to_string());
            }
            None => {
                for folder in &self.config.folders.watch {
                    let _ = self.trigger_tx.send(folder.clone());
                }
            }
        }
    }

    pub fn status(&self) -> AccountStatus {
        AccountStatus {
            name: self.config.name.clone(),
            connected: self.connected.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            supports_idle: self.supports_idle.load(Ordering::SeqCst),
            queues: self.queue_status.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
        }
    }

    async fn run(self: Arc<Self>, ctx: Arc<DaemonContext>, mut trigger_rx: mpsc::UnboundedReceiver<String>) {
        let mut ever_connected = false;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            while self.paused.load(Ordering::SeqCst) {
                if self.stopped.load(Ordering::SeqCst) {
                    return;
                }
                tokio::select! {
                    _ = self.stop_notify.notified() => {}
                    _ = self.reconnect_notify.notified() => {}
                    _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                }
            }

            let Some(client) = self.connect_with_backoff(&ctx).await else {
                break;
            };
            self.connected.store(true, Ordering::SeqCst);
            *self.current_client.write().await = Some(client.clone());
            info!("account '{}' connected", self.config.name);
            if ever_connected {
                self.dispatch_webhook(&ctx, WebhookEvent::ConnectionRestored, None).await;
            }
            ever_connected = true;

            let supports_idle = client.supports_idle().await.unwrap_or(false);
            self.supports_idle.store(supports_idle, Ordering::SeqCst);

            let Some(provider) = ctx.providers.get(&self.config.llm.provider).cloned() else {
                warn!(
                    "account '{}' references unknown LLM provider '{}'; idling until reconnected",
                    self.config.name, self.config.llm.provider
                );
                let _ = client.logout().await;
                *self.current_client.write().await = None;
                self.connected.store(false, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                    _ = self.stop_notify.notified() => { if self.stopped.load(Ordering::SeqCst) { break; } }
                }
                continue;
            };

            let mut watcher_handles = self.spawn_watchers(supports_idle);

            let exit = self.run_session(&client, &provider, &ctx, &mut trigger_rx).await;

            self.teardown_watchers(&mut watcher_handles).await;
            let _ = client.logout().await;
            *self.current_client.write().await = None;
            self.connected.store(false, Ordering::SeqCst);

            match exit {
                SessionExit::Stopped => break,
                SessionExit::Paused | SessionExit::Reconnect => continue,
                SessionExit::Lost => {
                    self.dispatch_webhook(&ctx, WebhookEvent::ConnectionLost, None).await;
                    continue;
                }
            }
        }

        info!("account '{}' supervisor stopped", self.config.name);
    }

    /// Resolves an access token for `AuthMode::Oauth2` accounts: prefers a
    /// wired-in [`TokenRefresher`] (`Mailpilot::set_token_refresher`),
    /// falling back to treating the configured `password` field as an
    /// already-obtained static token for accounts that bootstrap without one
    /// (a full OAuth2 refresh flow being out of scope per `spec.md` §1).
    async fn oauth_token(&self, ctx: &DaemonContext) -> Option<String> {
        if self.config.imap.auth != AuthMode::Oauth2 {
            return None;
        }
        let refresher = ctx.token_refresher.read().await;
        if let Some(refresher) = refresher.as_ref() {
            match refresher.access_token(&self.config.name).await {
                Ok(token) => return Some(token),
                Err(e) => {
                    warn!("account '{}': token refresh failed: {e}, falling back to the configured password", self.config.name);
                }
            }
        }
        Some(self.config.password.clone())
    }

    async fn connect_with_backoff(&self, ctx: &DaemonContext) -> Option<ImapClient<AsyncImapSessionWrapper>> {
        let mut backoff = CONNECT_BACKOFF_INITIAL;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            let token = self.oauth_token(ctx).await;
            match ctx.factory.create_session_for_account(&self.config, token.as_deref()).await {
                Ok(client) => return Some(client),
                Err(e) if is_certificate_error(&e) => {
                    warn!(
                        "account '{}': TLS certificate error, not retrying: {e}. \
                         Add the server's fingerprint to `imap.trusted_fingerprints` and Reconnect.",
                        self.config.name
                    );
                    tokio::select! {
                        _ = self.reconnect_notify.notified() => {}
                        _ = self.stop_notify.notified() => return None,
                    }
                }
                Err(e) => {
                    warn!("account '{}': connect failed: {e}, retrying in {backoff:?}", self.config.name);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.stop_notify.notified() => return None,
                        _ = self.reconnect_notify.notified() => {}
                    }
                    backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP);
                }
            }
        }
    }

    fn spawn_watchers(&self, supports_idle: bool) -> Vec<JoinHandle<()>> {
        self.config
            .folders
            .watch
            .iter()
            .map(|folder| {
                let stop = Arc::new(Notify::new());
                self.watcher_stops.insert(folder.clone(), stop.clone());
                tokio::spawn(watcher::run(
                    self.config.name.clone(),
                    folder.clone(),
                    self.config.imap.host.clone(),
                    self.config.imap.port,
                    self.config.username.clone(),
                    self.config.password.clone(),
                    self.config.polling_interval.as_duration(),
                    supports_idle,
                    self.trigger_tx.clone(),
                    stop,
                ))
            })
            .collect()
    }

    async fn teardown_watchers(&self, handles: &mut Vec<JoinHandle<()>>) {
        for entry in self.watcher_stops.iter() {
            entry.value().notify_one();
        }
        self.watcher_stops.clear();
        for handle in handles.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    async fn run_session(
        &self,
        client: &ImapClient<AsyncImapSessionWrapper>,
        provider: &LlmProviderConfig,
        ctx: &DaemonContext,
        trigger_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> SessionExit {
        let processor = MessageProcessor {
            session: client.session(),
            store: &ctx.store,
            llm: &ctx.llm,
            virus_scanner: ctx.virus_scanner.as_ref(),
            extractor: ctx.extractor.as_ref(),
            webhook: &ctx.webhook,
        };
        let dispatcher = WorkDispatcher::new(client.session(), processor, &ctx.inflight, ctx.shutdown.clone());

        let mut inflight: FuturesUnordered<BoxFuture<'_, String>> = FuturesUnordered::new();
        let mut health_tick = tokio::time::interval(NOOP_HEALTH_CHECK_INTERVAL);
        health_tick.tick().await;

        loop {
            tokio::select! {
                Some(folder) = trigger_rx.recv() => {
                    if !self.paused.load(Ordering::SeqCst) {
                        self.queue_status.insert(folder.clone(), dispatcher.status(&folder));
                        let account = &self.config;
                        let global = &ctx.global;
                        inflight.push(Box::pin(async move {
                            dispatcher.trigger(account, provider, global, &folder).await;
                            folder
                        }));
                    }
                }
                Some(finished) = inflight.next(), if !inflight.is_empty() => {
                    self.queue_status.insert(finished.clone(), dispatcher.status(&finished));
                }
                _ = health_tick.tick() => {
                    if client.noop().await.is_err() {
                        return SessionExit::Lost;
                    }
                }
                _ = self.reconnect_notify.notified() => return SessionExit::Reconnect,
                _ = self.stop_notify.notified() => return SessionExit::Stopped,
            }

            if self.stopped.load(Ordering::SeqCst) {
                return SessionExit::Stopped;
            }
            if self.paused.load(Ordering::SeqCst) {
                return SessionExit::Paused;
            }
        }
    }

    async fn dispatch_webhook(&self, ctx: &DaemonContext, event: WebhookEvent, error: Option<String>) {
        let mut payload = WebhookPayload::new(event).with_account(self.config.name.clone());
        if let Some(error) = error {
            payload = payload.with_error(error);
        }
        ctx.webhook.dispatch(&self.config.webhooks, payload.clone()).await;
        ctx.webhook.dispatch(&ctx.global.webhooks, payload).await;
    }

    /// Re-runs the Message Processor for a dead-letter entry belonging to
    /// this account (`spec.md` §4.10/§6 `RetryDeadLetter`). Requires a live
    /// session; a disconnected account simply fails the attempt and the
    /// caller reschedules it for the next tick. Uses
    /// `MessageProcessor::process_once`, not `process`: the caller
    /// (`mod.rs::retry_one_dead_letter`) already owns this entry's
    /// reschedule/exhaust lifecycle, so a failure here must propagate as an
    /// `Err` rather than silently opening a second dead-letter row.
    pub async fn retry_dead_letter(
        self: &Arc<Self>,
        ctx: &DaemonContext,
        entry: &DeadLetterEntry,
    ) -> Result<bool, PipelineError> {
        let provider = ctx
            .providers
            .get(&self.config.llm.provider)
            .cloned()
            .ok_or_else(|| PipelineError::other(format!("unknown LLM provider '{}'", self.config.llm.provider)))?;

        let guard = self.current_client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| PipelineError::other(format!("account '{}' is not currently connected", self.config.name)))?;

        let processor = MessageProcessor {
            session: client.session(),
            store: &ctx.store,
            llm: &ctx.llm,
            virus_scanner: ctx.virus_scanner.as_ref(),
            extractor: ctx.extractor.as_ref(),
            webhook: &ctx.webhook,
        };

        processor
            .process_once(&self.config, &provider, &ctx.global, &entry.folder, entry.uid, &entry.message_id)
            .await
    }
}

/// Classifies connection failures as TLS-certificate errors per `spec.md`
/// §4.1/§7: these are not retried automatically. `ImapError::Tls` is the
/// only TLS-related variant the IMAP layer surfaces, so it doubles as the
/// certificate-error class here (see `DESIGN.md`).
fn is_certificate_error(e: &ImapError) -> bool {
    matches!(e, ImapError::Tls(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_errors_are_classified_as_certificate_errors() {
        assert!(is_certificate_error(&ImapError::Tls("self signed certificate".into())));
        assert!(!is_certificate_error(&ImapError::Connection("refused".into())));
        assert!(!is_certificate_error(&ImapError::Auth("bad password".into())));
    }
}
