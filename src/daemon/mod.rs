//! The daemon core: wires the Account Supervisor, Work Dispatcher, Message
//! Processor, LLM Client, State Store and Webhook Dispatcher together behind
//! a small external control API.

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod inflight;
pub mod processor;
pub mod prompt;
pub mod state;
pub mod supervisor;
pub mod watcher;
pub mod webhook;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::{AccountConfig, DaemonConfig, WebhookEvent};
use crate::llm::client::{LlmClient, PromptContent, ReqwestTransport};
use crate::llm::ratelimit::ProviderStats;
use crate::models::audit::ActivityFilter;
use crate::models::{AuditEntry, DeadLetterEntry};
use crate::services::{NullTextExtractor, NullVirusScanner};

pub use error::{MailpilotError, PipelineError};
pub use state::StateStore;
pub use supervisor::{AccountStatus, DaemonContext};
pub use webhook::{WebhookDispatcher, WebhookPayload};

const DEAD_LETTER_TICK: Duration = Duration::from_secs(60);
const PRUNE_TICK: Duration = Duration::from_secs(3600);
const HEALTH_CHECK_TICK: Duration = Duration::from_secs(5 * 60);
const HEALTH_PING_PROMPT: &str =
    "Respond with exactly {\"actions\":[{\"type\":\"noop\"}]} and nothing else.";

/// Snapshot returned by `stats()`: per-account status, per-provider
/// request/health stats, and the outstanding dead-letter count.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub accounts: Vec<AccountStatus>,
    pub providers: Vec<ProviderStats>,
    pub dead_letter_count: i64,
}

type StatsBroadcaster = Arc<dyn Fn(&Stats) + Send + Sync>;
type ActivityBroadcaster = Arc<dyn Fn(&AuditEntry) + Send + Sync>;
type LogBroadcaster = Arc<dyn Fn(&str) + Send + Sync>;
type AccountUpdateBroadcaster = Arc<dyn Fn(&AccountStatus) + Send + Sync>;

#[derive(Default)]
struct Broadcasters {
    stats: Option<StatsBroadcaster>,
    activity: Option<ActivityBroadcaster>,
    log: Option<LogBroadcaster>,
    account_update: Option<AccountUpdateBroadcaster>,
}

/// The daemon core handle. Constructed with [`Mailpilot::new`], then driven
/// with [`Mailpilot::run`], which blocks until a graceful shutdown completes.
/// All other methods (`pause`, `resume`, `reconnect`, `trigger_process`,
/// `stats`, `activity`, `dead_letters`, `retry_dead_letter`) are safe to call
/// concurrently with `run` from another task.
pub struct Mailpilot {
    ctx: Arc<DaemonContext>,
    configured_accounts: Vec<AccountConfig>,
    accounts: DashMap<String, Arc<supervisor::AccountSupervisor>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_requested: Notify,
    shutdown_done: AtomicBool,
    broadcasters: std::sync::Mutex<Broadcasters>,
}

impl Mailpilot {
    /// Builds the daemon core from a loaded [`DaemonConfig`]. Connects the
    /// state store; does not yet connect to any IMAP account or spawn any
    /// task — that happens in [`Mailpilot::run`].
    pub async fn new(config: DaemonConfig) -> Result<Arc<Self>, MailpilotError> {
        let store = StateStore::connect(&config.database_path).await?;
        let llm = LlmClient::new(Arc::new(ReqwestTransport::new()));
        let providers: HashMap<String, crate::config::LlmProviderConfig> =
            config.providers.iter().cloned().map(|p| (p.name.clone(), p)).collect();

        let ctx = Arc::new(DaemonContext {
            factory: make_factory(),
            store,
            llm,
            webhook: WebhookDispatcher::new(),
            global: config.global.clone(),
            providers,
            extractor: Box::new(NullTextExtractor),
            virus_scanner: Box::new(NullVirusScanner),
            shutdown: Arc::new(AtomicBool::new(false)),
            inflight: inflight::InFlightTracker::new(),
            token_refresher: tokio::sync::RwLock::new(None),
        });

        Ok(Arc::new(Self {
            ctx,
            configured_accounts: config.accounts,
            accounts: DashMap::new(),
            joins: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            shutdown_requested: Notify::new(),
            shutdown_done: AtomicBool::new(false),
            broadcasters: std::sync::Mutex::new(Broadcasters::default()),
        }))
    }

    pub fn set_stats_broadcaster(&self, f: impl Fn(&Stats) + Send + Sync + 'static) {
        self.broadcasters.lock().unwrap().stats = Some(Arc::new(f));
    }

    pub fn set_activity_broadcaster(&self, f: impl Fn(&AuditEntry) + Send + Sync + 'static) {
        self.broadcasters.lock().unwrap().activity = Some(Arc::new(f));
    }

    pub fn set_log_broadcaster(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.broadcasters.lock().unwrap().log = Some(Arc::new(f));
    }

    pub fn set_account_update_broadcaster(&self, f: impl Fn(&AccountStatus) + Send + Sync + 'static) {
        self.broadcasters.lock().unwrap().account_update = Some(Arc::new(f));
    }

    /// Wires a [`TokenRefresher`] for `AuthMode::Oauth2` accounts to use when
    /// (re)connecting. Nullable like the broadcasters above; without one,
    /// an oauth2 account falls back to treating its configured `password`
    /// field as an already-obtained static token (`spec.md` §1 scopes the
    /// real refresh-token HTTP flow out of this crate).
    pub async fn set_token_refresher(&self, refresher: impl crate::services::TokenRefresher + 'static) {
        *self.ctx.token_refresher.write().await = Some(Box::new(refresher));
    }

    fn log_line(&self, line: &str) {
        let cb = self.broadcasters.lock().unwrap().log.clone();
        if let Some(cb) = cb {
            cb(line);
        }
    }

    /// Starts every configured account, spawns the cross-cutting background
    /// ticks (dead-letter retry scheduler, pruning, provider health), and
    /// blocks until a graceful shutdown completes.
    pub async fn run(self: &Arc<Self>) -> Result<(), MailpilotError> {
        info!("mailpilot starting with {} account(s)", self.configured_accounts.len());
        self.log_line("mailpilot starting");

        for account in self.configured_accounts.clone() {
            self.spawn_account(account).await;
        }

        self.dispatch_global_webhook(WebhookEvent::Startup, None).await;

        {
            let mut background = self.background.lock().await;
            background.push(self.spawn_dead_letter_scheduler());
            background.push(self.spawn_pruning_tick());
            background.push(self.spawn_health_checker());
        }

        self.shutdown_requested.notified().await;
        self.shutdown().await;
        Ok(())
    }

    async fn spawn_account(self: &Arc<Self>, account: AccountConfig) {
        let name = account.name.clone();
        let (supervisor, join) = supervisor::AccountSupervisor::start(account, self.ctx.clone());
        self.accounts.insert(name, supervisor);
        self.joins.lock().await.push(join);
    }

    fn spawn_dead_letter_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEAD_LETTER_TICK);
            loop {
                tick.tick().await;
                if this.ctx.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                this.run_dead_letter_tick().await;
            }
        })
    }

    async fn run_dead_letter_tick(self: &Arc<Self>) {
        let due = match self.ctx.store.due_dead_letters(self.ctx.global.retry.max_attempts).await {
            Ok(due) => due,
            Err(e) => {
                warn!("failed to query due dead letters: {e}");
                return;
            }
        };
        for entry in due {
            self.retry_one_dead_letter(entry).await;
        }
    }

    async fn retry_one_dead_letter(self: &Arc<Self>, entry: DeadLetterEntry) {
        if let Err(e) = self.ctx.store.mark_dead_letter_retrying(entry.id).await {
            warn!("failed to mark dead letter {} retrying: {e}", entry.id);
            return;
        }

        let Some(supervisor) = self.accounts.get(&entry.account_name).map(|e| e.value().clone()) else {
            warn!("dead letter {} references unknown account '{}'", entry.id, entry.account_name);
            return;
        };

        match supervisor.retry_dead_letter(&self.ctx, &entry).await {
            Ok(true) => {
                if let Err(e) = self.ctx.store.mark_dead_letter_success(entry.id).await {
                    warn!("failed to mark dead letter {} resolved: {e}", entry.id);
                }
            }
            Ok(false) | Err(_) => {
                if let Err(e) = self.ctx.store.reschedule_dead_letter(&entry, &self.ctx.global.retry).await {
                    warn!("failed to reschedule dead letter {}: {e}", entry.id);
                    return;
                }
                if entry.attempts + 1 >= self.ctx.global.retry.max_attempts {
                    let payload = WebhookPayload::new(WebhookEvent::RetryExhausted)
                        .with_account(entry.account_name.clone())
                        .with_message_id(entry.message_id.clone());
                    self.ctx.webhook.dispatch(&self.ctx.global.webhooks, payload).await;
                }
            }
        }
    }

    fn spawn_pruning_tick(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PRUNE_TICK);
            loop {
                tick.tick().await;
                if this.ctx.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let global = &this.ctx.global;
                if let Err(e) = this
                    .ctx
                    .store
                    .prune(global.processed_ttl.as_duration(), global.audit_retention.as_duration())
                    .await
                {
                    warn!("housekeeping prune failed: {e}");
                }
            }
        })
    }

    fn spawn_health_checker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEALTH_CHECK_TICK);
            loop {
                tick.tick().await;
                if this.ctx.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                this.run_health_checks().await;
            }
        })
    }

    async fn run_health_checks(&self) {
        for provider in self.ctx.providers.values() {
            let is_stale = match self.ctx.llm.health(&provider.name).await {
                Some(health) => health.is_stale(chrono::Utc::now()),
                None => true,
            };
            if !is_stale {
                continue;
            }
            let _ = self
                .ctx
                .llm
                .classify(provider, &provider.default_model, PromptContent::Text(HEALTH_PING_PROMPT.to_string()), 0.0)
                .await;
        }
    }

    /// Idempotent; returns `AccountNotFound` for unknown accounts.
    pub fn pause(&self, account: &str) -> Result<(), MailpilotError> {
        self.with_account(account, |s| s.pause())
    }

    pub fn resume(&self, account: &str) -> Result<(), MailpilotError> {
        self.with_account(account, |s| s.resume())
    }

    pub fn reconnect(&self, account: &str) -> Result<(), MailpilotError> {
        self.with_account(account, |s| s.reconnect())
    }

    /// Subject to the per-folder 5 s debounce in the Work Dispatcher.
    pub fn trigger_process(&self, account: &str, folder: Option<&str>) -> Result<(), MailpilotError> {
        self.with_account(account, |s| s.trigger(folder))
    }

    fn with_account(&self, account: &str, f: impl FnOnce(&supervisor::AccountSupervisor)) -> Result<(), MailpilotError> {
        let entry = self.accounts.get(account).ok_or_else(|| MailpilotError::AccountNotFound(account.to_string()))?;
        f(entry.value());
        Ok(())
    }

    pub async fn stats(&self) -> Stats {
        let accounts: Vec<AccountStatus> = self.accounts.iter().map(|e| e.value().status()).collect();

        let mut providers = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for entry in self.accounts.iter() {
            let account = entry.value().config();
            let Some(provider) = self.ctx.providers.get(&account.llm.provider) else { continue };
            let model = account.llm.model.clone().unwrap_or_else(|| provider.default_model.clone());
            if !seen.insert((provider.name.clone(), model.clone())) {
                continue;
            }
            providers.push(self.ctx.llm.stats(provider, &model).await);
        }

        let dead_letter_count = self.ctx.store.dead_letter_count().await.unwrap_or(0);

        let stats = Stats { accounts, providers, dead_letter_count };
        let cb = self.broadcasters.lock().unwrap().stats.clone();
        if let Some(cb) = cb {
            cb(&stats);
        }
        stats
    }

    pub async fn activity(&self, filter: ActivityFilter) -> Result<Vec<AuditEntry>, MailpilotError> {
        Ok(self.ctx.store.activity(&filter).await?)
    }

    pub async fn dead_letters(&self, account: Option<&str>) -> Result<Vec<DeadLetterEntry>, MailpilotError> {
        Ok(self.ctx.store.dead_letters(account).await?)
    }

    /// Manual retry of one dead-letter entry, independent of the scheduler
    /// tick.
    pub async fn retry_dead_letter(&self, id: i64) -> Result<bool, MailpilotError> {
        let entry = self.ctx.store.dead_letter_by_id(id).await?.ok_or(MailpilotError::DeadLetterNotFound(id))?;
        let supervisor = self
            .accounts
            .get(&entry.account_name)
            .map(|e| e.value().clone())
            .ok_or_else(|| MailpilotError::AccountNotFound(entry.account_name.clone()))?;

        if let Err(e) = self.ctx.store.mark_dead_letter_retrying(entry.id).await {
            warn!("failed to mark dead letter {id} retrying: {e}");
        }
        match supervisor.retry_dead_letter(&self.ctx, &entry).await {
            Ok(true) => {
                self.ctx.store.mark_dead_letter_success(entry.id).await?;
                Ok(true)
            }
            Ok(false) => {
                self.ctx.store.reschedule_dead_letter(&entry, &self.ctx.global.retry).await?;
                Ok(false)
            }
            Err(e) => {
                self.ctx.store.reschedule_dead_letter(&entry, &self.ctx.global.retry).await?;
                Err(MailpilotError::Pipeline(e))
            }
        }
    }

    /// Requests a graceful shutdown; returns immediately. `run` completes
    /// once the in-flight drain finishes.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.notify_one();
    }

    async fn shutdown(self: &Arc<Self>) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("mailpilot shutting down");
        self.ctx.shutdown.store(true, Ordering::SeqCst);
        self.dispatch_global_webhook(WebhookEvent::Shutdown, None).await;

        let shutdown_cfg = &self.ctx.global.shutdown;
        let drained = self.ctx.inflight.wait_for_all(shutdown_cfg.timeout.as_duration()).await;
        if !drained {
            warn!(
                "shutdown timeout ({:?}) elapsed with {} operation(s) still in flight; aborting remaining tasks",
                shutdown_cfg.timeout.as_duration(),
                self.ctx.inflight.count()
            );
        }

        for entry in self.accounts.iter() {
            entry.value().stop();
        }

        let mut joins = self.joins.lock().await;
        for join in joins.drain(..) {
            let _ = tokio::time::timeout(shutdown_cfg.force_after.as_duration(), join).await;
        }

        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            handle.abort();
        }
    }

    async fn dispatch_global_webhook(&self, event: WebhookEvent, error: Option<String>) {
        let mut payload = WebhookPayload::new(event);
        if let Some(error) = error {
            payload = payload.with_error(error);
        }
        self.ctx.webhook.dispatch(&self.ctx.global.webhooks, payload).await;
    }
}

/// Builds the default session factory, used for accounts whose credentials
/// come entirely from their own [`AccountConfig`] (the common case); kept as
/// a factory so tests can substitute a different default if ever needed.
fn make_factory() -> crate::imap::CloneableImapSessionFactory {
    use crate::imap::error::ImapError;
    let default_factory: crate::imap::ImapSessionFactory = Box::new(|| {
        Box::pin(async {
            Err(ImapError::Connection(
                "default IMAP session factory is not configured; every account must specify its own endpoint".to_string(),
            ))
        })
    });
    crate::imap::CloneableImapSessionFactory::new(default_factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;

    async fn empty_ctx() -> Arc<DaemonContext> {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        Arc::new(DaemonContext {
            factory: make_factory(),
            store,
            llm: LlmClient::new(Arc::new(ReqwestTransport::new())),
            webhook: WebhookDispatcher::new(),
            global: GlobalConfig::default(),
            providers: HashMap::new(),
            extractor: Box::new(NullTextExtractor),
            virus_scanner: Box::new(NullVirusScanner),
            shutdown: Arc::new(AtomicBool::new(false)),
            inflight: inflight::InFlightTracker::new(),
            token_refresher: tokio::sync::RwLock::new(None),
        })
    }

    #[tokio::test]
    async fn unknown_account_operations_return_not_found() {
        let ctx = empty_ctx().await;
        let mailpilot = Arc::new(Mailpilot {
            ctx,
            configured_accounts: Vec::new(),
            accounts: DashMap::new(),
            joins: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            shutdown_requested: Notify::new(),
            shutdown_done: AtomicBool::new(false),
            broadcasters: std::sync::Mutex::new(Broadcasters::default()),
        });
        assert!(matches!(mailpilot.pause("ghost"), Err(MailpilotError::AccountNotFound(_))));
        assert!(matches!(mailpilot.trigger_process("ghost", None), Err(MailpilotError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn stats_snapshot_starts_empty() {
        let ctx = empty_ctx().await;
        let mailpilot = Mailpilot {
            ctx,
            configured_accounts: Vec::new(),
            accounts: DashMap::new(),
            joins: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            shutdown_requested: Notify::new(),
            shutdown_done: AtomicBool::new(false),
            broadcasters: std::sync::Mutex::new(Broadcasters::default()),
        };
        let stats = mailpilot.stats().await;
        assert!(stats.accounts.is_empty());
        assert_eq!(stats.dead_letter_count, 0);
    }
}
