//! Persistent state store (`spec.md` §4.10): processed-message dedup, the
//! audit log, and the dead-letter queue with its retry scheduler, backed by
//! `sqlx` SQLite the way the teacher's `outbox_queue` module uses it for its
//! own durable queue. Uses runtime-checked `sqlx::query`/`query_as` rather
//! than the `query!` macro family — see `DESIGN.md`.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::config::RetryConfig;
use crate::models::{Action, AuditEntry, DeadLetterEntry, RetryStatus};
use crate::models::audit::ActivityFilter;

/// Owns the SQLite connection pool and schema for one daemon instance.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Builds a store on an existing pool (used by tests with an in-memory
    /// or tempfile-backed database already opened).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS processed_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                account_name TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                UNIQUE(message_id, account_name)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_processed_messages_message_id ON processed_messages(message_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                account_name TEXT NOT NULL,
                actions TEXT NOT NULL,
                llm_provider TEXT,
                llm_model TEXT,
                subject TEXT,
                confidence REAL,
                reasoning TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_account ON audit_log(account_name)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log(created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dead_letter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                account_name TEXT NOT NULL,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                retry_status TEXT NOT NULL,
                next_retry_at TEXT,
                last_retry_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dead_letter_account ON dead_letter(account_name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Returns true if `(message_id, account_name)` has already been
    /// processed.
    pub async fn is_processed(&self, message_id: &str, account_name: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM processed_messages WHERE message_id = ? AND account_name = ?")
            .bind(message_id)
            .bind(account_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Marks a message processed. Uses `INSERT OR IGNORE` so a second,
    /// racing insert fails silently rather than erroring (`spec.md` §5).
    pub async fn mark_processed(&self, message_id: &str, account_name: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO processed_messages (message_id, account_name, processed_at) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(account_name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append_audit(
        &self,
        message_id: &str,
        account_name: &str,
        actions: &[Action],
        llm_provider: Option<&str>,
        llm_model: Option<&str>,
        subject: Option<&str>,
        confidence: Option<f32>,
        reasoning: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let actions_json = serde_json::to_string(actions).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO audit_log
                (message_id, account_name, actions, llm_provider, llm_model, subject, confidence, reasoning, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(account_name)
        .bind(actions_json)
        .bind(llm_provider)
        .bind(llm_model)
        .bind(subject)
        .bind(confidence)
        .bind(reasoning)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    fn row_to_audit(row: &SqliteRow) -> Result<AuditEntry, sqlx::Error> {
        let actions_json: String = row.try_get("actions")?;
        let actions: Vec<Action> = serde_json::from_str(&actions_json).unwrap_or_default();
        let created_at: String = row.try_get("created_at")?;
        Ok(AuditEntry {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            account_name: row.try_get("account_name")?,
            actions,
            llm_provider: row.try_get("llm_provider")?,
            llm_model: row.try_get("llm_model")?,
            subject: row.try_get("subject")?,
            confidence: row.try_get("confidence")?,
            reasoning: row.try_get("reasoning")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    pub async fn activity(&self, filter: &ActivityFilter) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let limit = filter.limit.unwrap_or(100);
        let rows = match (&filter.account_name, &filter.since) {
            (Some(account), Some(since)) => {
                sqlx::query(
                    "SELECT * FROM audit_log WHERE account_name = ? AND created_at >= ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(account)
                .bind(since.to_rfc3339())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(account), None) => {
                sqlx::query("SELECT * FROM audit_log WHERE account_name = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(account)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(since)) => {
                sqlx::query("SELECT * FROM audit_log WHERE created_at >= ? ORDER BY created_at DESC LIMIT ?")
                    .bind(since.to_rfc3339())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM audit_log ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_audit).collect()
    }

    pub async fn enqueue_dead_letter(
        &self,
        message_id: &str,
        account_name: &str,
        folder: &str,
        uid: u32,
        error: &str,
        retry: &RetryConfig,
    ) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        let next_retry_at = now + chrono::Duration::from_std(retry.initial_delay.as_duration()).unwrap();
        let result = sqlx::query(
            "INSERT INTO dead_letter
                (message_id, account_name, folder, uid, error, attempts, created_at, retry_status, next_retry_at)
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(account_name)
        .bind(folder)
        .bind(uid as i64)
        .bind(error)
        .bind(now.to_rfc3339())
        .bind(RetryStatus::Pending.as_str())
        .bind(next_retry_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    fn row_to_dead_letter(row: &SqliteRow) -> Result<DeadLetterEntry, sqlx::Error> {
        let parse = |s: Option<String>| -> Option<DateTime<Utc>> {
            s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc)))
        };
        let retry_status: String = row.try_get("retry_status")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(DeadLetterEntry {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            account_name: row.try_get("account_name")?,
            folder: row.try_get("folder")?,
            uid: row.try_get::<i64, _>("uid")? as u32,
            error: row.try_get("error")?,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            resolved_at: parse(row.try_get("resolved_at")?),
            retry_status: retry_status.parse().unwrap_or(RetryStatus::Pending),
            next_retry_at: parse(row.try_get("next_retry_at")?),
            last_retry_at: parse(row.try_get("last_retry_at")?),
        })
    }

    pub async fn dead_letters(&self, account_name: Option<&str>) -> Result<Vec<DeadLetterEntry>, sqlx::Error> {
        let rows = match account_name {
            Some(account) => {
                sqlx::query("SELECT * FROM dead_letter WHERE account_name = ? ORDER BY created_at DESC")
                    .bind(account)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM dead_letter ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    pub async fn dead_letter_by_id(&self, id: i64) -> Result<Option<DeadLetterEntry>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM dead_letter WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_dead_letter).transpose()
    }

    /// Entries due for retry: `retry_status = pending`, `next_retry_at <=
    /// now`, `attempts < max_attempts` (`spec.md` §4.10).
    pub async fn due_dead_letters(&self, max_attempts: u32) -> Result<Vec<DeadLetterEntry>, sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM dead_letter
             WHERE retry_status = 'pending' AND next_retry_at <= ? AND attempts < ?
             ORDER BY next_retry_at ASC",
        )
        .bind(now)
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    pub async fn mark_dead_letter_retrying(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE dead_letter SET retry_status = ?, last_retry_at = ? WHERE id = ?")
            .bind(RetryStatus::Retrying.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_dead_letter_success(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE dead_letter SET retry_status = ?, resolved_at = ? WHERE id = ?")
            .bind(RetryStatus::Success.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies the backoff formula from `spec.md` §6: `next_retry_at =
    /// created_at + min(initial_delay * multiplier^(attempts-1), max_delay)`.
    /// When `attempts >= max_attempts` after the bump, flips to `exhausted`
    /// instead of rescheduling.
    pub async fn reschedule_dead_letter(
        &self,
        entry: &DeadLetterEntry,
        retry: &RetryConfig,
    ) -> Result<(), sqlx::Error> {
        let attempts = entry.attempts + 1;
        if attempts >= retry.max_attempts {
            sqlx::query("UPDATE dead_letter SET attempts = ?, retry_status = ? WHERE id = ?")
                .bind(attempts as i64)
                .bind(RetryStatus::Exhausted.as_str())
                .bind(entry.id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let initial = retry.initial_delay.as_duration().as_secs_f64();
        let max = retry.max_delay.as_duration().as_secs_f64();
        let delay_secs = (initial * retry.multiplier.powi(attempts as i32 - 1)).min(max);
        let next_retry_at = entry.created_at + chrono::Duration::milliseconds((delay_secs * 1000.0) as i64);

        sqlx::query("UPDATE dead_letter SET attempts = ?, retry_status = ?, next_retry_at = ? WHERE id = ?")
            .bind(attempts as i64)
            .bind(RetryStatus::Pending.as_str())
            .bind(next_retry_at.to_rfc3339())
            .bind(entry.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes processed-message rows older than `ttl` and audit rows older
    /// than `retention` (`spec.md` §4.10 pruning).
    pub async fn prune(&self, processed_ttl: std::time::Duration, audit_retention: std::time::Duration) -> Result<(), sqlx::Error> {
        let processed_cutoff = Utc::now() - chrono::Duration::from_std(processed_ttl).unwrap();
        let audit_cutoff = Utc::now() - chrono::Duration::from_std(audit_retention).unwrap();
        sqlx::query("DELETE FROM processed_messages WHERE processed_at < ?")
            .bind(processed_cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM audit_log WHERE created_at < ?")
            .bind(audit_cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn dead_letter_count(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM dead_letter WHERE retry_status != 'success'")
            .fetch_one(&self.pool)
            .await?;
        row.try_get("c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use std::time::Duration;

    async fn test_store() -> StateStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = StateStore { pool };
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn dedup_is_unique_per_message_and_account() {
        let store = test_store().await;
        assert!(!store.is_processed("m1", "acct").await.unwrap());
        store.mark_processed("m1", "acct").await.unwrap();
        assert!(store.is_processed("m1", "acct").await.unwrap());
        // second insert is a silent no-op, not an error
        store.mark_processed("m1", "acct").await.unwrap();
    }

    #[tokio::test]
    async fn audit_round_trips() {
        let store = test_store().await;
        let actions = vec![Action::Move { folder: "Archive".into(), reason: Some("newsletter".into()) }];
        store
            .append_audit("m1", "acct", &actions, Some("openai"), Some("gpt-4o-mini"), None, Some(0.9), None)
            .await
            .unwrap();
        let entries = store.activity(&ActivityFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actions.len(), 1);
        assert_eq!(entries[0].confidence, Some(0.9));
    }

    #[tokio::test]
    async fn dead_letter_reschedules_with_backoff_and_exhausts() {
        let store = test_store().await;
        let retry = RetryConfig {
            initial_delay: Duration::from_secs(60).into(),
            max_delay: Duration::from_secs(3600).into(),
            multiplier: 2.0,
            max_attempts: 3,
        };
        let id = store
            .enqueue_dead_letter("m1", "acct", "INBOX", 42, "boom", &retry)
            .await
            .unwrap();
        let entry = store.dead_letter_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);

        store.reschedule_dead_letter(&entry, &retry).await.unwrap();
        let entry = store.dead_letter_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.retry_status, RetryStatus::Pending);

        store.reschedule_dead_letter(&entry, &retry).await.unwrap();
        let entry = store.dead_letter_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.retry_status, RetryStatus::Exhausted);
    }

    #[tokio::test]
    async fn prune_deletes_old_rows() {
        let store = test_store().await;
        store.mark_processed("old", "acct").await.unwrap();
        store.prune(Duration::from_millis(0), Duration::from_millis(0)).await.unwrap();
        assert!(!store.is_processed("old", "acct").await.unwrap());
    }

    /// Dedup and audit rows must survive a reconnect to the same on-disk
    /// database, not just the lifetime of an in-memory pool.
    #[tokio::test]
    async fn state_survives_reconnect_to_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("mailpilot.sqlite3");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let store = StateStore::connect(&url).await.unwrap();
        store.mark_processed("m1", "acct").await.unwrap();
        drop(store);

        let reopened = StateStore::connect(&url).await.unwrap();
        assert!(reopened.is_processed("m1", "acct").await.unwrap());
    }
}
