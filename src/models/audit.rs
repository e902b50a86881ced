//! Append-only audit entries (`spec.md` §3, §4.10).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Action;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub message_id: String,
    pub account_name: String,
    pub actions: Vec<Action>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    /// Only populated when the account's `audit_subjects` toggle is on.
    pub subject: Option<String>,
    pub confidence: Option<f32>,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter accepted by `Activity` (`spec.md` §6).
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub account_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}
