//! Dead-letter queue entries and their retry scheduler state (`spec.md` §3, §4.10).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Exhausted,
    Success,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Retrying => "retrying",
            RetryStatus::Exhausted => "exhausted",
            RetryStatus::Success => "success",
        }
    }
}

impl std::str::FromStr for RetryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RetryStatus::Pending),
            "retrying" => Ok(RetryStatus::Retrying),
            "exhausted" => Ok(RetryStatus::Exhausted),
            "success" => Ok(RetryStatus::Success),
            other => Err(format!("unknown retry status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub message_id: String,
    pub account_name: String,
    pub folder: String,
    pub uid: u32,
    pub error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub retry_status: RetryStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
}
