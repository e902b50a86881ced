//! Pipeline error taxonomy: any exception in the fetch-through-record span
//! of the message processor lands a message in the dead-letter queue
//! carrying this error's `Display` text.

use thiserror::Error;

use crate::imap::error::ImapError;
use crate::llm::error::LlmError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("imap error: {0}")]
    Imap(#[from] ImapError),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    pub fn other(msg: impl Into<String>) -> Self {
        PipelineError::Other(msg.into())
    }
}

/// Errors surfaced by the daemon's control interface
/// (`Pause`/`Resume`/`Reconnect`/`TriggerProcess`/`RetryDeadLetter`).
#[derive(Debug, Error)]
pub enum MailpilotError {
    #[error("unknown account '{0}'")]
    AccountNotFound(String),

    #[error("unknown dead letter id {0}")]
    DeadLetterNotFound(i64),

    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}
