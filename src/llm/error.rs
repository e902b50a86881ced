//! Error taxonomy for the LLM request layer (`spec.md` §7: TransientNetwork,
//! RateLimited, AuthError, SchemaError map onto these variants).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum LlmError {
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("transient provider error ({status}): {body}")]
    Transient { status: u16, body: String },

    #[error("provider error ({status}): {body}")]
    NonRetryable { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider '{0}' is not configured")]
    UnknownProvider(String),

    #[error("retries exhausted for provider '{provider}': {source}")]
    Exhausted { provider: String, source: Box<LlmError> },
}

impl LlmError {
    /// Whether this error belongs to the retryable class in `spec.md` §4.6
    /// step 5: rate-limit / 429 / 500 / 502 / 503.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited(_) => true,
            LlmError::Transient { status, .. } => matches!(status, 500 | 502 | 503),
            _ => false,
        }
    }
}
