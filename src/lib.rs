//! Library core for Mailpilot.

// --- Modules ---
pub mod config;
pub mod daemon;
pub mod imap;
pub mod llm;
pub mod mime;
pub mod models;
pub mod services;

// Re-export key types for convenience.
pub mod prelude {
    // Config
    pub use crate::config::{AccountConfig, DaemonConfig, GlobalConfig, LlmProviderConfig};

    // Daemon core
    pub use crate::daemon::{Mailpilot, MailpilotError, Stats};

    // IMAP
    pub use crate::imap::error::ImapError;
    pub use crate::imap::types::{
        Address, AppendEmailPayload, Email, Envelope, FlagOperation, Flags, Folder, MailboxInfo,
        ModifyFlagsPayload, SearchCriteria,
    };

    // LLM
    pub use crate::llm::error::LlmError;
    pub use crate::llm::ActionKind;

    // Domain entities
    pub use crate::models::{Action, AuditEntry, DeadLetterEntry};

    // Common libs
    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
    pub use thiserror::Error;
    pub use uuid::Uuid;
}
