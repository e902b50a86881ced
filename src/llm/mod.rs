//! LLM request layer: rate limiting, retry, health, response parsing and
//! validation (`spec.md` §4.6, §4.7, §4.9).

pub mod client;
pub mod error;
pub mod parser;
pub mod ratelimit;

pub use client::{ContentPart, LlmClient, PromptContent, Transport};
pub use error::LlmError;
pub use parser::{parse_and_validate, ActionKind};
pub use ratelimit::{ProviderHealth, ProviderStats};
