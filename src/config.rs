//! Plain configuration types for the daemon core.
//!
//! YAML parsing, environment-variable interpolation and the minimal-config
//! bootstrap are out of scope: this module only defines the deserialization
//! target an external loader builds and hands to
//! [`crate::daemon::Mailpilot::run`] — a dumb `serde` target rather than a
//! parser.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::parser::ActionKind;

/// A duration parsed from the `<number><unit>` grammar used throughout the
/// configuration surface, where unit is one of `ms|s|m|h|d|w|y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        HumanDuration(d)
    }
}

impl From<HumanDuration> for Duration {
    fn from(h: HumanDuration) -> Self {
        h.0
    }
}

impl From<HumanDuration> for String {
    fn from(h: HumanDuration) -> Self {
        h.to_string()
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split_at = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;
        let (number, unit) = s.split_at(split_at);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("duration '{s}' has an invalid numeric part"))?;
        let millis = match unit {
            "ms" => value,
            "s" => value * 1_000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            "d" => value * 86_400_000.0,
            "w" => value * 7.0 * 86_400_000.0,
            "y" => value * 365.0 * 86_400_000.0,
            other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
        };
        Ok(HumanDuration(Duration::from_millis(millis.round() as u64)))
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        HumanDuration::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// IMAP transport security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Tls,
    Starttls,
    Insecure,
    Auto,
}

/// IMAP authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Basic,
    Oauth2,
}

/// Folder discovery policy for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderMode {
    Predefined,
    AutoCreate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub auth: AuthMode,
    /// Trusted certificate fingerprints (SHA-256, hex) used to bypass a
    /// `CertificateError` that would otherwise halt reconnection.
    #[serde(default)]
    pub trusted_fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderPolicy {
    pub mode: FolderMode,
    #[serde(default = "default_watch_list")]
    pub watch: Vec<String>,
    /// Explicit allow-list of destination folders; empty means discover
    /// from the server.
    #[serde(default)]
    pub allowed: Vec<String>,
}

fn default_watch_list() -> Vec<String> {
    vec!["INBOX".to_string()]
}

impl Default for FolderPolicy {
    fn default() -> Self {
        Self {
            mode: FolderMode::Predefined,
            watch: default_watch_list(),
            allowed: Vec::new(),
        }
    }
}

fn default_allowed_actions() -> HashSet<ActionKind> {
    [
        ActionKind::Move,
        ActionKind::Spam,
        ActionKind::Flag,
        ActionKind::Read,
        ActionKind::Noop,
    ]
    .into_iter()
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSelection {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub url: String,
    pub events: Vec<WebhookEvent>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    Startup,
    Shutdown,
    Error,
    ActionTaken,
    ConnectionLost,
    ConnectionRestored,
    RetryExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirusPolicy {
    Quarantine,
    Delete,
    FlagOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub imap: ImapEndpoint,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub folders: FolderPolicy,
    pub llm: LlmSelection,
    #[serde(default)]
    pub webhooks: Vec<WebhookSubscription>,
    #[serde(default = "default_allowed_actions")]
    pub allowed_actions: HashSet<ActionKind>,
    #[serde(default)]
    pub minimum_confidence: Option<f32>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_polling_interval")]
    pub polling_interval: HumanDuration,
    #[serde(default)]
    pub base_prompt: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

fn default_concurrency_limit() -> usize {
    5
}

fn default_polling_interval() -> HumanDuration {
    HumanDuration(Duration::from_secs(60))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub default_model: String,
    #[serde(default = "default_max_body_tokens")]
    pub max_body_tokens: usize,
    #[serde(default = "default_max_thread_tokens")]
    pub max_thread_tokens: usize,
    #[serde(default)]
    pub rpm_limit: Option<u32>,
    #[serde(default)]
    pub supports_vision: bool,
}

fn default_max_body_tokens() -> usize {
    4000
}

fn default_max_thread_tokens() -> usize {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_confidence")]
    pub minimum_threshold: f32,
    #[serde(default)]
    pub require_confidence_field: bool,
    #[serde(default)]
    pub require_reasoning_field: bool,
}

fn default_min_confidence() -> f32 {
    0.5
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            minimum_threshold: default_min_confidence(),
            require_confidence_field: false,
            require_reasoning_field: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: HumanDuration,
    #[serde(default = "default_max_delay")]
    pub max_delay: HumanDuration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay() -> HumanDuration {
    HumanDuration(Duration::from_secs(5 * 60))
}
fn default_max_delay() -> HumanDuration {
    HumanDuration(Duration::from_secs(24 * 3600))
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub timeout: HumanDuration,
    #[serde(default = "default_force_after")]
    pub force_after: HumanDuration,
}

fn default_shutdown_timeout() -> HumanDuration {
    HumanDuration(Duration::from_secs(30))
}
fn default_force_after() -> HumanDuration {
    HumanDuration(Duration::from_secs(25))
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: default_shutdown_timeout(),
            force_after: default_force_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VirusScanConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub policy: Option<VirusPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attachment_mb")]
    pub max_size_mb: u64,
    #[serde(default)]
    pub allowed_content_types: Vec<String>,
    #[serde(default = "default_max_extracted_chars")]
    pub max_extracted_chars: usize,
    #[serde(default)]
    pub extract_images: bool,
}

fn default_max_attachment_mb() -> u64 {
    10
}
fn default_max_extracted_chars() -> usize {
    4000
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_mb: default_max_attachment_mb(),
            allowed_content_types: Vec::new(),
            max_extracted_chars: default_max_extracted_chars(),
            extract_images: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub audit_subjects: bool,
    #[serde(default)]
    pub add_processing_headers: bool,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub virus_scan: VirusScanConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub webhooks: Vec<WebhookSubscription>,
    #[serde(default = "default_processed_ttl")]
    pub processed_ttl: HumanDuration,
    #[serde(default = "default_audit_retention")]
    pub audit_retention: HumanDuration,
    #[serde(default)]
    pub default_prompt: Option<String>,
}

fn default_processed_ttl() -> HumanDuration {
    HumanDuration(Duration::from_secs(24 * 3600))
}
fn default_audit_retention() -> HumanDuration {
    HumanDuration(Duration::from_secs(30 * 86400))
}

/// The top-level configuration the daemon core is constructed with. An
/// external loader (YAML + env interpolation; out of scope here) builds one
/// of these and passes it to [`crate::daemon::Mailpilot::run`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub providers: Vec<LlmProviderConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    /// Path to the SQLite database backing the persistent state store.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "mailpilot.sqlite3".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(HumanDuration::from_str("500ms").unwrap().0.as_millis(), 500);
        assert_eq!(HumanDuration::from_str("5s").unwrap().0.as_secs(), 5);
        assert_eq!(HumanDuration::from_str("5m").unwrap().0.as_secs(), 300);
        assert_eq!(HumanDuration::from_str("1h").unwrap().0.as_secs(), 3600);
        assert_eq!(HumanDuration::from_str("1d").unwrap().0.as_secs(), 86_400);
        assert_eq!(HumanDuration::from_str("1w").unwrap().0.as_secs(), 7 * 86_400);
    }

    #[test]
    fn rejects_missing_unit() {
        assert!(HumanDuration::from_str("500").is_err());
    }

    #[test]
    fn default_allowed_actions_excludes_delete() {
        let set = default_allowed_actions();
        assert!(!set.contains(&ActionKind::Delete));
        assert!(set.contains(&ActionKind::Move));
    }
}
