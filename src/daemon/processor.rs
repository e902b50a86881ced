//! Message Processor: the per-message pipeline from dedup through record,
//! with PGP short-circuit, optional virus scan and attachment extraction,
//! and dead-letter handling on any exception in the fetch-through-record
//! span.

use base64::Engine;
use log::{error, info};

use crate::config::{AccountConfig, FolderMode, GlobalConfig, LlmProviderConfig, VirusPolicy};
use crate::imap::session::AsyncImapOps;
use crate::imap::types::FlagOperation;
use crate::llm::client::LlmClient;
use crate::mime::{parse_email, AttachmentView};
use crate::models::Action;
use crate::services::{TextExtractor, VirusScanner};

use super::error::PipelineError;
use super::executor::ActionExecutor;
use super::prompt::build_prompt;
use super::state::StateStore;
use super::webhook::{WebhookDispatcher, WebhookPayload};

const MAX_ATTACHMENT_DEFAULT: usize = 4000;

pub struct MessageProcessor<'a, T: AsyncImapOps> {
    pub session: &'a T,
    pub store: &'a StateStore,
    pub llm: &'a LlmClient,
    pub virus_scanner: &'a dyn VirusScanner,
    pub extractor: &'a dyn TextExtractor,
    pub webhook: &'a WebhookDispatcher,
}

fn content_type_allowed(content_type: &str, allow_list: &[String]) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    let normalized = if content_type == "image/jpg" { "image/jpeg" } else { content_type };
    allow_list.iter().any(|rule| {
        if let Some(prefix) = rule.strip_suffix("/*") {
            normalized.starts_with(prefix) && normalized[prefix.len()..].starts_with('/')
        } else {
            rule == normalized || (rule == "image/jpg" && normalized == "image/jpeg")
        }
    })
}

impl<'a, T: AsyncImapOps> MessageProcessor<'a, T> {
    /// Entry point: `(account, folder, uid, message_id)` in, "did useful
    /// work" out. Never propagates a pipeline error to the caller; any
    /// failure in fetch-through-record is recorded in the dead-letter queue
    /// and this returns `Ok(false)`. This is the entrypoint the Work
    /// Dispatcher uses for fresh unseen messages, where no dead-letter row
    /// exists yet; the dead-letter retry scheduler owns the lifecycle of an
    /// *existing* row itself and must call [`Self::process_once`] instead,
    /// or every failed retry would both reschedule the original row and
    /// enqueue a brand-new one.
    pub async fn process(
        &self,
        account: &AccountConfig,
        provider: &LlmProviderConfig,
        global: &GlobalConfig,
        folder: &str,
        uid: u32,
        message_id: &str,
    ) -> Result<bool, PipelineError> {
        match self.process_once(account, provider, global, folder, uid, message_id).await {
            Ok(did_work) => Ok(did_work),
            Err(e) => {
                error!("message {message_id} in {}:{folder} failed processing: {e}", account.name);
                if let Err(store_err) = self
                    .store
                    .enqueue_dead_letter(message_id, &account.name, folder, uid, &e.to_string(), &global.retry)
                    .await
                {
                    error!("failed to record dead-letter entry for {message_id}: {store_err}");
                }
                Ok(false)
            }
        }
    }

    /// Dedup-then-pipeline, with failures propagated instead of enqueued.
    /// Used directly by the dead-letter retry path (`supervisor.rs`), which
    /// owns the enqueue/reschedule/exhaust lifecycle of its own row and
    /// must not have this also open a second, independent dead-letter entry.
    pub async fn process_once(
        &self,
        account: &AccountConfig,
        provider: &LlmProviderConfig,
        global: &GlobalConfig,
        folder: &str,
        uid: u32,
        message_id: &str,
    ) -> Result<bool, PipelineError> {
        if self.store.is_processed(message_id, &account.name).await? {
            return Ok(false);
        }

        self.run_pipeline(account, provider, global, folder, uid, message_id).await
    }

    async fn run_pipeline(
        &self,
        account: &AccountConfig,
        provider: &LlmProviderConfig,
        global: &GlobalConfig,
        folder: &str,
        uid: u32,
        message_id: &str,
    ) -> Result<bool, PipelineError> {
        self.session.select_folder(folder).await?;
        let emails = self.session.fetch_emails(&[uid]).await?;
        let email = emails
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::other(format!("uid {uid} not found in {folder}")))?;

        let parsed = parse_email(&email);
        let auto_create = account.folders.mode == FolderMode::AutoCreate;
        let executor = ActionExecutor::new(self.session, auto_create);

        if parsed.pgp_encrypted {
            let actions = vec![Action::noop("PGP encrypted email")];
            self.record(account, None, global, folder, uid, message_id, &parsed, &actions, None, None).await?;
            return Ok(true);
        }

        if global.virus_scan.enabled {
            if let Some(verdict) = self.scan_attachments(&parsed.attachments).await {
                let policy = global.virus_scan.policy.unwrap_or(VirusPolicy::FlagOnly);
                match policy {
                    VirusPolicy::Quarantine => {
                        let actions = vec![Action::Move { folder: "Quarantine".to_string(), reason: Some("virus detected".to_string()) }];
                        let outcome = executor.execute(folder, uid, &actions).await?;
                        self.record(account, None, global, folder, uid, message_id, &parsed, &outcome.executed, None, None).await?;
                        return Ok(true);
                    }
                    VirusPolicy::Delete => {
                        let actions = vec![Action::Delete { reason: Some("virus detected".to_string()) }];
                        let outcome = executor.execute(folder, uid, &actions).await?;
                        self.record(account, None, global, folder, uid, message_id, &parsed, &outcome.executed, None, None).await?;
                        return Ok(true);
                    }
                    VirusPolicy::FlagOnly => {
                        self.session
                            .store_flags(&[uid], FlagOperation::Add, &["$Virus".to_string(), "\\Flagged".to_string()])
                            .await?;
                        let _ = verdict;
                    }
                }
            }
        }

        let (extracted_text, extracted_images) = if global.extraction.enabled {
            self.extract_attachments(&parsed.attachments, global).await
        } else {
            (Vec::new(), Vec::new())
        };

        let discovered_folders = self.discover_folders(account).await?;

        let max_body_tokens = provider.max_body_tokens;
        let prompt = build_prompt(
            account,
            global,
            &parsed,
            &discovered_folders,
            max_body_tokens,
            &extracted_text,
            &extracted_images,
            provider.supports_vision,
        );

        let model = account.llm.model.clone().unwrap_or_else(|| provider.default_model.clone());
        let mut result = self.llm.classify(provider, &model, prompt, 0.3).await?;

        if global.confidence.enabled {
            let threshold = account.minimum_confidence.unwrap_or(global.confidence.minimum_threshold);
            if result.confidence.map(|c| c < threshold).unwrap_or(false) {
                result.actions = vec![Action::noop("low confidence")];
            }
        }

        let filtered = crate::llm::parser::filter_actions(result.actions, &account.allowed_actions);

        let outcome = if global.dry_run {
            super::executor::ExecutionOutcome {
                moved_or_deleted: filtered.iter().any(|a| matches!(a, Action::Move { .. } | Action::Delete { .. })),
                executed: filtered,
            }
        } else {
            executor.execute(folder, uid, &filtered).await?
        };

        if global.add_processing_headers && !outcome.moved_or_deleted && !global.dry_run {
            executor.inject_headers(folder, uid, &model, &outcome.executed, result.reasoning.as_deref()).await?;
        }

        self.record(
            account,
            Some((&provider.name, &model)),
            global,
            folder,
            uid,
            message_id,
            &parsed,
            &outcome.executed,
            result.confidence,
            result.reasoning.as_deref(),
        )
        .await?;

        Ok(true)
    }

    async fn scan_attachments(&self, attachments: &[AttachmentView]) -> Option<crate::services::ScanVerdict> {
        for attachment in attachments {
            if attachment.body.is_empty() {
                continue;
            }
            if self.virus_scanner.scan(&attachment.body).await == crate::services::ScanVerdict::Infected {
                return Some(crate::services::ScanVerdict::Infected);
            }
        }
        None
    }

    async fn extract_attachments(
        &self,
        attachments: &[AttachmentView],
        global: &GlobalConfig,
    ) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let max_bytes = (global.extraction.max_size_mb * 1024 * 1024) as usize;
        let max_chars = if global.extraction.max_extracted_chars > 0 {
            global.extraction.max_extracted_chars
        } else {
            MAX_ATTACHMENT_DEFAULT
        };

        let mut text_parts = Vec::new();
        let mut image_parts = Vec::new();

        for attachment in attachments {
            if attachment.body.len() > max_bytes {
                continue;
            }
            if !content_type_allowed(&attachment.content_type, &global.extraction.allowed_content_types) {
                continue;
            }

            let name = attachment.filename.clone().unwrap_or_else(|| attachment.content_type.clone());

            if attachment.content_type == "text/plain" || attachment.content_type == "text/csv" {
                let text = String::from_utf8_lossy(&attachment.body);
                let truncated: String = text.chars().take(max_chars).collect();
                text_parts.push((name, truncated));
                continue;
            }

            if attachment.content_type.starts_with("image/") && global.extraction.extract_images {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&attachment.body);
                image_parts.push((attachment.content_type.clone(), encoded));
                continue;
            }

            if let Some(text) = self.extractor.extract(&attachment.content_type, &attachment.body).await {
                let truncated: String = text.chars().take(max_chars).collect();
                text_parts.push((name, truncated));
            }
        }

        (text_parts, image_parts)
    }

    /// Folder discovery per `spec.md` §4.4 step 7: list the server's
    /// folders in `auto_create` mode, or in `predefined` mode with no
    /// explicit allow-list; otherwise use the configured allow-list as-is.
    async fn discover_folders(&self, account: &AccountConfig) -> Result<Vec<String>, PipelineError> {
        let needs_discovery = account.folders.mode == FolderMode::AutoCreate
            || (account.folders.mode == FolderMode::Predefined && account.folders.allowed.is_empty());
        if needs_discovery {
            Ok(self.session.list_folders().await?)
        } else {
            Ok(account.folders.allowed.clone())
        }
    }

    /// `provider_model` is `Some((provider_name, model))` when an LLM call
    /// actually produced `actions`, `None` for the PGP/virus short-circuits
    /// that never reach the classifier — the audit row's provider/model
    /// columns reflect whether classification happened, and when it did,
    /// the model the account actually used (its own override, not always
    /// the provider default).
    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        account: &AccountConfig,
        provider_model: Option<(&str, &str)>,
        global: &GlobalConfig,
        folder: &str,
        uid: u32,
        message_id: &str,
        parsed: &crate::mime::ParsedEmail,
        actions: &[Action],
        confidence: Option<f32>,
        reasoning: Option<&str>,
    ) -> Result<(), PipelineError> {
        self.store.mark_processed(message_id, &account.name).await?;

        let subject = if global.audit_subjects { parsed.subject.as_deref() } else { None };
        let (provider_name, model) = match provider_model {
            Some((p, m)) => (Some(p), Some(m)),
            None => (None, None),
        };
        self.store
            .append_audit(message_id, &account.name, actions, provider_name, model, subject, confidence, reasoning)
            .await?;

        let mut payload = WebhookPayload::new(crate::config::WebhookEvent::ActionTaken)
            .with_account(account.name.clone())
            .with_message_id(message_id.to_string())
            .with_actions(actions.to_vec());
        if let Some(provider_name) = provider_name {
            payload = payload.with_llm_provider(provider_name.to_string());
        }
        self.webhook.dispatch(&account.webhooks, payload).await;

        info!("processed {message_id} in {}:{folder} (uid {uid}): {} action(s)", account.name, actions.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_allowed_supports_wildcard_and_alias() {
        let allow = vec!["image/*".to_string(), "text/csv".to_string()];
        assert!(content_type_allowed("image/png", &allow));
        assert!(content_type_allowed("image/jpg", &allow));
        assert!(content_type_allowed("text/csv", &allow));
        assert!(!content_type_allowed("application/pdf", &allow));
    }

    #[test]
    fn empty_allow_list_permits_everything() {
        assert!(content_type_allowed("application/pdf", &[]));
    }
}
