//! Prompt builder (`spec.md` §4.5): a pure function turning a parsed email
//! plus account/provider configuration into either a plain text prompt or
//! multimodal content parts.

use std::collections::HashSet;

use crate::config::{AccountConfig, FolderMode, GlobalConfig};
use crate::llm::client::{ContentPart, PromptContent};
use crate::llm::parser::ActionKind;
use crate::mime::{AttachmentView, ParsedEmail};

/// Roughly 4 characters per token, the heuristic named in `spec.md` §4.5.
const CHARS_PER_TOKEN: usize = 4;

fn truncate_body(body: &str, max_body_tokens: usize) -> String {
    let max_chars = max_body_tokens.saturating_mul(CHARS_PER_TOKEN);
    if body.len() <= max_chars {
        body.to_string()
    } else {
        let mut truncated = body.chars().take(max_chars).collect::<String>();
        truncated.push_str("... [truncated]");
        truncated
    }
}

fn resolve_base_prompt(account: &AccountConfig, global: &GlobalConfig) -> String {
    account
        .base_prompt
        .clone()
        .or_else(|| global.default_prompt.clone())
        .unwrap_or_else(|| {
            "You are an email triage assistant. Classify the message below and respond with JSON only.".to_string()
        })
}

fn folder_directive(account: &AccountConfig, discovered: &[String]) -> String {
    match account.folders.mode {
        FolderMode::Predefined if !account.folders.allowed.is_empty() => {
            format!("Allowed destination folders: {}.", account.folders.allowed.join(", "))
        }
        FolderMode::Predefined => {
            format!("Allowed destination folders (discovered from the server): {}.", discovered.join(", "))
        }
        FolderMode::AutoCreate => {
            format!(
                "Existing folders: {}. You may also specify a new folder name to create it.",
                discovered.join(", ")
            )
        }
    }
}

fn allowed_actions_directive(allowed: &HashSet<ActionKind>) -> Option<String> {
    if allowed.len() >= ActionKind::ALL.len() {
        return None;
    }
    let forbidden: Vec<&str> = ActionKind::ALL
        .iter()
        .filter(|k| !allowed.contains(k))
        .map(ActionKind::as_str)
        .collect();
    if forbidden.is_empty() {
        return None;
    }
    Some(format!(
        "The following actions are forbidden for this account and must never be used: {}.",
        forbidden.join(", ")
    ))
}

fn response_schema_directive(account: &AccountConfig, global: &GlobalConfig) -> String {
    let allowed_types: Vec<&str> = ActionKind::ALL
        .iter()
        .filter(|k| account.allowed_actions.contains(k))
        .map(ActionKind::as_str)
        .collect();
    let mut schema = format!(
        "Respond with JSON only matching: {{\"actions\":[{{\"type\":<one of [{}]>,\"folder\"?:string,\"flags\"?:string[],\"reason\"?:string}}]",
        allowed_types.join(", ")
    );
    if global.confidence.require_confidence_field {
        schema.push_str(",\"confidence\":<number 0..1 required>");
    } else {
        schema.push_str(",\"confidence\"?:<number 0..1>");
    }
    if global.confidence.require_reasoning_field {
        schema.push_str(",\"reasoning\":<string required>");
    } else {
        schema.push_str(",\"reasoning\"?:<string>");
    }
    schema.push('}');
    schema
}

fn attachment_block(attachments: &[AttachmentView], extracted: &[(String, String)]) -> String {
    if extracted.is_empty() {
        return String::new();
    }
    let mut block = String::from("\n\nAttachment contents:\n");
    for (name, content) in extracted {
        block.push_str(&format!("```{name}\n{content}\n```\n"));
    }
    if attachments.len() > extracted.len() {
        block.push_str(&format!(
            "({} additional attachment(s) not extracted)\n",
            attachments.len() - extracted.len()
        ));
    }
    block
}

fn image_parts(attachments: &[AttachmentView], image_data: &[(String, String)]) -> Vec<ContentPart> {
    image_data
        .iter()
        .filter_map(|(content_type, base64)| {
            attachments
                .iter()
                .any(|a| &a.content_type == content_type)
                .then(|| ContentPart::ImageUrl { content_type: content_type.clone(), base64: base64.clone() })
        })
        .collect()
}

/// Builds the full prompt text (everything except image parts).
fn build_text(
    account: &AccountConfig,
    global: &GlobalConfig,
    email: &ParsedEmail,
    discovered_folders: &[String],
    max_body_tokens: usize,
    extracted: &[(String, String)],
) -> String {
    let base = resolve_base_prompt(account, global);
    let from = email.from.as_deref().unwrap_or("(unknown sender)");
    let subject = email.subject.as_deref().unwrap_or("(no subject)");
    let body = truncate_body(&email.body, max_body_tokens);

    let mut prompt = format!(
        "{base}\n\nFrom: {from}\nSubject: {subject}\n\nBody:\n{body}{attachments}\n\n{folders}",
        attachments = attachment_block(&email.attachments, extracted),
        folders = folder_directive(account, discovered_folders),
    );

    if let Some(directive) = allowed_actions_directive(&account.allowed_actions) {
        prompt.push('\n');
        prompt.push_str(&directive);
    }

    prompt.push('\n');
    prompt.push_str(&response_schema_directive(account, global));
    prompt
}

/// Builds the classify call's content: multimodal when the provider
/// supports vision and at least one attachment carries image data,
/// otherwise plain text (`spec.md` §4.4 step 8).
#[allow(clippy::too_many_arguments)]
pub fn build_prompt(
    account: &AccountConfig,
    global: &GlobalConfig,
    email: &ParsedEmail,
    discovered_folders: &[String],
    max_body_tokens: usize,
    extracted_text: &[(String, String)],
    extracted_images: &[(String, String)],
    provider_supports_vision: bool,
) -> PromptContent {
    let text = build_text(account, global, email, discovered_folders, max_body_tokens, extracted_text);

    if !provider_supports_vision || extracted_images.is_empty() {
        return PromptContent::Text(text);
    }

    let mut parts = vec![ContentPart::Text(text)];
    parts.extend(image_parts(&email.attachments, extracted_images));
    PromptContent::Multimodal(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMode, FolderPolicy, ImapEndpoint, LlmSelection, TlsMode};

    fn account() -> AccountConfig {
        AccountConfig {
            name: "personal".to_string(),
            imap: ImapEndpoint {
                host: "imap.example.com".to_string(),
                port: 993,
                tls: TlsMode::Tls,
                auth: AuthMode::Basic,
                trusted_fingerprints: vec![],
            },
            username: "me@example.com".to_string(),
            password: "secret".to_string(),
            folders: FolderPolicy::default(),
            llm: LlmSelection { provider: "openai".to_string(), model: None },
            webhooks: vec![],
            allowed_actions: [ActionKind::Move, ActionKind::Spam, ActionKind::Flag, ActionKind::Read, ActionKind::Noop]
                .into_iter()
                .collect(),
            minimum_confidence: None,
            concurrency_limit: 5,
            polling_interval: std::time::Duration::from_secs(60).into(),
            base_prompt: None,
            paused: false,
        }
    }

    fn email() -> ParsedEmail {
        ParsedEmail {
            message_id: Some("<1@example.com>".to_string()),
            subject: Some("Your invoice".to_string()),
            from: Some("billing@vendor.com".to_string()),
            body: "Please find attached your invoice for this month.".to_string(),
            attachments: vec![],
            pgp_encrypted: false,
        }
    }

    #[test]
    fn mentions_forbidden_actions_when_restricted() {
        let account = account();
        let global = GlobalConfig::default();
        let prompt = build_prompt(&account, &global, &email(), &["INBOX".into()], 4000, &[], &[], false);
        let PromptContent::Text(text) = prompt else { panic!("expected text prompt") };
        assert!(text.contains("forbidden"));
        assert!(text.contains("delete"));
    }

    #[test]
    fn truncates_long_bodies() {
        let long_body = "x".repeat(1000);
        assert_eq!(truncate_body(&long_body, 10).len(), 40 + "... [truncated]".len());
    }

    #[test]
    fn builds_multimodal_when_vision_supported_with_images() {
        let mut email = email();
        email.attachments.push(AttachmentView {
            filename: Some("photo.jpg".to_string()),
            content_type: "image/jpeg".to_string(),
            body: vec![],
        });
        let account = account();
        let global = GlobalConfig::default();
        let images = vec![("image/jpeg".to_string(), "base64data".to_string())];
        let prompt = build_prompt(&account, &global, &email, &["INBOX".into()], 4000, &[], &images, true);
        match prompt {
            PromptContent::Multimodal(parts) => assert_eq!(parts.len(), 2),
            PromptContent::Text(_) => panic!("expected multimodal prompt"),
        }
    }
}
