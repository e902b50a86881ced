//! IMAP Action Executor: applies a validated, filtered action list in
//! order, built directly on `imap::client::ImapClient` /
//! `imap::session::AsyncImapOps`.

use base64::Engine;
use chrono::Utc;
use log::warn;

use crate::imap::session::AsyncImapOps;
use crate::imap::types::FlagOperation;
use crate::models::Action;

use super::error::PipelineError;

const SPAM_CANDIDATES: [&str; 3] = ["Spam", "Junk", "[Gmail]/Spam"];

/// Outcome of executing one message's action list, enough to drive the
/// header-injection decision and the audit record.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub executed: Vec<Action>,
    pub moved_or_deleted: bool,
}

/// Runs the validated action list against a single account's IMAP session.
/// `auto_create` mirrors the account's folder policy: when true, `Move`
/// creates the destination folder if it's missing.
pub struct ActionExecutor<'a, T: AsyncImapOps> {
    session: &'a T,
    auto_create: bool,
}

impl<'a, T: AsyncImapOps> ActionExecutor<'a, T> {
    pub fn new(session: &'a T, auto_create: bool) -> Self {
        Self { session, auto_create }
    }

    /// Executes `actions` against `(folder, uid)` in order. Stops and
    /// returns an error on the first failing action; actions already
    /// applied are not rolled back.
    pub async fn execute(
        &self,
        folder: &str,
        uid: u32,
        actions: &[Action],
    ) -> Result<ExecutionOutcome, PipelineError> {
        let mut outcome = ExecutionOutcome::default();
        for action in actions {
            self.execute_one(folder, uid, action).await?;
            if matches!(action, Action::Move { .. } | Action::Delete { .. }) {
                outcome.moved_or_deleted = true;
            }
            outcome.executed.push(action.clone());
        }
        Ok(outcome)
    }

    async fn execute_one(&self, folder: &str, uid: u32, action: &Action) -> Result<(), PipelineError> {
        match action {
            Action::Move { folder: to, .. } => self.move_to(folder, uid, to).await,
            Action::Flag { flags, .. } => self
                .session
                .store_flags(&[uid], FlagOperation::Add, flags)
                .await
                .map_err(PipelineError::from),
            Action::Read { .. } => self
                .session
                .store_flags(&[uid], FlagOperation::Add, &["\\Seen".to_string()])
                .await
                .map_err(PipelineError::from),
            Action::Delete { .. } => self.delete(folder, uid).await,
            Action::Spam { .. } => self.mark_spam(folder, uid).await,
            Action::Noop { .. } => Ok(()),
        }
    }

    async fn move_to(&self, from: &str, uid: u32, to: &str) -> Result<(), PipelineError> {
        if self.auto_create {
            // Folder creation treats "already exists" as success; the IMAP
            // layer surfaces that as an error we deliberately swallow.
            if let Err(e) = self.session.create_folder(to).await {
                warn!("create_folder('{to}') before move failed (may already exist): {e}");
            }
        }
        self.session.move_email(uid, from, to).await.map_err(PipelineError::from)
    }

    async fn delete(&self, folder: &str, uid: u32) -> Result<(), PipelineError> {
        self.session.select_folder(folder).await?;
        self.session.delete_messages(&[uid]).await?;
        Ok(())
    }

    /// Tries each spam-folder candidate in order; if every move fails,
    /// falls back to flagging in place.
    async fn mark_spam(&self, from: &str, uid: u32) -> Result<(), PipelineError> {
        for candidate in SPAM_CANDIDATES {
            if self.move_to(from, uid, candidate).await.is_ok() {
                return Ok(());
            }
        }
        self.session
            .store_flags(&[uid], FlagOperation::Add, &["$Junk".to_string(), "\\Flagged".to_string()])
            .await
            .map_err(PipelineError::from)
    }

    /// Header-injection rewrite: skipped entirely when the raw source is
    /// PGP-protected or has no CRLF to splice after. Returns whether the
    /// rewrite actually happened; the underlying `APPEND` here doesn't
    /// surface the server's new UID (no `APPENDUID` parsing in the IMAP
    /// layer), so there is no new UID to hand back to the caller.
    pub async fn inject_headers(
        &self,
        folder: &str,
        uid: u32,
        model: &str,
        actions: &[Action],
        reasoning: Option<&str>,
    ) -> Result<bool, PipelineError> {
        let raw = self.session.fetch_raw_message(uid).await?;

        if looks_pgp_protected(&raw) {
            return Ok(false);
        }

        let Some(split_at) = find_header_body_split(&raw) else {
            return Ok(false);
        };

        let mut injected = Vec::with_capacity(raw.len() + 256);
        injected.extend_from_slice(&raw[..split_at]);
        injected.extend_from_slice(build_injected_headers(model, actions, reasoning).as_bytes());
        injected.extend_from_slice(&raw[split_at..]);

        let emails = self.session.fetch_emails(&[uid]).await?;
        let flags = emails.into_iter().next().map(|e| e.flags).unwrap_or_default();

        self.session.append(folder, &injected, &flags).await?;
        self.session.delete_messages(&[uid]).await?;

        Ok(true)
    }
}

fn looks_pgp_protected(raw: &[u8]) -> bool {
    let head = &raw[..raw.len().min(4096)];
    const MARKERS: [&[u8]; 5] = [
        b"-----BEGIN PGP MESSAGE-----",
        b"-----BEGIN PGP SIGNED MESSAGE-----",
        b"multipart/encrypted",
        b"application/pgp-encrypted",
        b"application/pgp-signature",
    ];
    MARKERS.iter().any(|marker| head.windows(marker.len()).any(|w| w == *marker))
}

/// Finds the byte offset right after the first CRLF (the header/body
/// boundary), or `None` for malformed sources with no CRLF at all.
fn find_header_body_split(raw: &[u8]) -> Option<usize> {
    raw.windows(2).position(|w| w == b"\r\n").map(|i| i + 2)
}

fn build_injected_headers(model: &str, actions: &[Action], reasoning: Option<&str>) -> String {
    let actions_formatted = actions.iter().map(Action::format_for_header).collect::<Vec<_>>().join(",");
    let mut headers = format!(
        "X-Mailpilot-Processed: {}\r\nX-Mailpilot-Actions: {}\r\nX-Mailpilot-Model: {}\r\n",
        Utc::now().to_rfc3339(),
        actions_formatted,
        model,
    );
    if let Some(reasoning) = reasoning {
        let encoded = base64::engine::general_purpose::STANDARD.encode(reasoning);
        headers.push_str(&format!("X-Mailpilot-Analysis: {encoded}\r\n"));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_split_after_first_crlf() {
        let raw = b"Subject: hi\r\nFrom: a@b.com\r\n\r\nbody";
        let split = find_header_body_split(raw).unwrap();
        assert_eq!(&raw[..split], b"Subject: hi\r\n");
    }

    #[test]
    fn malformed_source_has_no_split() {
        assert!(find_header_body_split(b"no crlf here").is_none());
    }

    #[test]
    fn detects_pgp_marker_in_body() {
        assert!(looks_pgp_protected(b"-----BEGIN PGP MESSAGE-----\r\nabc"));
        assert!(!looks_pgp_protected(b"Subject: hi\r\n\r\nplain text"));
    }

    #[test]
    fn injected_headers_contain_expected_names() {
        let actions = vec![Action::Move { folder: "Archive".into(), reason: None }];
        let headers = build_injected_headers("gpt-4o-mini", &actions, Some("looked like a receipt"));
        assert!(headers.contains("X-Mailpilot-Processed:"));
        assert!(headers.contains("X-Mailpilot-Actions: move:Archive"));
        assert!(headers.contains("X-Mailpilot-Model: gpt-4o-mini"));
        assert!(headers.contains("X-Mailpilot-Analysis:"));
    }
}
