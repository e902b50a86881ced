//! Thin view over [`crate::imap::types::Email`] for the message processor:
//! body derivation fallback and PGP detection (`spec.md` §4.5, §4.4 step 3).
//!
//! Full MIME parsing already happens in `imap::types::Email::from_fetch` /
//! `parse_mime_content` (via `mail_parser`); this module only derives the
//! two things the pipeline needs that the IMAP layer doesn't: a single best
//! body string, and whether the message is PGP-encrypted.

use crate::imap::types::{ContentType, Email, MimePart};

const PGP_BEGIN_MESSAGE: &str = "-----BEGIN PGP MESSAGE-----";
const PGP_BEGIN_SIGNED: &str = "-----BEGIN PGP SIGNED MESSAGE-----";

/// A flattened view of one attachment, enough for the extraction and virus
/// scan collaborators (`spec.md` §1 out-of-scope traits).
#[derive(Debug, Clone)]
pub struct AttachmentView {
    pub filename: Option<String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// The fields the message processor actually reads off a fetched email.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub body: String,
    pub attachments: Vec<AttachmentView>,
    pub pgp_encrypted: bool,
}

fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_pgp_content_type(ct: &ContentType) -> bool {
    ct.mime_type() == "application/pgp-encrypted"
        || (ct.main_type == "multipart" && ct.sub_type == "encrypted")
}

fn attachment_looks_pgp(part: &MimePart) -> bool {
    if is_pgp_content_type(&part.content_type) {
        return true;
    }
    let filename = part
        .content_disposition
        .as_ref()
        .and_then(|d| d.filename())
        .map(|f| f.to_lowercase());
    matches!(filename, Some(name) if name.ends_with(".gpg") || name.ends_with(".pgp"))
}

fn body_looks_pgp(body: &str) -> bool {
    body.contains(PGP_BEGIN_MESSAGE) || body.contains(PGP_BEGIN_SIGNED)
}

fn is_pgp_encrypted(email: &Email) -> bool {
    if email.mime_parts.iter().any(|p| is_pgp_content_type(&p.content_type)) {
        return true;
    }
    if email.attachments.iter().any(attachment_looks_pgp) {
        return true;
    }
    if let Some(text) = &email.text_body {
        if body_looks_pgp(text) {
            return true;
        }
    }
    false
}

/// Derives a single body string per `spec.md` §4.5 "Body selection":
/// plain text body, else HTML body with tags stripped, else the content of
/// the first `text/plain` attachment, else an empty string.
fn derive_body(email: &Email) -> String {
    if let Some(text) = &email.text_body {
        if !text.trim().is_empty() {
            return text.clone();
        }
    }
    if let Some(html) = &email.html_body {
        let stripped = strip_html_tags(html);
        if !stripped.trim().is_empty() {
            return stripped;
        }
    }
    email
        .attachments
        .iter()
        .find(|a| a.content_type.mime_type() == "text/plain")
        .and_then(|a| a.text_content.clone())
        .unwrap_or_default()
}

fn flatten_attachments(email: &Email) -> Vec<AttachmentView> {
    email
        .attachments
        .iter()
        .map(|part| AttachmentView {
            filename: part
                .content_disposition
                .as_ref()
                .and_then(|d| d.filename())
                .cloned(),
            content_type: part.content_type.mime_type(),
            body: part.body.clone(),
        })
        .collect()
}

/// Builds the processor's view of an already-fetched, already-MIME-parsed
/// email.
pub fn parse_email(email: &Email) -> ParsedEmail {
    let envelope = email.envelope.as_ref();
    ParsedEmail {
        message_id: envelope.and_then(|e| e.message_id.clone()),
        subject: envelope.and_then(|e| e.subject.clone()),
        from: envelope.and_then(|e| e.from.first()).map(|a| match (&a.mailbox, &a.host) {
            (Some(m), Some(h)) => format!("{m}@{h}"),
            _ => a.name.clone().unwrap_or_default(),
        }),
        body: derive_body(email),
        attachments: flatten_attachments(email),
        pgp_encrypted: is_pgp_encrypted(email),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::types::{Address, ContentDisposition, Envelope};
    use std::collections::HashMap;

    fn blank_content_type(main: &str, sub: &str) -> ContentType {
        ContentType {
            main_type: main.to_string(),
            sub_type: sub.to_string(),
            parameters: HashMap::new(),
        }
    }

    fn blank_email() -> Email {
        Email {
            uid: 1,
            flags: vec![],
            internal_date: None,
            envelope: Some(Envelope {
                date: None,
                subject: Some("Hi".to_string()),
                from: vec![Address {
                    name: Some("Alice".to_string()),
                    mailbox: Some("alice".to_string()),
                    host: Some("example.com".to_string()),
                }],
                to: vec![],
                cc: vec![],
                bcc: vec![],
                reply_to: vec![],
                in_reply_to: None,
                message_id: Some("<1@example.com>".to_string()),
            }),
            body: None,
            mime_parts: vec![],
            text_body: Some("Hello there".to_string()),
            html_body: None,
            attachments: vec![],
        }
    }

    #[test]
    fn derives_text_body_when_present() {
        let email = blank_email();
        let parsed = parse_email(&email);
        assert_eq!(parsed.body, "Hello there");
        assert_eq!(parsed.from.as_deref(), Some("alice@example.com"));
        assert!(!parsed.pgp_encrypted);
    }

    #[test]
    fn falls_back_to_stripped_html() {
        let mut email = blank_email();
        email.text_body = None;
        email.html_body = Some("<p>Hello <b>world</b></p>".to_string());
        let parsed = parse_email(&email);
        assert_eq!(parsed.body, "Hello world");
    }

    #[test]
    fn detects_pgp_body_markers() {
        let mut email = blank_email();
        email.text_body = Some("-----BEGIN PGP MESSAGE-----\nabc\n-----END PGP MESSAGE-----".to_string());
        let parsed = parse_email(&email);
        assert!(parsed.pgp_encrypted);
    }

    #[test]
    fn detects_pgp_attachment_by_filename() {
        let mut email = blank_email();
        email.attachments.push(MimePart {
            content_type: blank_content_type("application", "octet-stream"),
            content_transfer_encoding: None,
            content_disposition: Some(ContentDisposition {
                disposition_type: "attachment".to_string(),
                parameters: [("filename".to_string(), "secret.gpg".to_string())].into(),
            }),
            content_id: None,
            content_description: None,
            headers: HashMap::new(),
            body: vec![],
            text_content: None,
            parts: vec![],
        });
        let parsed = parse_email(&email);
        assert!(parsed.pgp_encrypted);
    }
}
