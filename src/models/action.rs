//! The IMAP action sum type and the parsed/validated LLM result that carries it
//! (`spec.md` §3, §6).

use serde::{Deserialize, Serialize};

use crate::llm::parser::ActionKind;

/// A single IMAP effect the message processor may execute, as returned
/// (after validation) by the response parser. The wire encoding is exactly
/// `{"type":...,"folder"?:...,"flags"?:[...],"reason"?:...}` per `spec.md` §6,
/// so every variant carries an optional `reason` and only `Move`/`Flag` carry
/// their required field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Move {
        folder: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Flag {
        flags: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Read {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Delete {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Spam {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Noop {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Action {
    pub fn noop(reason: impl Into<String>) -> Self {
        Action::Noop {
            reason: Some(reason.into()),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Move { .. } => ActionKind::Move,
            Action::Flag { .. } => ActionKind::Flag,
            Action::Read { .. } => ActionKind::Read,
            Action::Delete { .. } => ActionKind::Delete,
            Action::Spam { .. } => ActionKind::Spam,
            Action::Noop { .. } => ActionKind::Noop,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Action::Move { reason, .. }
            | Action::Flag { reason, .. }
            | Action::Read { reason }
            | Action::Delete { reason }
            | Action::Spam { reason }
            | Action::Noop { reason } => reason.as_deref(),
        }
    }

    /// Downgrades to a `noop` carrying `reason`, used whenever a structural
    /// invariant or the account's allow-list rejects this action.
    pub fn downgrade(reason: impl Into<String>) -> Self {
        Action::noop(reason)
    }

    /// Encodes this action the way the header-injection rewrite does
    /// (`spec.md` §4.8 step 3): `move:<folder>`, `flag:<f1>+<f2>`, `read`,
    /// `delete`, `spam`, `noop:<reason>`.
    pub fn format_for_header(&self) -> String {
        match self {
            Action::Move { folder, .. } => format!("move:{folder}"),
            Action::Flag { flags, .. } => format!("flag:{}", flags.join("+")),
            Action::Read { .. } => "read".to_string(),
            Action::Delete { .. } => "delete".to_string(),
            Action::Spam { .. } => "spam".to_string(),
            Action::Noop { reason } => match reason {
                Some(r) => format!("noop:{r}"),
                None => "noop".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The fully validated result of classifying one message, ready for the
/// action filter and executor. `actions` is guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLlmResult {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ParsedLlmResult {
    pub fn noop(reason: impl Into<String>) -> Self {
        ParsedLlmResult {
            actions: vec![Action::noop(reason)],
            confidence: None,
            reasoning: None,
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_header_encoding() {
        assert_eq!(
            Action::Move { folder: "Archive".into(), reason: None }.format_for_header(),
            "move:Archive"
        );
        assert_eq!(
            Action::Flag { flags: vec!["\\Flagged".into(), "$Junk".into()], reason: None }
                .format_for_header(),
            "flag:\\Flagged+$Junk"
        );
        assert_eq!(Action::Read { reason: None }.format_for_header(), "read");
        assert_eq!(
            Action::Noop { reason: Some("low confidence".into()) }.format_for_header(),
            "noop:low confidence"
        );
    }

    #[test]
    fn serializes_to_wire_shape() {
        let action = Action::Move {
            folder: "Archive".to_string(),
            reason: Some("newsletter".to_string()),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "move");
        assert_eq!(value["folder"], "Archive");
        assert_eq!(value["reason"], "newsletter");
    }
}
