//! Recovery-oriented JSON parser and action filter (`spec.md` §4.9).
//!
//! The parser never fails: every code path that cannot produce a usable
//! action list instead returns a single `{"type":"noop","reason":...}`
//! action, matching the testable property in `spec.md` §8 that
//! `Validate(Parse(R))` never throws.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Action, ParsedLlmResult};

/// The action tag values the wire schema and the account allow-list share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Move,
    Flag,
    Read,
    Delete,
    Spam,
    Noop,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Move => "move",
            ActionKind::Flag => "flag",
            ActionKind::Read => "read",
            ActionKind::Delete => "delete",
            ActionKind::Spam => "spam",
            ActionKind::Noop => "noop",
        }
    }

    pub const ALL: [ActionKind; 6] = [
        ActionKind::Move,
        ActionKind::Flag,
        ActionKind::Read,
        ActionKind::Delete,
        ActionKind::Spam,
        ActionKind::Noop,
    ];
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "move" => Ok(ActionKind::Move),
            "flag" => Ok(ActionKind::Flag),
            "read" => Ok(ActionKind::Read),
            "delete" => Ok(ActionKind::Delete),
            "spam" => Ok(ActionKind::Spam),
            "noop" => Ok(ActionKind::Noop),
            other => Err(other.to_string()),
        }
    }
}

/// Strips a fenced ```` ```json ... ``` ```` or ```` ``` ... ``` ```` block,
/// returning its interior if present.
fn strip_code_fence(input: &str) -> &str {
    let trimmed = input.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("JSON"))
            .unwrap_or(rest);
        let rest = rest.trim_start_matches(['\n', '\r']);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
        return rest.trim();
    }
    trimmed
}

/// Finds the largest `{...}` substring (by brace matching from the first
/// `{` to its matching close), used to recover JSON embedded in prose.
fn extract_largest_object(input: &str) -> Option<String> {
    let start = input.find('{')?;
    let bytes = input.as_bytes();
    let mut depth = 0i32;
    let mut end = None;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    end.map(|e| input[start..=e].to_string())
}

fn parse_json_with_recovery(raw: &str) -> Value {
    let candidate = strip_code_fence(raw);
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return value;
    }
    if let Some(extracted) = extract_largest_object(candidate) {
        if let Ok(value) = serde_json::from_str::<Value>(&extracted) {
            return value;
        }
    }
    Value::Null
}

/// Applies the per-action sanity rules in `spec.md` §4.9 step 5 to one
/// structurally-valid action object (one that at least has a string
/// `"type"` field). Always returns an `Action` — never drops the item.
fn validate_action_object(obj: &Value) -> Action {
    let kind = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let reason = obj
        .get("reason")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match ActionKind::from_str(kind) {
        Ok(ActionKind::Move) => match obj.get("folder").and_then(|v| v.as_str()) {
            Some(folder) if !folder.is_empty() => Action::Move {
                folder: folder.to_string(),
                reason,
            },
            _ => Action::downgrade("Move action missing folder"),
        },
        Ok(ActionKind::Flag) => {
            let flags: Vec<String> = obj
                .get("flags")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|f| f.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            if flags.is_empty() {
                Action::downgrade("Flag action missing flags")
            } else {
                Action::Flag { flags, reason }
            }
        }
        Ok(ActionKind::Read) => Action::Read { reason },
        Ok(ActionKind::Delete) => Action::Delete { reason },
        Ok(ActionKind::Spam) => Action::Spam { reason },
        Ok(ActionKind::Noop) => Action::Noop { reason },
        Err(unknown) => Action::downgrade(format!("Unknown action type '{unknown}'")),
    }
}

/// Parses a raw assistant content string into a fully validated
/// [`ParsedLlmResult`]. Implements `spec.md` §4.9 steps 1-6.
pub fn parse_and_validate(raw_content: &str) -> ParsedLlmResult {
    let value = parse_json_with_recovery(raw_content);

    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|f| f as f32)
        .filter(|c| (0.0..=1.0).contains(c));
    let reasoning = value
        .get("reasoning")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let raw_actions = value
        .get("actions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    // "Survivors" are array entries that are objects carrying a string
    // `type` field; anything else (not an object, missing `type`) is
    // dropped rather than guessed at.
    let actions: Vec<Action> = raw_actions
        .iter()
        .filter(|item| item.is_object() && item.get("type").and_then(|t| t.as_str()).is_some())
        .map(validate_action_object)
        .collect();

    if actions.is_empty() {
        return ParsedLlmResult::noop("No actions after validation");
    }

    ParsedLlmResult {
        actions,
        confidence,
        reasoning,
        usage: None,
    }
}

/// Applies the account's allow-list to a validated action list (`spec.md`
/// §4.9 "Action filter"): anything not allowed becomes an explanatory
/// `noop`; an entirely-filtered list becomes a single `noop`.
pub fn filter_actions(actions: Vec<Action>, allowed: &HashSet<ActionKind>) -> Vec<Action> {
    let filtered: Vec<Action> = actions
        .into_iter()
        .map(|action| {
            if allowed.contains(&action.kind()) {
                action
            } else {
                Action::downgrade(format!(
                    "Action '{}' is not allowed for this account",
                    action.kind().as_str()
                ))
            }
        })
        .collect();

    if filtered.is_empty() {
        vec![Action::downgrade("No allowed actions")]
    } else {
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed_default() -> HashSet<ActionKind> {
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

    #[test]
    fn parses_plain_json() {
        let result = parse_and_validate(
            r#"{"actions":[{"type":"move","folder":"Archive","reason":"newsletter"}]}"#,
        );
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].kind(), ActionKind::Move);
    }

    #[test]
    fn recovers_from_fenced_block() {
        let raw = "```json\n{\"actions\":[{\"type\":\"read\"}]}\n```";
        let result = parse_and_validate(raw);
        assert_eq!(result.actions[0].kind(), ActionKind::Read);
    }

    #[test]
    fn recovers_largest_object_from_prose() {
        let raw = "Sure thing! Here you go: {\"actions\":[{\"type\":\"spam\"}]} Hope that helps.";
        let result = parse_and_validate(raw);
        assert_eq!(result.actions[0].kind(), ActionKind::Spam);
    }

    #[test]
    fn unparseable_input_becomes_single_noop() {
        let result = parse_and_validate("not json at all");
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].kind(), ActionKind::Noop);
    }

    #[test]
    fn move_without_folder_downgrades() {
        let result = parse_and_validate(r#"{"actions":[{"type":"move"}]}"#);
        assert_eq!(result.actions[0].kind(), ActionKind::Noop);
        assert_eq!(result.actions[0].reason(), Some("Move action missing folder"));
    }

    #[test]
    fn flag_without_flags_downgrades() {
        let result = parse_and_validate(r#"{"actions":[{"type":"flag","flags":[]}]}"#);
        assert_eq!(result.actions[0].kind(), ActionKind::Noop);
        assert_eq!(result.actions[0].reason(), Some("Flag action missing flags"));
    }

    #[test]
    fn empty_actions_array_becomes_noop() {
        let result = parse_and_validate(r#"{"actions":[]}"#);
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].kind(), ActionKind::Noop);
    }

    #[test]
    fn filter_blocks_delete_by_default() {
        let actions = vec![Action::Delete { reason: Some("spam".into()) }];
        let filtered = filter_actions(actions, &allowed_default());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].kind(), ActionKind::Noop);
        assert!(filtered[0].reason().unwrap().contains("not allowed"));
    }

    #[test]
    fn filter_passes_allowed_action() {
        let actions = vec![Action::Move { folder: "Archive".into(), reason: None }];
        let filtered = filter_actions(actions, &allowed_default());
        assert_eq!(filtered[0].kind(), ActionKind::Move);
    }
}
