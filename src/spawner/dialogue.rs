//! Dialogue-state extraction: recovers a structured `DialogueState` from an
//! assistant's free-text reply, trying three carrier strategies in order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueStatus {
    NeedsInput,
    NeedsApproval,
    NeedsVerification,
    Approved,
    Rejected,
    Completed,
}

impl DialogueStatus {
    /// The first three statuses block a sync spawn from completing.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            DialogueStatus::NeedsInput | DialogueStatus::NeedsApproval | DialogueStatus::NeedsVerification
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    pub status: DialogueStatus,
    pub turn: Option<u64>,
    pub message_to_user: Option<String>,
    pub pending_questions: Option<Vec<String>>,
    pub accumulated_direction: Option<String>,
}

/// Tries direct parse, then fenced code blocks, then an embedded
/// `"dialogue_state"` key, returning the first success. Non-blocking
/// statuses never yield a blocking extraction.
pub fn extract_dialogue_state(text: &str) -> Option<DialogueState> {
    direct_parse(text)
        .or_else(|| code_block_extraction(text))
        .or_else(|| embedded_extraction(text))
}

fn value_to_state(value: &Value) -> Option<DialogueState> {
    let state: DialogueState = serde_json::from_value(value.clone()).ok()?;
    Some(state)
}

/// If the full text is a structured object, return its `dialogue_state`
/// field, or the object itself when its `status` is blocking.
fn direct_parse(text: &str) -> Option<DialogueState> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    parse_from_object(&value)
}

fn parse_from_object(value: &Value) -> Option<DialogueState> {
    if let Some(nested) = value.get("dialogue_state") {
        if let Some(state) = value_to_state(nested) {
            return Some(state);
        }
    }
    if let Some(state) = value_to_state(value) {
        if state.status.is_blocking() {
            return Some(state);
        }
    }
    None
}

/// Scans for fenced code blocks (labeled or not) and parses each until one
/// matches the direct-parse rule.
fn code_block_extraction(text: &str) -> Option<DialogueState> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        let end = body.find("```")?;
        let candidate = &body[..end];
        if let Some(state) = direct_parse(candidate) {
            return Some(state);
        }
        rest = &body[end + 3..];
    }
    None
}

/// Finds the key `"dialogue_state"` followed by a balanced brace object and
/// parses just that span.
fn embedded_extraction(text: &str) -> Option<DialogueState> {
    let key = "\"dialogue_state\"";
    let key_pos = text.find(key)?;
    let after_key = &text[key_pos + key.len()..];
    let brace_start = after_key.find('{')?;
    let object_text = &after_key[brace_start..];

    let mut depth = 0i32;
    let mut end_index = None;
    for (i, ch) in object_text.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end_index = Some(i + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end_index?;
    let value: Value = serde_json::from_str(&object_text[..end]).ok()?;
    let state = value_to_state(&value)?;
    if state.status.is_blocking() {
        Some(state)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_plain_carrier() {
        let text = r#"{"dialogue_state":{"status":"needs_input","turn":1}}"#;
        let state = extract_dialogue_state(text).unwrap();
        assert_eq!(state.status, DialogueStatus::NeedsInput);
        assert_eq!(state.turn, Some(1));
    }

    #[test]
    fn fenced_code_block_carrier() {
        let text = "some preamble\n```json\n{\"status\":\"needs_approval\"}\n```\ntrailing";
        let state = extract_dialogue_state(text).unwrap();
        assert_eq!(state.status, DialogueStatus::NeedsApproval);
    }

    #[test]
    fn embedded_prose_carrier() {
        let text = r#"prose before "dialogue_state": {"status":"needs_verification"} prose after"#;
        let state = extract_dialogue_state(text).unwrap();
        assert_eq!(state.status, DialogueStatus::NeedsVerification);
    }

    #[test]
    fn non_blocking_status_with_no_dialogue_state_field_yields_none() {
        let text = r#"{"status":"completed"}"#;
        assert!(extract_dialogue_state(text).is_none());
    }

    #[test]
    fn non_blocking_wrapped_status_also_yields_none() {
        let text = r#"{"dialogue_state":{"status":"approved"}}"#;
        // approved is non-blocking but explicitly wrapped, so rule 1 still
        // returns the object as-is -- callers are responsible for treating
        // non-blocking extractions as "no action needed" rather than error.
        let state = extract_dialogue_state(text).unwrap();
        assert!(!state.status.is_blocking());
    }
}
