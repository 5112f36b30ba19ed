use reqwest::Response;
use serde_json::{json, Value};

use crate::errors::BackendError;
use crate::models::message::Conversation;
use crate::models::role::Role;

/// Convert a conversation to the chat completions message list, system prompt first.
///
/// Messages without any text (for example attachments only) are skipped.
pub fn messages_to_openai_spec(system: &str, conversation: &Conversation) -> Vec<Value> {
    let mut messages_spec = vec![json!({
        "role": Role::System.as_str(),
        "content": system,
    })];

    for message in conversation.messages() {
        let text = message.text();
        if text.is_empty() {
            continue;
        }
        messages_spec.push(json!({
            "role": message.role.as_str(),
            "content": text,
        }));
    }

    messages_spec
}

/// Pass successful responses through, classify the rest
pub async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::from_status(status, &body))
}

/// Strip a surrounding markdown code fence, as models often wrap JSON in one
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // drop the info string, e.g. ```json
    match inner.split_once('\n') {
        Some((info, body)) if !info.trim().contains(' ') => body.trim(),
        _ => inner.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;

    #[test]
    fn test_messages_to_openai_spec() {
        let conversation = Conversation::new(vec![
            Message::system().with_text("Prefer metric units."),
            Message::user().with_text("How warm is it?"),
            Message::assistant(),
            Message::assistant().with_text("About 20C."),
        ]);

        let spec = messages_to_openai_spec("You are helpful.", &conversation);
        assert_eq!(
            spec,
            vec![
                json!({"role": "system", "content": "You are helpful."}),
                json!({"role": "system", "content": "Prefer metric units."}),
                json!({"role": "user", "content": "How warm is it?"}),
                json!({"role": "assistant", "content": "About 20C."}),
            ]
        );
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }
}
