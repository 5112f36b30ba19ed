use serde::{Deserialize, Serialize};

use super::role::Role;

/// A typed part of a structured message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentPart {
    pub fn text<S: Into<String>>(text: S) -> Self {
        ContentPart {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }

    /// Text carried by this part, if it is a text part
    pub fn as_text(&self) -> Option<&str> {
        if self.kind == "text" {
            self.text.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
/// Message body: either plain text or a list of typed parts
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Parts(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from the assistant
pub struct Message {
    pub role: Role,
    #[serde(default, alias = "parts")]
    pub content: MessageContent,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Message {
            role,
            content: MessageContent::default(),
        }
    }

    /// Create a new user message
    pub fn user() -> Self {
        Message::new(Role::User)
    }

    /// Create a new assistant message
    pub fn assistant() -> Self {
        Message::new(Role::Assistant)
    }

    pub fn system() -> Self {
        Message::new(Role::System)
    }

    /// Add a text part to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_part(ContentPart::text(text))
    }

    /// Add any part to the message
    pub fn with_part(mut self, part: ContentPart) -> Self {
        let parts = match self.content {
            MessageContent::Text(text) if text.is_empty() => vec![part],
            MessageContent::Text(text) => vec![ContentPart::text(text), part],
            MessageContent::Parts(mut parts) => {
                parts.push(part);
                parts
            }
        };
        self.content = MessageContent::Parts(parts);
        self
    }

    /// All text in the message, parts concatenated in order
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts.iter().filter_map(|p| p.as_text()).collect(),
        }
    }
}

/// Ordered messages forming the input to one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation(Vec<Message>);

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Conversation(messages)
    }

    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Text of the most recent user message, or an empty string
    pub fn last_user_text(&self) -> String {
        self.0
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Conversation(messages)
    }
}
