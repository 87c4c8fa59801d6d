//! Message types
//!
//! Defines chat message structures and roles kept in a session's history.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the model
    Assistant,
    /// System prompt
    System,
}

impl Role {
    /// Role name as expected by chat templates
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Render a history as a plain transcript, ending with an open assistant turn.
///
/// Used when the model carries no chat template of its own.
pub fn plain_transcript(history: &[Message]) -> String {
    let mut out = String::new();
    for msg in history {
        out.push_str(msg.role.as_str());
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push('\n');
    }
    out.push_str(Role::Assistant.as_str());
    out.push(':');
    out
}
