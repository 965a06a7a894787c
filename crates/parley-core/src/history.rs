//! Conversation history: the durable text projection of committed turns.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Minimum trimmed length (in characters) an interrupted reply needs before
/// it is kept in history.
pub const MIN_INTERRUPTED_CHARS: usize = 5;

/// Suffix appended to assistant replies cut short by the user.
pub const INTERRUPTED_MARKER: &str = " [interrupted by user]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged entry in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Record a partial assistant reply that was interrupted.
///
/// Returns `Cow::Borrowed(history)` untouched when the trimmed reply is shorter
/// than [`MIN_INTERRUPTED_CHARS`]; otherwise an owned copy with one extra
/// assistant entry ending in [`INTERRUPTED_MARKER`]. The input is never mutated.
pub fn append_interrupted<'a>(history: &'a [ChatMessage], partial: &str) -> Cow<'a, [ChatMessage]> {
    let trimmed = partial.trim();
    if trimmed.chars().count() < MIN_INTERRUPTED_CHARS {
        return Cow::Borrowed(history);
    }

    let mut updated = Vec::with_capacity(history.len() + 1);
    updated.extend_from_slice(history);
    updated.push(ChatMessage::assistant(format!("{trimmed}{INTERRUPTED_MARKER}")));
    Cow::Owned(updated)
}
