use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of characters of an uploaded file kept as chat context.
pub const FILE_CONTEXT_MAX_CHARS: usize = 12_000;

// Who authored a message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    /// Role string expected by the completion endpoint.
    pub fn as_role(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }
}

/// Captured request state attached to a failed message so a retry replays
/// the original request instead of re-reading possibly-changed UI state.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RetryPayload {
    /// The user message whose send failed.
    pub user_message: Box<Message>,
    /// The session's message list at the moment of failure, optimistic
    /// append included, error marker excluded.
    pub messages: Vec<Message>,
}

// A normal reply vs. a failed-call placeholder. Error messages always carry
// their retry payload; an error without one is unrepresentable.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Normal,
    Error {
        retry: RetryPayload,
    },
}

impl MessageKind {
    pub fn is_error(&self) -> bool {
        matches!(self, MessageKind::Error { .. })
    }
}

// Represents a single message in a session
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")] // Generate a new UUID if missing during deserialization
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub kind: MessageKind,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text, MessageKind::Normal)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Sender::Assistant, text, MessageKind::Normal)
    }

    /// Failed-call placeholder carrying the state needed for replay.
    pub fn error(text: impl Into<String>, retry: RetryPayload) -> Self {
        Self::new(Sender::Assistant, text, MessageKind::Error { retry })
    }

    pub fn is_error(&self) -> bool {
        self.kind.is_error()
    }

    fn new(sender: Sender, text: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text: text.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Snapshot of an uploaded text file, attached to exactly the first outbound
/// request of its session.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileContext {
    pub name: String,
    /// Original size in bytes, before truncation.
    pub size: u64,
    pub content: String,
}

impl FileContext {
    pub fn new(name: impl Into<String>, size: u64, content: &str) -> Self {
        let truncated: String = content.chars().take(FILE_CONTEXT_MAX_CHARS).collect();
        Self {
            name: name.into(),
            size,
            content: truncated,
        }
    }

    /// Display size used in titles and the outbound file preamble.
    pub fn size_kb(&self) -> String {
        format!("{:.1} KB", self.size as f64 / 1024.0)
    }
}

// Represents one chat thread with its own message history and metadata
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatSession {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    pub subtitle: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_context: Option<FileContext>,
}

impl ChatSession {
    pub fn new(title: impl Into<String>, subtitle: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            subtitle: subtitle.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            file_context: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_context_truncates_content() {
        let long = "x".repeat(FILE_CONTEXT_MAX_CHARS + 500);
        let ctx = FileContext::new("dump.log", long.len() as u64, &long);
        assert_eq!(ctx.content.chars().count(), FILE_CONTEXT_MAX_CHARS);
        assert_eq!(ctx.size, long.len() as u64);
    }

    #[test]
    fn error_kind_round_trips_with_payload() {
        let user = Message::user("hi");
        let payload = RetryPayload {
            user_message: Box::new(user.clone()),
            messages: vec![user],
        };
        let msg = Message::error("connection lost", payload);

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back.kind {
            MessageKind::Error { retry } => {
                assert_eq!(retry.messages.len(), 1);
                assert_eq!(retry.user_message.text, "hi");
            }
            MessageKind::Normal => panic!("error kind lost in round trip"),
        }
    }

    #[test]
    fn normal_messages_deserialize_without_kind_field() {
        let json = r#"{"id":"7f8df29a-9d3a-4f6e-9e37-6a4cb5f4a111","sender":"user","text":"hi","timestamp":"2025-01-01T00:00:00Z"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(!msg.kind.is_error());
    }
}
