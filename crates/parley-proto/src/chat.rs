use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Where a chat line came from, from the point of view of the local client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Internal,
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub identifier: String,
    pub kind: AttachmentKind,
    /// Base64 or data-URL payload; opaque to the protocol.
    pub data: String,
}

/// A chat line. Serialized as JSON and sealed before it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(default)]
    pub origin: MessageOrigin,
    pub author: String,
    pub content: String,
    /// Unix epoch milliseconds.
    pub date: i64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

pub const UNKNOWN_AUTHOR: &str = "Unknown";
pub const UNREADABLE_CONTENT: &str = "<Encrypted message>";

impl ChatMessage {
    pub fn local(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            origin: MessageOrigin::Local,
            author: author.into(),
            content: content.into(),
            date: Utc::now().timestamp_millis(),
            attachments: Vec::new(),
        }
    }

    pub fn internal(content: impl Into<String>) -> Self {
        Self {
            origin: MessageOrigin::Internal,
            author: String::new(),
            content: content.into(),
            date: Utc::now().timestamp_millis(),
            attachments: Vec::new(),
        }
    }

    /// Stand-in surfaced when an inbound message cannot be opened.
    pub fn unreadable() -> Self {
        Self {
            origin: MessageOrigin::Remote,
            author: UNKNOWN_AUTHOR.to_string(),
            content: UNREADABLE_CONTENT.to_string(),
            date: Utc::now().timestamp_millis(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn is_unreadable(&self) -> bool {
        self.author == UNKNOWN_AUTHOR && self.content == UNREADABLE_CONTENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn missing_origin_and_attachments_default() {
        let parsed: ChatMessage =
            serde_json::from_str(r#"{"author":"bob","content":"hey","date":1700000000000}"#)
                .unwrap();
        assert_eq!(parsed.origin, MessageOrigin::Local);
        assert!(parsed.attachments.is_empty());
    }

    #[test_timeout::timeout]
    fn placeholder_is_recognisable() {
        let placeholder = ChatMessage::unreadable();
        assert!(placeholder.is_unreadable());
        assert_eq!(placeholder.origin, MessageOrigin::Remote);
        assert!(!ChatMessage::local("Unknown", "hello").is_unreadable());
    }

    #[test_timeout::timeout]
    fn attachments_serialize_with_kind() {
        let message = ChatMessage::local("alice", "look").with_attachment(Attachment {
            identifier: "img-1".into(),
            kind: AttachmentKind::Image,
            data: "data:image/png;base64,AAAA".into(),
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["attachments"][0]["kind"], "image");
        assert_eq!(value["origin"], "local");
    }
}
