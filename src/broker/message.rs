//! Message Types
//!
//! Messages as seen by the bridge on the consuming side, and the payload
//! handed to a producer on the destination side.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Body of a queued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Text message body
    Text(String),
    /// Binary message body
    Bytes(Bytes),
}

impl MessageBody {
    /// Name of the body type, used in error reports
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Text(_) => "text",
            MessageBody::Bytes(_) => "bytes",
        }
    }

    /// Body length in bytes
    pub fn len(&self) -> usize {
        match self {
            MessageBody::Text(s) => s.len(),
            MessageBody::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of the body
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MessageBody::Text(s) => s.as_bytes(),
            MessageBody::Bytes(b) => b,
        }
    }
}

impl From<&str> for MessageBody {
    fn from(s: &str) -> Self {
        MessageBody::Text(s.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(s: String) -> Self {
        MessageBody::Text(s)
    }
}

impl From<Bytes> for MessageBody {
    fn from(b: Bytes) -> Self {
        MessageBody::Bytes(b)
    }
}

/// Payload sent to a destination queue. Only the body crosses the bridge.
pub type Payload = MessageBody;

/// A message received from a source queue
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned message identifier
    pub message_id: String,
    /// Message body
    pub body: MessageBody,
    /// Application headers/properties (never propagated by the bridge)
    pub headers: BTreeMap<String, String>,
    /// Number of times this message has been delivered, starting at 1
    pub delivery_count: u32,
}

impl Message {
    pub fn new(message_id: impl Into<String>, body: impl Into<MessageBody>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            headers: BTreeMap::new(),
            delivery_count: 1,
        }
    }

    /// Attach a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Whether the broker has delivered this message before
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} body, {} bytes, delivery {})",
            self.message_id,
            self.body.kind(),
            self.body.len(),
            self.delivery_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_kind_and_len() {
        let text = MessageBody::from("hello");
        assert_eq!(text.kind(), "text");
        assert_eq!(text.len(), 5);

        let bytes = MessageBody::from(Bytes::from_static(&[0, 1, 2]));
        assert_eq!(bytes.kind(), "bytes");
        assert_eq!(bytes.as_bytes(), &[0, 1, 2]);

        assert!(MessageBody::from("").is_empty());
    }

    #[test]
    fn test_redelivered() {
        let mut msg = Message::new("ID:1", "x");
        assert!(!msg.redelivered());
        msg.delivery_count = 2;
        assert!(msg.redelivered());
        assert_eq!(msg.to_string(), "ID:1 (text body, 1 bytes, delivery 2)");
    }
}
