use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Endpoint path peers dial and the hub serves the WebSocket upgrade on.
pub const WS_PATH: &str = "/ws";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message format: {0}")]
    InvalidFormat(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Clipboard,
    Ping,
    Pong,
}

/// One wire frame: a single JSON object per WebSocket text frame.
///
/// `content` and `source` are empty strings for ping/pong. The timestamp is
/// stamped at construction and is informational only; it never drives
/// ordering decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub source: String,
}

impl Message {
    pub fn clipboard(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Clipboard,
            content: content.into(),
            timestamp: now_millis(),
            source: source.into(),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            content: String::new(),
            timestamp: now_millis(),
            source: String::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: MessageKind::Pong,
            content: String::new(),
            timestamp: now_millis(),
            source: String::new(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("message serialization should not fail")
    }

    /// Decode one frame. A failure here is never fatal to the connection:
    /// callers skip the frame and keep reading.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipboard_roundtrip() {
        let msg = Message::clipboard("hello", "server");
        let decoded = Message::decode(msg.encode().as_bytes()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind, MessageKind::Clipboard);
        assert_eq!(decoded.content, "hello");
        assert_eq!(decoded.source, "server");
    }

    #[test]
    fn test_unicode_and_empty_content_roundtrip() {
        for content in ["", "héllo 世界 🦀\nline two"] {
            let msg = Message::clipboard(content, "client");
            let decoded = Message::decode(msg.encode().as_bytes()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = Message::ping();
        let pong = Message::pong();
        assert_eq!(Message::decode(ping.encode().as_bytes()).unwrap(), ping);
        assert_eq!(Message::decode(pong.encode().as_bytes()).unwrap(), pong);
        assert!(ping.content.is_empty());
        assert!(pong.source.is_empty());
    }

    #[test]
    fn test_wire_field_names() {
        let json = Message::clipboard("x", "server").encode();
        assert!(json.contains("\"type\":\"clipboard\""));
        assert!(json.contains("\"timestamp\""));

        let json = Message::ping().encode();
        assert!(json.contains("\"type\":\"ping\""));
        // ping/pong still carry the full object shape
        assert!(json.contains("\"content\":\"\""));
        assert!(json.contains("\"source\":\"\""));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(b"{\"type\":\"nonsense\",\"timestamp\":0}").is_err());
        assert!(Message::decode(b"").is_err());
    }

    #[test]
    fn test_decode_missing_optional_fields() {
        // a minimal ping from another implementation
        let msg = Message::decode(b"{\"type\":\"ping\",\"timestamp\":123}").unwrap();
        assert_eq!(msg.kind, MessageKind::Ping);
        assert_eq!(msg.content, "");
        assert_eq!(msg.source, "");
    }
}
