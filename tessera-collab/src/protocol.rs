//! Wire protocol for document synchronization.
//!
//! Binary frames carry one tag byte followed by the raw payload:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ msg_type │ payload                      │
//! │ 1 byte   │ state vector / update / blob │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! Text frames are JSON objects (`{"type": "update", "document": "...",
//! "update": [..]}`). Byte payloads arrive either as an array of numbers or
//! as an object keyed by decimal indices; both normalize to the same bytes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound for a single inbound frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Tags of the binary frame form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector of the sender
    SyncStep1 = 0,
    /// Update answering a state vector
    SyncStep2 = 1,
    /// Incremental update
    Update = 2,
    /// Opaque presence blob
    Awareness = 3,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::SyncStep1),
            1 => Some(Self::SyncStep2),
            2 => Some(Self::Update),
            3 => Some(Self::Awareness),
            _ => None,
        }
    }
}

/// Which frame form a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    #[default]
    Binary,
    Text,
}

/// One message as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

impl Frame {
    pub fn kind(&self) -> Option<FrameKind> {
        match self {
            Frame::Binary(_) => Some(FrameKind::Binary),
            Frame::Text(_) => Some(FrameKind::Text),
            Frame::Close => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Binary(b) => b.len(),
            Frame::Text(t) => t.len(),
            Frame::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(Vec<u8>),
    /// Asks for the receiver's state vector. Text form only.
    SyncRequest,
    Ping,
    Pong,
}

impl SyncMessage {
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Self::SyncStep1(_) => Some(MessageType::SyncStep1),
            Self::SyncStep2(_) => Some(MessageType::SyncStep2),
            Self::Update(_) => Some(MessageType::Update),
            Self::Awareness(_) => Some(MessageType::Awareness),
            Self::SyncRequest | Self::Ping | Self::Pong => None,
        }
    }

    /// Serialize to the binary frame form.
    pub fn encode_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Self::SyncStep1(p) | Self::SyncStep2(p) | Self::Update(p) | Self::Awareness(p) => p,
            _ => return Err(ProtocolError::TextOnly(self.name())),
        };
        let tag = self.message_type().ok_or(ProtocolError::TextOnly(self.name()))?;
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(tag as u8);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Deserialize from the binary frame form.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        let payload = payload.to_vec();
        match MessageType::from_u8(tag).ok_or(ProtocolError::UnknownMessageType(tag))? {
            MessageType::SyncStep1 => Ok(Self::SyncStep1(payload)),
            MessageType::SyncStep2 => Ok(Self::SyncStep2(payload)),
            MessageType::Update => Ok(Self::Update(payload)),
            MessageType::Awareness => Ok(Self::Awareness(payload)),
        }
    }

    /// Serialize to the JSON text form, tagged with `document`.
    pub fn encode_text(&self, document: &str) -> Result<String, ProtocolError> {
        let mut msg = TextMessage {
            kind: String::new(),
            document: Some(document.to_string()),
            ..TextMessage::default()
        };
        match self {
            Self::SyncStep1(state) => {
                msg.kind = "sync".into();
                msg.state = Some(bytes_to_json(state));
            }
            Self::SyncStep2(update) => {
                msg.kind = "sync".into();
                msg.update = Some(bytes_to_json(update));
            }
            Self::Update(update) => {
                msg.kind = "update".into();
                msg.update = Some(bytes_to_json(update));
            }
            Self::Awareness(blob) => {
                msg.kind = "awareness".into();
                msg.awareness = Some(bytes_to_json(blob));
            }
            Self::SyncRequest => msg.kind = "sync_request".into(),
            Self::Ping => msg.kind = "ping".into(),
            Self::Pong => {
                msg.kind = "pong".into();
                msg.document = None;
            }
        }
        serde_json::to_string(&msg).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the JSON text form.
    ///
    /// A `sync` carrying `state` is a sync-step-1, a `sync` carrying only
    /// `update` is a sync-step-2, and a bare `sync` asks for the state vector.
    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }
        let msg: TextMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        match msg.kind.as_str() {
            "sync" => match (&msg.state, &msg.update) {
                (Some(state), _) => Ok(Self::SyncStep1(json_to_bytes(state)?)),
                (None, Some(update)) => Ok(Self::SyncStep2(json_to_bytes(update)?)),
                (None, None) => Ok(Self::SyncRequest),
            },
            "sync_request" => Ok(Self::SyncRequest),
            "update" => {
                let update = msg.update.as_ref().ok_or(ProtocolError::MissingField("update"))?;
                Ok(Self::Update(json_to_bytes(update)?))
            }
            "awareness" => {
                let blob = msg
                    .awareness
                    .as_ref()
                    .ok_or(ProtocolError::MissingField("awareness"))?;
                Ok(Self::Awareness(json_to_bytes(blob)?))
            }
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownTextType(other.to_string())),
        }
    }

    /// Encode in the given frame form.
    pub fn to_frame(&self, kind: FrameKind, document: &str) -> Result<Frame, ProtocolError> {
        match kind {
            FrameKind::Binary => match self.encode_binary() {
                Ok(bytes) => Ok(Frame::Binary(bytes)),
                // ping/pong have no binary tag; fall back to text
                Err(ProtocolError::TextOnly(_)) => Ok(Frame::Text(self.encode_text(document)?)),
                Err(e) => Err(e),
            },
            FrameKind::Text => Ok(Frame::Text(self.encode_text(document)?)),
        }
    }

    /// Decode whichever frame form arrived.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame {
            Frame::Binary(bytes) => Self::decode_binary(bytes),
            Frame::Text(text) => Self::decode_text(text),
            Frame::Close => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SyncStep1(_) => "sync_step1",
            Self::SyncStep2(_) => "sync_step2",
            Self::Update(_) => "update",
            Self::Awareness(_) => "awareness",
            Self::SyncRequest => "sync_request",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TextMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    update: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    awareness: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

fn bytes_to_json(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|&b| Value::from(b)).collect())
}

fn json_byte(value: &Value) -> Result<u8, ProtocolError> {
    value
        .as_u64()
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| ProtocolError::InvalidPayload(format!("not a byte: {value}")))
}

/// Normalize either byte encoding to a `Vec<u8>`.
pub fn json_to_bytes(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    match value {
        Value::Array(items) => items.iter().map(json_byte).collect(),
        Value::Object(map) => object_to_bytes(map),
        Value::Null => Ok(Vec::new()),
        other => Err(ProtocolError::InvalidPayload(format!(
            "expected byte array, got {other}"
        ))),
    }
}

fn object_to_bytes(map: &Map<String, Value>) -> Result<Vec<u8>, ProtocolError> {
    let mut out = vec![0u8; map.len()];
    let mut seen = vec![false; map.len()];
    for (key, value) in map {
        let index: usize = key
            .parse()
            .map_err(|_| ProtocolError::InvalidPayload(format!("bad index key {key:?}")))?;
        if index >= out.len() || seen[index] {
            return Err(ProtocolError::InvalidPayload(format!(
                "index {index} out of range or repeated"
            )));
        }
        out[index] = json_byte(value)?;
        seen[index] = true;
    }
    Ok(out)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    EmptyFrame,
    FrameTooLarge(usize),
    UnknownMessageType(u8),
    UnknownTextType(String),
    MissingField(&'static str),
    InvalidPayload(String),
    TextOnly(&'static str),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::EmptyFrame => write!(f, "Empty frame"),
            Self::FrameTooLarge(n) => write!(f, "Frame of {n} bytes exceeds limit"),
            Self::UnknownMessageType(t) => write!(f, "Unknown message type {t}"),
            Self::UnknownTextType(t) => write!(f, "Unknown message type {t:?}"),
            Self::MissingField(name) => write!(f, "Missing field {name:?}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::TextOnly(name) => write!(f, "{name} has no binary form"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_frame_layout() {
        let msg = SyncMessage::Update(vec![9, 8, 7]);
        let encoded = msg.encode_binary().unwrap();
        assert_eq!(encoded, vec![2, 9, 8, 7]);
        assert_eq!(SyncMessage::decode_binary(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_binary_tags() {
        assert_eq!(SyncMessage::decode_binary(&[0]).unwrap(), SyncMessage::SyncStep1(vec![]));
        assert_eq!(SyncMessage::decode_binary(&[1, 5]).unwrap(), SyncMessage::SyncStep2(vec![5]));
        assert_eq!(SyncMessage::decode_binary(&[3, 1, 2]).unwrap(), SyncMessage::Awareness(vec![1, 2]));
    }

    #[test]
    fn test_binary_rejects_empty_and_unknown() {
        assert_eq!(SyncMessage::decode_binary(&[]), Err(ProtocolError::EmptyFrame));
        assert_eq!(
            SyncMessage::decode_binary(&[42, 1]),
            Err(ProtocolError::UnknownMessageType(42))
        );
    }

    #[test]
    fn test_text_payload_forms_normalize() {
        let array = r#"{"type":"update","document":"d","update":[1,2,3]}"#;
        let object = r#"{"type":"update","document":"d","update":{"2":3,"0":1,"1":2}}"#;
        let expected = SyncMessage::Update(vec![1, 2, 3]);
        assert_eq!(SyncMessage::decode_text(array).unwrap(), expected);
        assert_eq!(SyncMessage::decode_text(object).unwrap(), expected);
    }

    #[test]
    fn test_text_object_with_gap_rejected() {
        let text = r#"{"type":"update","update":{"0":1,"2":3}}"#;
        assert!(matches!(
            SyncMessage::decode_text(text),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_text_byte_out_of_range_rejected() {
        let text = r#"{"type":"awareness","awareness":[1,256]}"#;
        assert!(matches!(
            SyncMessage::decode_text(text),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_text_sync_variants() {
        assert_eq!(
            SyncMessage::decode_text(r#"{"type":"sync","state":[4]}"#).unwrap(),
            SyncMessage::SyncStep1(vec![4])
        );
        assert_eq!(
            SyncMessage::decode_text(r#"{"type":"sync","update":[4]}"#).unwrap(),
            SyncMessage::SyncStep2(vec![4])
        );
        assert_eq!(
            SyncMessage::decode_text(r#"{"type":"sync","document":"d"}"#).unwrap(),
            SyncMessage::SyncRequest
        );
        assert_eq!(
            SyncMessage::decode_text(r#"{"type":"sync_request","user_id":"u1"}"#).unwrap(),
            SyncMessage::SyncRequest
        );
    }

    #[test]
    fn test_text_update_without_payload_rejected() {
        assert_eq!(
            SyncMessage::decode_text(r#"{"type":"update"}"#),
            Err(ProtocolError::MissingField("update"))
        );
        assert!(matches!(
            SyncMessage::decode_text(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownTextType(_))
        ));
        assert!(matches!(
            SyncMessage::decode_text("not json"),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_pong_text_shape() {
        let text = SyncMessage::Pong.encode_text("doc-1").unwrap();
        assert_eq!(text, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_state_vector_text_shape() {
        let text = SyncMessage::SyncStep1(vec![1, 0]).encode_text("doc-1").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "sync", "document": "doc-1", "state": [1, 0]})
        );
    }

    #[test]
    fn test_ping_falls_back_to_text_in_binary_session() {
        let frame = SyncMessage::Pong.to_frame(FrameKind::Binary, "d").unwrap();
        assert_eq!(frame, Frame::Text(r#"{"type":"pong"}"#.into()));
        let frame = SyncMessage::Update(vec![1]).to_frame(FrameKind::Binary, "d").unwrap();
        assert_eq!(frame, Frame::Binary(vec![2, 1]));
    }

    #[test]
    fn test_from_frame_dispatch() {
        let text = Frame::Text(r#"{"type":"ping"}"#.into());
        assert_eq!(SyncMessage::from_frame(&text).unwrap(), SyncMessage::Ping);
        assert_eq!(
            SyncMessage::from_frame(&Frame::Close),
            Err(ProtocolError::ConnectionClosed)
        );
    }
}
