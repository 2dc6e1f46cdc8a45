//! OCFT wire protocol: message envelope, the seven payload kinds, JSON (de)serialization and
//! the prefixed Base64 text form carried over chat channels.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::now_millis;

/// Current protocol version, stamped on every message.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Marker that starts every encoded message, so hosts can tell protocol traffic from chat.
pub const TRANSPORT_PREFIX: &str = "OCFT:";

/// Ack index of the final handshake ack sent in reply to `complete`.
pub const FINAL_ACK_INDEX: i64 = -1;

/// Codes carried in `error` messages.
pub mod error_code {
    pub const IO_ERROR: &str = "IO_ERROR";
    pub const TOO_MANY_RETRIES: &str = "TOO_MANY_RETRIES";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Offer,
    Accept,
    Reject,
    Chunk,
    Ack,
    Complete,
    Error,
}

/// Sender proposes a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    /// Hex SHA-256 of the whole file.
    pub hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// Claimed knowledge of the receiver's secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Absolute expiry (ms since epoch) of the secret claim.
    #[serde(rename = "secretTTL", default, skip_serializing_if = "Option::is_none")]
    pub secret_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptPayload {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub index: u32,
    /// Raw chunk bytes; Base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Chunk index, or `FINAL_ACK_INDEX` for the reply to `complete`.
    pub index: i64,
    pub received: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn is_final(&self) -> bool {
        self.index == FINAL_ACK_INDEX
    }

    /// The acknowledged chunk index, if this is a per-chunk ack.
    pub fn chunk_index(&self) -> Option<u32> {
        u32::try_from(self.index).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub total_chunks: u32,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

/// Kind-specific body of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Offer(OfferPayload),
    Accept(AcceptPayload),
    Reject(RejectPayload),
    Chunk(ChunkPayload),
    Ack(AckPayload),
    Complete(CompletePayload),
    Error(ErrorPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Offer(_) => MessageType::Offer,
            Payload::Accept(_) => MessageType::Accept,
            Payload::Reject(_) => MessageType::Reject,
            Payload::Chunk(_) => MessageType::Chunk,
            Payload::Ack(_) => MessageType::Ack,
            Payload::Complete(_) => MessageType::Complete,
            Payload::Error(_) => MessageType::Error,
        }
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Payload::Offer(p) => serde_json::to_value(p),
            Payload::Accept(p) => serde_json::to_value(p),
            Payload::Reject(p) => serde_json::to_value(p),
            Payload::Chunk(p) => serde_json::to_value(p),
            Payload::Ack(p) => serde_json::to_value(p),
            Payload::Complete(p) => serde_json::to_value(p),
            Payload::Error(p) => serde_json::to_value(p),
        }
    }

    fn from_value(kind: MessageType, value: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            MessageType::Offer => Payload::Offer(serde_json::from_value(value)?),
            MessageType::Accept => Payload::Accept(serde_json::from_value(value)?),
            MessageType::Reject => Payload::Reject(serde_json::from_value(value)?),
            MessageType::Chunk => Payload::Chunk(serde_json::from_value(value)?),
            MessageType::Ack => Payload::Ack(serde_json::from_value(value)?),
            MessageType::Complete => Payload::Complete(serde_json::from_value(value)?),
            MessageType::Error => Payload::Error(serde_json::from_value(value)?),
        })
    }
}

/// One protocol message. The `type` on the wire is derived from the payload variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: String,
    pub transfer_id: String,
    pub from: String,
    pub to: String,
    /// Creation time, ms since epoch. Informational only.
    pub timestamp: u64,
    pub payload: Payload,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// JSON shape of a message. `version`, `type` and `transferId` are required.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    version: String,
    #[serde(rename = "type")]
    kind: MessageType,
    transfer_id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    payload: Value,
}

/// Build a message stamped with the current time and protocol version.
pub fn build(
    transfer_id: impl Into<String>,
    from: impl Into<String>,
    to: impl Into<String>,
    payload: Payload,
) -> Message {
    Message {
        version: PROTOCOL_VERSION.to_string(),
        transfer_id: transfer_id.into(),
        from: from.into(),
        to: to.into(),
        timestamp: now_millis(),
        payload,
    }
}

/// Serialize to the JSON form.
pub fn serialize(msg: &Message) -> Result<String, EncodeError> {
    let envelope = Envelope {
        version: msg.version.clone(),
        kind: msg.message_type(),
        transfer_id: msg.transfer_id.clone(),
        from: msg.from.clone(),
        to: msg.to.clone(),
        timestamp: msg.timestamp,
        payload: msg.payload.to_value()?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse the JSON form. Fails closed: anything malformed is `None`.
pub fn deserialize(json: &str) -> Option<Message> {
    try_deserialize(json).ok()
}

/// Parse the JSON form, reporting why it is not a message.
pub fn try_deserialize(json: &str) -> Result<Message, DecodeError> {
    let envelope: Envelope = serde_json::from_str(json)?;
    if envelope.version.is_empty() || envelope.transfer_id.is_empty() {
        return Err(DecodeError::MissingField);
    }
    let payload = Payload::from_value(envelope.kind, envelope.payload)?;
    Ok(Message {
        version: envelope.version,
        transfer_id: envelope.transfer_id,
        from: envelope.from,
        to: envelope.to,
        timestamp: envelope.timestamp,
        payload,
    })
}

/// Cheap check: does this text carry the protocol prefix?
pub fn is_protocol_text(text: &str) -> bool {
    text.trim_start().starts_with(TRANSPORT_PREFIX)
}

/// Encode for a text channel: prefix followed by Base64 of the JSON form.
pub fn encode_for_transport(msg: &Message) -> Result<String, EncodeError> {
    let json = serialize(msg)?;
    Ok(format!("{TRANSPORT_PREFIX}{}", STANDARD.encode(json)))
}

/// Decode text from a channel. Never fails loudly: foreign or damaged text is `None`.
pub fn decode_from_transport(text: &str) -> Option<Message> {
    match try_decode_from_transport(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(error = %e, "text is not an OCFT message");
            None
        }
    }
}

pub fn try_decode_from_transport(text: &str) -> Result<Message, DecodeError> {
    let body = text
        .trim()
        .strip_prefix(TRANSPORT_PREFIX)
        .ok_or(DecodeError::MissingPrefix)?;
    let raw = STANDARD.decode(body.trim())?;
    let json = String::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    try_deserialize(&json)
}

/// Serde helper: `Vec<u8>` as a standard Base64 string.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Error serializing a message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a text is not a valid protocol message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("missing OCFT prefix")]
    MissingPrefix,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("body is not UTF-8")]
    NotUtf8,
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("required field is empty")]
    MissingField,
}
