//! Envelope and content wire schema.
//!
//! The envelope wrapping an encrypted message is a protobuf message (the
//! format shared with the other client implementations). For storage on a
//! snode it is additionally wrapped in a websocket-style JSON request:
//!
//! ```json
//! { "type": "REQUEST",
//!   "request": { "id": 0, "verb": "PUT", "path": "/api/v1/message",
//!                "body": "<base64 envelope bytes>" } }
//! ```
//!
//! and the base64 of that JSON becomes the `data` parameter of the store
//! RPC. The receive path reverses both layers, tolerating payloads that
//! skip the JSON wrapper.

use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec;

/// Envelope type discriminants as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EnvelopeType {
    SessionMessage = 6,
    ClosedGroupMessage = 7,
}

impl TryFrom<i32> for EnvelopeType {
    type Error = EnvelopeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(EnvelopeType::SessionMessage),
            7 => Ok(EnvelopeType::ClosedGroupMessage),
            other => Err(EnvelopeError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unknown envelope type {0}")]
    UnknownType(i32),
    #[error("envelope decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("empty envelope content")]
    EmptyContent,
}

// ─── Protobuf messages ───────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(string, optional, tag = "2")]
    pub source: Option<String>,
    #[prost(uint64, tag = "5")]
    pub timestamp: u64,
    #[prost(bytes = "vec", tag = "8")]
    pub content: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Content {
    #[prost(message, optional, tag = "1")]
    pub data_message: Option<DataMessage>,
    #[prost(message, optional, tag = "5")]
    pub receipt_message: Option<ReceiptMessage>,
    #[prost(message, optional, tag = "6")]
    pub typing_message: Option<TypingMessage>,
    #[prost(message, optional, tag = "9")]
    pub unsend_request: Option<UnsendRequest>,
    #[prost(message, optional, tag = "11")]
    pub shared_config_message: Option<SharedConfigMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DataMessage {
    #[prost(string, optional, tag = "1")]
    pub body: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub attachments: Vec<AttachmentPointer>,
    #[prost(uint64, optional, tag = "7")]
    pub timestamp: Option<u64>,
    #[prost(message, optional, tag = "8")]
    pub quote: Option<Quote>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Quote {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub author: String,
    #[prost(string, optional, tag = "3")]
    pub text: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttachmentPointer {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, optional, tag = "2")]
    pub content_type: Option<String>,
    #[prost(bytes = "vec", tag = "3")]
    pub key: Vec<u8>,
    #[prost(uint32, optional, tag = "4")]
    pub size: Option<u32>,
    #[prost(bytes = "vec", tag = "6")]
    pub digest: Vec<u8>,
    #[prost(string, optional, tag = "7")]
    pub file_name: Option<String>,
    #[prost(uint32, optional, tag = "9")]
    pub width: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub height: Option<u32>,
    #[prost(string, optional, tag = "11")]
    pub caption: Option<String>,
    #[prost(string, tag = "101")]
    pub url: String,
}

impl AttachmentPointer {
    /// SHA-256 digest as lowercase hex.
    pub fn digest_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ReceiptMessage {
    #[prost(uint32, tag = "1")]
    pub r#type: u32,
    #[prost(uint64, repeated, tag = "2")]
    pub timestamp: Vec<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypingMessage {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(uint32, tag = "2")]
    pub action: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct UnsendRequest {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(string, tag = "2")]
    pub author: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SharedConfigMessage {
    #[prost(int32, tag = "1")]
    pub kind: i32,
    #[prost(int64, tag = "2")]
    pub seqno: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

// ─── Construction / serialization ────────────────────────────────────────────

/// Build an envelope around already-encrypted content.
///
/// `source` is carried only for closed-group envelopes, matching the peer
/// clients: one-to-one envelopes reveal their sender through the signed
/// ciphertext instead.
pub fn build_envelope(
    envelope_type: EnvelopeType,
    source: Option<&str>,
    timestamp: u64,
    content: Vec<u8>,
) -> Envelope {
    let source = match envelope_type {
        EnvelopeType::ClosedGroupMessage => source.map(str::to_owned),
        EnvelopeType::SessionMessage => None,
    };
    Envelope { r#type: envelope_type as i32, source, timestamp, content }
}

pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_to_vec()
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let envelope = Envelope::decode(bytes)?;
    if envelope.content.is_empty() {
        return Err(EnvelopeError::EmptyContent);
    }
    Ok(envelope)
}

// ─── Websocket wrapper ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct WebSocketRequest {
    id: u64,
    verb: String,
    path: String,
    body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebSocketMessage {
    #[serde(rename = "type")]
    kind: String,
    request: Option<WebSocketRequest>,
}

/// Wrap an envelope into the websocket request JSON.
pub fn wrap_envelope(envelope: &Envelope) -> Vec<u8> {
    let message = WebSocketMessage {
        kind: "REQUEST".into(),
        request: Some(WebSocketRequest {
            id: 0,
            verb: "PUT".into(),
            path: "/api/v1/message".into(),
            body: codec::bytes_to_base64(&encode_envelope(envelope)),
        }),
    };
    serde_json::to_vec(&message).unwrap_or_default()
}

/// Recover the envelope from a stored payload.
///
/// Accepts both the full websocket wrapper and bare protobuf envelope
/// bytes; both encodings circulate among deployed peers.
pub fn extract_envelope(data: &[u8]) -> Result<Envelope, EnvelopeError> {
    if let Ok(ws) = serde_json::from_slice::<WebSocketMessage>(data) {
        if ws.kind == "REQUEST" {
            if let Some(request) = ws.request {
                if let Ok(bytes) = codec::base64_to_bytes(&request.body) {
                    return decode_envelope(&bytes);
                }
            }
        }
    }
    decode_envelope(data)
}
