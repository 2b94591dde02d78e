//! Transport frame codec
//!
//! A frame is always a JSON array of envelopes, never a bare object. Inbound
//! envelopes are split into their channel path and the re-serialized body,
//! which the dispatcher decodes into a typed request later.

use serde_json::{Map, Value};

use crate::bayeux::Message;

/// One inbound envelope, ready for routing
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: String,
    pub client_id: Option<String>,
    pub id: Option<String>,
    /// Envelope body as JSON bytes
    pub payload: Vec<u8>,
}

/// Envelope tagged with the session it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub channel: String,
    pub client_id: String,
    pub payload: Vec<u8>,
}

/// Decode a frame into its envelopes
pub fn decode_batch(data: &[u8]) -> Result<Vec<Envelope>, ProtocolError> {
    let value: Value = serde_json::from_slice(data)?;
    let Value::Array(items) = value else {
        return Err(ProtocolError::NotABatch);
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(fields) => envelope_from(fields),
            _ => Err(ProtocolError::NotAnEnvelope),
        })
        .collect()
}

fn envelope_from(fields: Map<String, Value>) -> Result<Envelope, ProtocolError> {
    let channel = fields
        .get("channel")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingChannel)?
        .to_string();
    let client_id = fields
        .get("clientId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = fields.get("id").and_then(Value::as_str).map(str::to_string);
    let payload = serde_json::to_vec(&fields)?;

    Ok(Envelope {
        channel,
        client_id,
        id,
        payload,
    })
}

/// Encode outbound messages as one frame
pub fn encode_batch(messages: &[Message]) -> Result<String, ProtocolError> {
    serde_json::to_string(messages).map_err(ProtocolError::Encode)
}

/// Frame codec errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to parse frame: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),
    #[error("frame is not a JSON array")]
    NotABatch,
    #[error("envelope is not a JSON object")]
    NotAnEnvelope,
    #[error("envelope has no channel")]
    MissingChannel,
}
