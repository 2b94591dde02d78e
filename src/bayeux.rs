//! Bayeux Message Vocabulary
//!
//! Wire-compatible with CometD/Bayeux 1.0 clients.
//!
//! ## Meta Channels
//! - `/meta/handshake`: Negotiate protocol version and connection type
//! - `/meta/connect`: Keep the session alive
//! - `/meta/disconnect`: End the session
//! - `/meta/subscribe`: Join a topic channel
//! - `/meta/unsubscribe`: Leave a topic channel
//!
//! Every other path is an application topic. Publishing to a topic is
//! acknowledged to the publisher and delivered to the other subscribers as an
//! event message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::protocol::ProtocolError;

/// Protocol version spoken by this server
pub const BAYEUX_VERSION: &str = "1.0";
/// Oldest protocol version accepted
pub const MINIMUM_VERSION: &str = "1.0";

/// Prefix shared by all meta channels
pub const META_PREFIX: &str = "/meta/";

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_DISCONNECT: &str = "/meta/disconnect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";

pub const CONNECTION_WEBSOCKET: &str = "websocket";
pub const CONNECTION_LONG_POLLING: &str = "long-polling";

/// Connection types advertised in handshake responses
pub const SUPPORTED_CONNECTION_TYPES: &[&str] = &[CONNECTION_WEBSOCKET, CONNECTION_LONG_POLLING];

/// Error string sent to long-polling requests naming an unknown client
pub const ERROR_UNKNOWN_CLIENT: &str = "402::Unknown client";

/// Error string sent to poll requests naming a session on another transport
pub const ERROR_CONNECTION_MISMATCH: &str = "400::connection type mismatch";

/// Statically routed meta channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaChannel {
    Handshake,
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
}

impl MetaChannel {
    pub const ALL: [MetaChannel; 5] = [
        MetaChannel::Handshake,
        MetaChannel::Connect,
        MetaChannel::Disconnect,
        MetaChannel::Subscribe,
        MetaChannel::Unsubscribe,
    ];

    pub fn path(self) -> &'static str {
        match self {
            MetaChannel::Handshake => META_HANDSHAKE,
            MetaChannel::Connect => META_CONNECT,
            MetaChannel::Disconnect => META_DISCONNECT,
            MetaChannel::Subscribe => META_SUBSCRIBE,
            MetaChannel::Unsubscribe => META_UNSUBSCRIBE,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|meta| meta.path() == path)
    }
}

/// Check whether a channel path is reserved for protocol control
pub fn is_meta(path: &str) -> bool {
    path.starts_with(META_PREFIX)
}

/// How the client should reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    Handshake,
    None,
}

/// Reconnection guidance attached to handshake and connect responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    pub reconnect: Reconnect,
    /// Milliseconds to wait before the next connect
    pub interval: u64,
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub channel: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub minimum_version: Option<String>,
    #[serde(default)]
    pub supported_connection_types: Vec<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub channel: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub connection_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub channel: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Subscribe and unsubscribe share one shape
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub channel: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub subscription: String,
    #[serde(default)]
    pub id: Option<String>,
}

pub type UnsubscribeRequest = SubscribeRequest;

/// Decode a typed request from the payload bytes of one envelope
pub fn parse_request<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(ProtocolError::Parse)
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub channel: String,
    pub version: String,
    pub minimum_version: String,
    pub supported_connection_types: Vec<String>,
    pub client_id: String,
    pub successful: bool,
    pub auth_successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub channel: String,
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub client_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub channel: String,
    pub client_id: String,
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Reply to subscribe and unsubscribe
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub channel: String,
    pub client_id: String,
    pub subscription: String,
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Acknowledgement sent to the publisher of a topic message
#[derive(Debug, Clone, Serialize)]
pub struct PublishResponse {
    pub channel: String,
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub id: String,
}

/// Data delivered to topic subscribers
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub channel: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Remaining publisher fields, forwarded untouched (`ext` and the like)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventMessage {
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
            id: None,
            extra: Map::new(),
        }
    }
}

/// Failure reply for requests the server could not attach to a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub channel: String,
    pub successful: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
}

/// Any message a session can deliver to its peer
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    Handshake(HandshakeResponse),
    Connect(ConnectResponse),
    Disconnect(DisconnectResponse),
    Subscribe(SubscribeResponse),
    Unsubscribe(SubscribeResponse),
    Publish(PublishResponse),
    Event(EventMessage),
    Error(ErrorResponse),
}

impl Message {
    /// Channel the message is addressed on
    pub fn channel(&self) -> &str {
        match self {
            Message::Handshake(m) => &m.channel,
            Message::Connect(m) => &m.channel,
            Message::Disconnect(m) => &m.channel,
            Message::Subscribe(m) | Message::Unsubscribe(m) => &m.channel,
            Message::Publish(m) => &m.channel,
            Message::Event(m) => &m.channel,
            Message::Error(m) => &m.channel,
        }
    }
}

pub fn handshake_response(request: &HandshakeRequest, client_id: &str) -> Message {
    Message::Handshake(HandshakeResponse {
        channel: META_HANDSHAKE.to_string(),
        version: BAYEUX_VERSION.to_string(),
        minimum_version: MINIMUM_VERSION.to_string(),
        supported_connection_types: SUPPORTED_CONNECTION_TYPES
            .iter()
            .map(|t| t.to_string())
            .collect(),
        client_id: client_id.to_string(),
        successful: true,
        auth_successful: true,
        error: None,
        id: request.id.clone(),
        advice: Some(Advice {
            reconnect: Reconnect::Retry,
            interval: 0,
        }),
    })
}

pub fn connect_response(request: &ConnectRequest, client_id: &str, interval: u64) -> Message {
    Message::Connect(ConnectResponse {
        channel: META_CONNECT.to_string(),
        successful: true,
        error: None,
        client_id: client_id.to_string(),
        timestamp: timestamp(),
        id: request.id.clone(),
        advice: Some(Advice {
            reconnect: Reconnect::Handshake,
            interval,
        }),
    })
}

pub fn disconnect_response(request: &DisconnectRequest, client_id: &str) -> Message {
    Message::Disconnect(DisconnectResponse {
        channel: META_DISCONNECT.to_string(),
        client_id: client_id.to_string(),
        successful: true,
        id: request.id.clone(),
    })
}

pub fn subscribe_response(request: &SubscribeRequest, client_id: &str) -> Message {
    Message::Subscribe(subscription_reply(META_SUBSCRIBE, request, client_id, None))
}

/// Subscribe reply for a subscription the server will not create
pub fn subscribe_refused(request: &SubscribeRequest, client_id: &str, error: String) -> Message {
    Message::Subscribe(subscription_reply(
        META_SUBSCRIBE,
        request,
        client_id,
        Some(error),
    ))
}

pub fn unsubscribe_response(request: &UnsubscribeRequest, client_id: &str) -> Message {
    Message::Unsubscribe(subscription_reply(
        META_UNSUBSCRIBE,
        request,
        client_id,
        None,
    ))
}

fn subscription_reply(
    channel: &str,
    request: &SubscribeRequest,
    client_id: &str,
    error: Option<String>,
) -> SubscribeResponse {
    SubscribeResponse {
        channel: channel.to_string(),
        client_id: client_id.to_string(),
        subscription: request.subscription.clone(),
        successful: error.is_none(),
        error,
        timestamp: timestamp(),
        id: request.id.clone(),
    }
}

pub fn publish_ack(channel: &str, id: &str) -> Message {
    Message::Publish(PublishResponse {
        channel: channel.to_string(),
        successful: true,
        error: None,
        id: id.to_string(),
    })
}

/// Greeting published to a channel when a client joins it
pub fn welcome_event(channel: &str, client_id: &str) -> Message {
    Message::Event(EventMessage::new(
        channel,
        serde_json::json!({
            "msg": format!("Welcome to {channel} Client '{client_id}'"),
        }),
    ))
}

/// Build the event broadcast for a published payload
///
/// The payload is forwarded as published, minus the publisher's `clientId`
/// and with `channel` pinned to the topic.
pub fn publish_event(channel: &str, mut payload: Map<String, Value>) -> Message {
    payload.remove("clientId");
    payload.remove("channel");
    let id = match payload.remove("id") {
        Some(Value::String(id)) => Some(id),
        Some(other) => {
            payload.insert("id".to_string(), other);
            None
        }
        None => None,
    };
    Message::Event(EventMessage {
        channel: channel.to_string(),
        data: payload.remove("data").unwrap_or(Value::Null),
        id,
        extra: payload,
    })
}

pub fn unknown_client(channel: &str, id: Option<String>) -> Message {
    Message::Error(ErrorResponse {
        channel: channel.to_string(),
        successful: false,
        error: ERROR_UNKNOWN_CLIENT.to_string(),
        id,
        advice: Some(Advice {
            reconnect: Reconnect::Handshake,
            interval: 0,
        }),
    })
}

/// Reply to a poll request for a client connected some other way
pub fn connection_type_mismatch(channel: &str, id: Option<String>) -> Message {
    Message::Error(ErrorResponse {
        channel: channel.to_string(),
        successful: false,
        error: ERROR_CONNECTION_MISMATCH.to_string(),
        id,
        advice: None,
    })
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

/// Current UTC time in wire format
pub fn timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Format as `YYYY-MM-DDTHH:MM:SS.cc`, `cc` being hundredths of a second
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    // leap seconds report nanos past 1e9
    let hundredths = (time.timestamp_subsec_nanos() / 10_000_000).min(99);
    format!("{}.{:02}", time.format("%Y-%m-%dT%H:%M:%S"), hundredths)
}

/// Generate an opaque client id from a random 63-bit value
///
/// Uniqueness is probabilistic; collisions are not checked.
pub fn generate_client_id() -> String {
    let seed = rand::random::<u64>() >> 1;
    let digest = Sha256::digest(seed.to_string().as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn to_json(message: &Message) -> Value {
        serde_json::to_value(message).unwrap()
    }

    #[test]
    fn test_meta_channel_paths() {
        for meta in MetaChannel::ALL {
            assert_eq!(MetaChannel::from_path(meta.path()), Some(meta));
            assert!(is_meta(meta.path()));
        }
        assert_eq!(MetaChannel::from_path("/chat/room1"), None);
        assert!(!is_meta("/chat/room1"));
    }

    #[test]
    fn test_parse_handshake() {
        let json = br#"{"channel":"/meta/handshake","version":"1.0","supportedConnectionTypes":["websocket"],"id":"1"}"#;
        let request: HandshakeRequest = parse_request(json).unwrap();
        assert_eq!(request.channel, META_HANDSHAKE);
        assert_eq!(request.version.as_deref(), Some("1.0"));
        assert_eq!(request.supported_connection_types, vec!["websocket"]);
        assert_eq!(request.id.as_deref(), Some("1"));
    }

    #[test]
    fn test_parse_subscribe_requires_subscription() {
        let json = br#"{"channel":"/meta/subscribe","clientId":"abc"}"#;
        let result: Result<SubscribeRequest, _> = parse_request(json);
        assert!(matches!(result, Err(ProtocolError::Parse(_))));
    }

    #[test]
    fn test_encode_handshake_response() {
        let request = HandshakeRequest {
            id: Some("7".to_string()),
            ..Default::default()
        };
        let json = to_json(&handshake_response(&request, "abc123"));
        assert_eq!(json["channel"], META_HANDSHAKE);
        assert_eq!(json["clientId"], "abc123");
        assert_eq!(json["successful"], true);
        assert_eq!(json["authSuccessful"], true);
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["minimumVersion"], "1.0");
        assert_eq!(json["id"], "7");
        assert_eq!(json["advice"]["reconnect"], "retry");
        assert_eq!(json["advice"]["interval"], 0);
        assert_eq!(json["supportedConnectionTypes"][0], "websocket");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_encode_connect_response() {
        let request = ConnectRequest {
            channel: META_CONNECT.to_string(),
            client_id: Some("abc123".to_string()),
            ..Default::default()
        };
        let json = to_json(&connect_response(&request, "abc123", 60_000));
        assert_eq!(json["successful"], true);
        assert_eq!(json["advice"]["reconnect"], "handshake");
        assert_eq!(json["advice"]["interval"], 60_000);
        assert!(json["timestamp"].as_str().is_some());
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_encode_subscribe_refused() {
        let request = SubscribeRequest {
            channel: META_SUBSCRIBE.to_string(),
            subscription: "/meta/connect".to_string(),
            ..Default::default()
        };
        let json = to_json(&subscribe_refused(&request, "abc", "403:/meta/connect:meta channel".into()));
        assert_eq!(json["successful"], false);
        assert_eq!(json["subscription"], "/meta/connect");
        assert_eq!(json["error"], "403:/meta/connect:meta channel");
    }

    #[test]
    fn test_publish_ack_echoes_empty_id() {
        let json = to_json(&publish_ack("/chat/room1", ""));
        assert_eq!(json["channel"], "/chat/room1");
        assert_eq!(json["successful"], true);
        assert_eq!(json["id"], "");
    }

    #[test]
    fn test_publish_event_keeps_data() {
        let payload: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "channel": "/chat/room1",
            "clientId": "abc",
            "id": "9",
            "data": {"msg": "hi"}
        }))
        .unwrap();
        let json = to_json(&publish_event("/chat/room1", payload));
        assert_eq!(json["channel"], "/chat/room1");
        assert_eq!(json["data"]["msg"], "hi");
        assert_eq!(json["id"], "9");
        assert!(json.get("clientId").is_none());
    }

    #[test]
    fn test_publish_event_forwards_extra_fields() {
        let payload: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "channel": "/elsewhere",
            "clientId": "abc",
            "data": {"msg": "hi"},
            "ext": {"trace": "t1"},
            "id": 5
        }))
        .unwrap();
        let json = to_json(&publish_event("/chat", payload));

        assert_eq!(json["channel"], "/chat");
        assert_eq!(json["ext"]["trace"], "t1");
        assert_eq!(json["id"], 5);
        assert!(json.get("clientId").is_none());
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_welcome_event() {
        let message = welcome_event("/chat/room1", "abc");
        assert_eq!(message.channel(), "/chat/room1");
        let json = to_json(&message);
        assert_eq!(json["data"]["msg"], "Welcome to /chat/room1 Client 'abc'");
    }

    #[test]
    fn test_format_timestamp_hundredths() {
        let time = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
            + chrono::Duration::nanoseconds(56_700_000);
        assert_eq!(format_timestamp(time), "2024-03-05T07:08:09.05");

        let time = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
            + chrono::Duration::nanoseconds(999_999_999);
        assert_eq!(format_timestamp(time), "2024-03-05T07:08:09.99");
    }

    #[test]
    fn test_generate_client_id() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }
}
