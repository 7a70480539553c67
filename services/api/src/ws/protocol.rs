//! Defines the WebSocket message protocol between the browser client and the gateway.
//!
//! Inbound frames are parsed in two steps: the raw payload is decoded into a
//! generic JSON value whose `type` discriminator is checked against the closed
//! set of known kinds, then the kind-specific schema is deserialized and
//! validated. Every failure becomes a single [`MessageParsingError`] carrying a
//! short preview of the offending payload.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

pub const MAX_TEXT_CHARS: usize = 5000;
pub const MAX_BROADCAST_CHARS: usize = 1000;
const PREVIEW_CHARS: usize = 100;
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_CHANNELS: u16 = 1;

const KNOWN_KINDS: &[&str] = &[
    "text",
    "audio_chunk",
    "ping",
    "control",
    "broadcast_request",
    "connection_info_request",
];

/// Why an inbound payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("missing field `{0}`")]
    MissingField(String),
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    #[error("invalid message: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{failure}")]
pub struct MessageParsingError {
    pub failure: ParseFailure,
    /// The first characters of the rejected payload.
    pub preview: String,
}

impl MessageParsingError {
    fn new(failure: ParseFailure, raw: &str) -> Self {
        Self {
            failure,
            preview: raw.chars().take(PREVIEW_CHARS).collect(),
        }
    }
}

/// Commands a client can issue to steer its session.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    StartRecording,
    StopRecording,
    EndSession,
}

/// The wire shape of client messages, before validation.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Text {
        #[serde(alias = "text")]
        content: String,
    },
    AudioChunk {
        data: String,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
    },
    Ping {
        #[serde(default)]
        data: Option<Value>,
    },
    Control {
        command: ControlCommand,
    },
    BroadcastRequest {
        message: String,
        #[serde(default = "default_exclude_sender")]
        exclude_sender: bool,
        #[serde(default)]
        targets: Option<Vec<String>>,
    },
    ConnectionInfoRequest {},
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_channels() -> u16 {
    DEFAULT_CHANNELS
}

fn default_exclude_sender() -> bool {
    true
}

/// A validated message from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Text {
        content: String,
    },
    AudioChunk {
        pcm: Bytes,
        sample_rate: u32,
        channels: u16,
    },
    Ping {
        data: Option<Value>,
    },
    Control {
        command: ControlCommand,
    },
    BroadcastRequest {
        message: String,
        exclude_sender: bool,
        targets: Option<Vec<String>>,
    },
    ConnectionInfoRequest,
}

/// A validated client message together with its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: ClientMessage,
}

impl Inbound {
    fn new(body: ClientMessage) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            body,
        }
    }
}

/// Parses and validates one text frame.
pub fn parse(raw: &str) -> Result<Inbound, MessageParsingError> {
    let err = |failure| MessageParsingError::new(failure, raw);

    let value: Value =
        serde_json::from_str(raw).map_err(|e| err(ParseFailure::Malformed(e.to_string())))?;
    let Some(object) = value.as_object() else {
        return Err(err(ParseFailure::Malformed("expected a JSON object".into())));
    };
    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(err(ParseFailure::Invalid("`type` must be a string".into()))),
        None => return Err(err(ParseFailure::MissingField("type".into()))),
    };
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(err(ParseFailure::UnknownKind(kind)));
    }

    let message_id = object
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let correlation_id = object
        .get("correlation_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let wire: WireMessage =
        serde_json::from_value(value).map_err(|e| err(ParseFailure::Invalid(e.to_string())))?;
    let body = validate(wire).map_err(err)?;

    Ok(Inbound {
        message_id,
        correlation_id,
        timestamp,
        body,
    })
}

/// Wraps a binary frame as an audio chunk with the default format.
pub fn parse_binary(data: Bytes) -> Result<Inbound, MessageParsingError> {
    if data.is_empty() {
        return Err(MessageParsingError::new(
            ParseFailure::Invalid("empty audio frame".into()),
            "",
        ));
    }
    Ok(Inbound::new(ClientMessage::AudioChunk {
        pcm: data,
        sample_rate: DEFAULT_SAMPLE_RATE,
        channels: DEFAULT_CHANNELS,
    }))
}

fn validate(wire: WireMessage) -> Result<ClientMessage, ParseFailure> {
    match wire {
        WireMessage::Text { content } => {
            let content = content.trim().to_string();
            check_length("content", &content, MAX_TEXT_CHARS)?;
            Ok(ClientMessage::Text { content })
        }
        WireMessage::AudioChunk {
            data,
            sample_rate,
            channels,
        } => {
            let pcm = BASE64
                .decode(data.as_bytes())
                .map_err(|e| ParseFailure::Invalid(format!("`data` is not valid base64: {e}")))?;
            if pcm.is_empty() {
                return Err(ParseFailure::Invalid("`data` must not be empty".into()));
            }
            if sample_rate == 0 || channels == 0 {
                return Err(ParseFailure::Invalid(
                    "`sample_rate` and `channels` must be positive".into(),
                ));
            }
            Ok(ClientMessage::AudioChunk {
                pcm: Bytes::from(pcm),
                sample_rate,
                channels,
            })
        }
        WireMessage::Ping { data } => Ok(ClientMessage::Ping { data }),
        WireMessage::Control { command } => Ok(ClientMessage::Control { command }),
        WireMessage::BroadcastRequest {
            message,
            exclude_sender,
            targets,
        } => {
            check_length("message", &message, MAX_BROADCAST_CHARS)?;
            Ok(ClientMessage::BroadcastRequest {
                message,
                exclude_sender,
                targets,
            })
        }
        WireMessage::ConnectionInfoRequest {} => Ok(ClientMessage::ConnectionInfoRequest),
    }
}

fn check_length(field: &str, value: &str, max: usize) -> Result<(), ParseFailure> {
    let len = value.chars().count();
    if len == 0 {
        Err(ParseFailure::Invalid(format!("`{field}` must not be empty")))
    } else if len > max {
        Err(ParseFailure::Invalid(format!(
            "`{field}` exceeds {max} characters"
        )))
    } else {
        Ok(())
    }
}

/// Coarse phases reported to the client through `status_update`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Ready,
    Recording,
    Generating,
    TurnTimeout,
}

/// Messages sent from the gateway to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Direct answer to a text message.
    Response {
        content: String,
        correlation_id: Option<String>,
        processing_time_ms: u64,
    },
    AudioReceived {
        size_bytes: usize,
    },
    /// A chunk of generated audio (base64 encoded PCM16).
    AudioChunk {
        data: String,
        sample_rate: u32,
        channels: u16,
    },
    AudioComplete {
        chunks_sent: u64,
        total_size: u64,
    },
    /// A fragment of generated text.
    TextDelta {
        content: String,
    },
    TurnComplete {
        interrupted: bool,
    },
    StatusUpdate {
        status: SessionStatus,
        message: String,
    },
    Broadcast {
        message: String,
        sender_id: String,
    },
    BroadcastConfirmation {
        recipient_count: usize,
        failed_count: usize,
    },
    ConnectionInfo {
        total_connections: usize,
        your_id: String,
        connected_at: DateTime<Utc>,
        message_count: u64,
        last_activity: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Pong {
        data: Option<Value>,
    },
}

impl ServerMessage {
    pub fn audio_chunk(pcm: &[u8], sample_rate: u32) -> Self {
        ServerMessage::AudioChunk {
            data: BASE64.encode(pcm),
            sample_rate,
            channels: DEFAULT_CHANNELS,
        }
    }

    pub fn status(status: SessionStatus, message: impl Into<String>) -> Self {
        ServerMessage::StatusUpdate {
            status,
            message: message.into(),
        }
    }
}

/// Serializes an outbound message, stamping it with a fresh timestamp.
///
/// Never fails: should the message somehow not encode, a generic error frame
/// is produced instead.
pub fn serialize(message: &ServerMessage) -> String {
    let mut value = serde_json::to_value(message).unwrap_or_else(|e| {
        json!({
            "type": "error",
            "code": "SERIALIZATION_ERROR",
            "message": e.to_string(),
        })
    });
    if let Some(object) = value.as_object_mut() {
        object.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    }
    value.to_string()
}
