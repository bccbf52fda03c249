// Push-channel event types.
//
// Every frame is a UTF-8 JSON text message `{"event": <name>, "data": <payload>}`.
// Decoding happens once at the boundary; everything past it matches on the
// typed enums below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{MessageId, PresenceUser, UserId};

pub const EVENT_PRESENCE_UPDATE: &str = "presence:update";
pub const EVENT_CHAT_TYPING: &str = "chat:typing";
pub const EVENT_CHAT_READ: &str = "chat:read";
pub const EVENT_HEALTH_PING: &str = "health:ping";
pub const EVENT_HEALTH_PONG: &str = "health:pong";

/// Suffix of generic change notifications (`orders:update`, `tasks:update`, ...).
pub const DOMAIN_UPDATE_SUFFIX: &str = ":update";

/// Events the server may push that are not domain updates.
pub const INBOUND_EVENTS: &[&str] =
    &[EVENT_PRESENCE_UPDATE, EVENT_CHAT_TYPING, EVENT_CHAT_READ, EVENT_HEALTH_PONG];

/// Events the client may send.
pub const OUTBOUND_EVENTS: &[&str] = &[EVENT_HEALTH_PING, EVENT_CHAT_TYPING, EVENT_CHAT_READ];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not a valid event envelope: {0}")]
    Malformed(String),

    #[error("unknown event `{0}`")]
    UnknownEvent(String),

    #[error("invalid payload for `{event}`: {message}")]
    InvalidPayload { event: String, message: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// `chat:typing` as delivered to the other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub sender: String,
    pub sender_id: UserId,
}

/// `chat:read` as delivered to the other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadNotice {
    pub sender: String,
    pub sender_id: UserId,
    pub message_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct PresenceBody {
    #[serde(default)]
    users: Vec<PresenceUser>,
}

#[derive(Debug, Deserialize)]
struct DomainBody {
    event: String,
    #[serde(default)]
    payload: Value,
}

/// Server -> client events.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Full replacement of the pushed presence layer.
    PresenceUpdate { users: Vec<PresenceUser> },
    /// Generic change notification for a record collection. `payload` is opaque.
    DomainUpdate { domain: String, event: String, payload: Value },
    Typing(TypingNotice),
    Read(ReadNotice),
    /// Heartbeat acknowledgement.
    Pong,
}

impl InboundEvent {
    /// Decode a text frame, rejecting unknown event names.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let Envelope { event, data } =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match event.as_str() {
            EVENT_PRESENCE_UPDATE => {
                let body: PresenceBody = payload(&event, data)?;
                Ok(Self::PresenceUpdate { users: body.users })
            }
            EVENT_CHAT_TYPING => Ok(Self::Typing(payload(&event, data)?)),
            EVENT_CHAT_READ => Ok(Self::Read(payload(&event, data)?)),
            EVENT_HEALTH_PONG => Ok(Self::Pong),
            name => match domain_of(name) {
                Some(domain) => {
                    let body: DomainBody = payload(&event, data)?;
                    Ok(Self::DomainUpdate {
                        domain: domain.to_string(),
                        event: body.event,
                        payload: body.payload,
                    })
                }
                None => Err(ProtocolError::UnknownEvent(name.to_string())),
            },
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::PresenceUpdate { .. } => EVENT_PRESENCE_UPDATE.to_string(),
            Self::DomainUpdate { domain, .. } => format!("{domain}{DOMAIN_UPDATE_SUFFIX}"),
            Self::Typing(_) => EVENT_CHAT_TYPING.to_string(),
            Self::Read(_) => EVENT_CHAT_READ.to_string(),
            Self::Pong => EVENT_HEALTH_PONG.to_string(),
        }
    }

    /// Encode as a text frame (server side and test harnesses).
    pub fn encode(&self) -> String {
        let data = match self {
            Self::PresenceUpdate { users } => json!({ "users": users }),
            Self::DomainUpdate { event, payload, .. } => {
                json!({ "event": event, "payload": payload })
            }
            Self::Typing(notice) => json!(notice),
            Self::Read(notice) => json!(notice),
            Self::Pong => Value::Null,
        };
        json!({ "event": self.name(), "data": data }).to_string()
    }
}

/// Client -> server events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// Heartbeat ping; `timestamp` is milliseconds since the Unix epoch.
    Ping { timestamp: i64 },
    /// The local user is typing, optionally in a direct conversation.
    Typing { recipient_id: Option<UserId> },
    /// The local user has read a message.
    Read { message_id: MessageId },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping { .. } => EVENT_HEALTH_PING,
            Self::Typing { .. } => EVENT_CHAT_TYPING,
            Self::Read { .. } => EVENT_CHAT_READ,
        }
    }

    pub fn encode(&self) -> String {
        let data = match self {
            Self::Ping { timestamp } => json!({ "timestamp": timestamp }),
            Self::Typing { recipient_id: Some(recipient_id) } => {
                json!({ "recipient_id": recipient_id })
            }
            Self::Typing { recipient_id: None } => json!({}),
            Self::Read { message_id } => json!({ "message_id": message_id }),
        };
        json!({ "event": self.name(), "data": data }).to_string()
    }

    /// Decode a client frame (server side and test harnesses).
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        #[derive(Deserialize)]
        struct PingBody {
            timestamp: i64,
        }
        #[derive(Deserialize)]
        struct TypingBody {
            #[serde(default)]
            recipient_id: Option<UserId>,
        }
        #[derive(Deserialize)]
        struct ReadBody {
            message_id: MessageId,
        }

        let Envelope { event, data } =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match event.as_str() {
            EVENT_HEALTH_PING => {
                let body: PingBody = payload(&event, data)?;
                Ok(Self::Ping { timestamp: body.timestamp })
            }
            EVENT_CHAT_TYPING => {
                let body: TypingBody = payload(&event, data)?;
                Ok(Self::Typing { recipient_id: body.recipient_id })
            }
            EVENT_CHAT_READ => {
                let body: ReadBody = payload(&event, data)?;
                Ok(Self::Read { message_id: body.message_id })
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// `orders:update` -> `orders`. Names with extra `:` segments are not domain updates.
pub fn domain_of(event: &str) -> Option<&str> {
    event
        .strip_suffix(DOMAIN_UPDATE_SUFFIX)
        .filter(|domain| !domain.is_empty() && !domain.contains(':'))
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event: event.to_string(),
        message: e.to_string(),
    })
}
