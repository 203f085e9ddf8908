//! Client/server envelope codec
//!
//! Inbound frames are one JSON object `{ "type": ..., "data": { ... } }`.
//! Parsing goes through a loose raw envelope first so that an unknown type or
//! a malformed `data` block becomes a [`ProtocolError`] for that single frame
//! instead of tearing down the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use realtime_config::close_codes;

/// Messages a browser client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Auth { token: String },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    SubscribeBatch { channels: Vec<String> },
    UnsubscribeBatch { channels: Vec<String> },
    Ping,
    Pong,
}

/// A frame that could not be decoded into a [`ClientMessage`]
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("message '{kind}' has invalid data: {reason}")]
    InvalidData { kind: &'static str, reason: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct TokenData {
    token: String,
}

#[derive(Deserialize)]
struct ChannelData {
    channel: String,
}

#[derive(Deserialize)]
struct ChannelsData {
    channels: Vec<String>,
}

fn decode_data<T: for<'de> Deserialize<'de>>(
    kind: &'static str,
    data: Option<Value>,
) -> Result<T, ProtocolError> {
    let data = data.ok_or_else(|| ProtocolError::InvalidData {
        kind,
        reason: "missing data".to_string(),
    })?;
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidData {
        kind,
        reason: e.to_string(),
    })
}

impl ClientMessage {
    /// Decode one inbound text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;

        let message = match raw.kind.as_str() {
            "auth" => {
                let data: TokenData = decode_data("auth", raw.data)?;
                ClientMessage::Auth { token: data.token }
            }
            "subscribe" => {
                let data: ChannelData = decode_data("subscribe", raw.data)?;
                ClientMessage::Subscribe {
                    channel: data.channel,
                }
            }
            "unsubscribe" => {
                let data: ChannelData = decode_data("unsubscribe", raw.data)?;
                ClientMessage::Unsubscribe {
                    channel: data.channel,
                }
            }
            "subscribe_batch" => {
                let data: ChannelsData = decode_data("subscribe_batch", raw.data)?;
                ClientMessage::SubscribeBatch {
                    channels: data.channels,
                }
            }
            "unsubscribe_batch" => {
                let data: ChannelsData = decode_data("unsubscribe_batch", raw.data)?;
                ClientMessage::UnsubscribeBatch {
                    channels: data.channels,
                }
            }
            "ping" => ClientMessage::Ping,
            "pong" => ClientMessage::Pong,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        Ok(message)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::SubscribeBatch { .. } => "subscribe_batch",
            ClientMessage::UnsubscribeBatch { .. } => "unsubscribe_batch",
            ClientMessage::Ping => "ping",
            ClientMessage::Pong => "pong",
        }
    }
}

/// Stable machine-readable error codes carried by `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimitExceeded,
    SubscriptionLimitExceeded,
    AuthenticationRequired,
    AuthenticationFailed,
    AccessDenied,
    InvalidMessage,
    QueueOverflow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedData {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedData {
    pub success: bool,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAck {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFailure {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchSubscribeResult {
    pub subscribed: Vec<String>,
    pub errors: Vec<ChannelFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchUnsubscribeResult {
    pub unsubscribed: Vec<String>,
}

/// Messages the server sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        data: ConnectedData,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Authenticated {
        data: AuthenticatedData,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Subscribed {
        data: ChannelAck,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Unsubscribed {
        data: ChannelAck,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    SubscribedBatch {
        data: BatchSubscribeResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    UnsubscribedBatch {
        data: BatchUnsubscribeResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Event {
        event: String,
        data: Value,
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Error {
        data: ErrorBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ServerMessage {
    pub fn connected(user_id: Option<String>) -> Self {
        ServerMessage::Connected {
            data: ConnectedData {
                authenticated: user_id.is_some(),
                user_id,
            },
            timestamp: Some(now_millis()),
        }
    }

    pub fn authenticated(user_id: impl Into<String>) -> Self {
        ServerMessage::Authenticated {
            data: AuthenticatedData {
                success: true,
                user_id: user_id.into(),
            },
            timestamp: Some(now_millis()),
        }
    }

    pub fn subscribed(channel: impl Into<String>) -> Self {
        ServerMessage::Subscribed {
            data: ChannelAck {
                channel: channel.into(),
            },
            timestamp: None,
        }
    }

    pub fn unsubscribed(channel: impl Into<String>) -> Self {
        ServerMessage::Unsubscribed {
            data: ChannelAck {
                channel: channel.into(),
            },
            timestamp: None,
        }
    }

    pub fn subscribed_batch(result: BatchSubscribeResult) -> Self {
        ServerMessage::SubscribedBatch {
            data: result,
            timestamp: None,
        }
    }

    pub fn unsubscribed_batch(result: BatchUnsubscribeResult) -> Self {
        ServerMessage::UnsubscribedBatch {
            data: result,
            timestamp: None,
        }
    }

    pub fn event(event: impl Into<String>, data: Value, channel: impl Into<String>) -> Self {
        ServerMessage::Event {
            event: event.into(),
            data,
            channel: channel.into(),
            timestamp: Some(now_millis()),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            data: ErrorBody {
                code,
                message: message.into(),
                hint: None,
            },
            timestamp: Some(now_millis()),
        }
    }

    pub fn error_with_hint(
        code: ErrorCode,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            data: ErrorBody {
                code,
                message: message.into(),
                hint: Some(hint.into()),
            },
            timestamp: Some(now_millis()),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: Some(now_millis()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"auth","data":{"token":"abc"}}"#).unwrap(),
            ClientMessage::Auth {
                token: "abc".to_string()
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"subscribe_batch","data":{"channels":["blocks","wallet:1"]}}"#)
                .unwrap(),
            ClientMessage::SubscribeBatch {
                channels: vec!["blocks".to_string(), "wallet:1".to_string()]
            }
        );
        // ping carries no data, but tolerate an empty object
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping","data":{}}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"launch_missiles"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "launch_missiles"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"subscribe","data":{"chan":"x"}}"#),
            Err(ProtocolError::InvalidData { kind: "subscribe", .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"auth"}"#),
            Err(ProtocolError::InvalidData { kind: "auth", .. })
        ));
    }

    #[test]
    fn test_server_message_shapes() {
        let event = ServerMessage::event("transaction", json!({"txid": "ff"}), "wallet:W");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "transaction");
        assert_eq!(value["channel"], "wallet:W");
        assert_eq!(value["data"]["txid"], "ff");
        assert!(value["timestamp"].is_i64());

        let error = ServerMessage::error_with_hint(
            ErrorCode::RateLimitExceeded,
            "Too many messages",
            "Slow down",
        );
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(value["data"]["hint"], "Slow down");

        let batch = ServerMessage::SubscribedBatch {
            data: BatchSubscribeResult {
                subscribed: vec!["blocks".to_string()],
                errors: vec![ChannelFailure {
                    channel: "wallet:x".to_string(),
                    reason: "Access denied".to_string(),
                }],
            },
            timestamp: None,
        };
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["type"], "subscribed_batch");
        assert_eq!(value["data"]["errors"][0]["reason"], "Access denied");
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn test_connected_reports_auth_state() {
        let value = serde_json::to_value(ServerMessage::connected(Some("u1".into()))).unwrap();
        assert_eq!(value["data"]["authenticated"], true);
        assert_eq!(value["data"]["userId"], "u1");

        let value = serde_json::to_value(ServerMessage::connected(None)).unwrap();
        assert_eq!(value["data"]["authenticated"], false);
        assert!(value["data"].get("userId").is_none());
    }
}
