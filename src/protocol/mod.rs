//! JSON frame codec for the dashboard update endpoint.
//!
//! Inbound frames are narrowed into [`ServerFrame`] before dispatch. Data
//! frames keep their `data` field as an opaque JSON value; interpreting it
//! is the subscriber's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::queue::{Priority, QueuedMessage};

/// Channel used by the server for connection lifecycle frames
pub const SYSTEM_CHANNEL: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Subscription options forwarded to the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireSubscriptionOptions {
    pub priority: Priority,
    pub buffer_messages: bool,
    pub max_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRequest {
    pub action: SubscriptionAction,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<WireSubscriptionOptions>,
}

/// Control frames sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        channel: String,
        data: SubscriptionRequest,
    },
    Unsubscribe {
        channel: String,
        data: SubscriptionRequest,
    },
    Ping,
    Pong,
}

impl ClientFrame {
    pub fn subscribe(channel: impl Into<String>, options: Option<WireSubscriptionOptions>) -> Self {
        let channel = channel.into();
        Self::Subscribe {
            data: SubscriptionRequest {
                action: SubscriptionAction::Subscribe,
                channel: channel.clone(),
                options,
            },
            channel,
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        let channel = channel.into();
        Self::Unsubscribe {
            data: SubscriptionRequest {
                action: SubscriptionAction::Unsubscribe,
                channel: channel.clone(),
                options: None,
            },
            channel,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Wire shape of an outbound data message
#[derive(Serialize)]
struct DataFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    channel: &'a str,
    data: &'a Value,
    timestamp: String,
}

/// Encode a queued send as `{type, channel, data, timestamp}`.
pub fn encode_message(message: &QueuedMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(&DataFrame {
        kind: &message.kind,
        channel: &message.channel,
        data: &message.payload,
        timestamp: message.enqueued_at.to_rfc3339(),
    })
}

/// A data frame routed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    /// Frame `type`, e.g. `session_update`
    pub kind: String,
    pub channel: String,
    pub data: Value,
    pub timestamp: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Frames received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    ConnectionEstablished {
        connection_id: String,
        user_id: Option<String>,
        timestamp: Option<String>,
    },
    SubscriptionResponse {
        channel: String,
        success: bool,
        action: SubscriptionAction,
        message: Option<String>,
    },
    Ping,
    Pong,
    Error {
        channel: Option<String>,
        code: String,
        message: String,
        details: Option<Value>,
    },
    Data(ChannelMessage),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} frame is missing field {field}")]
    MissingField { kind: String, field: &'static str },

    #[error("{kind} frame has no channel")]
    MissingChannel { kind: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    action: Option<SubscriptionAction>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct EstablishedData {
    connection_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Deserialize)]
struct ErrorData {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<Value>,
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl ServerFrame {
    /// Parse and narrow a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let kind = envelope.kind;

        match kind.as_str() {
            "ping" => Ok(ServerFrame::Ping),
            "pong" => Ok(ServerFrame::Pong),
            "connection_established" => {
                let data = envelope.data.ok_or(ProtocolError::MissingField {
                    kind: kind.clone(),
                    field: "data",
                })?;
                let data: EstablishedData = serde_json::from_value(data)?;
                Ok(ServerFrame::ConnectionEstablished {
                    connection_id: data.connection_id,
                    user_id: data.user_id,
                    timestamp: data.timestamp.map(value_to_string),
                })
            }
            "subscription_response" => {
                let nested = envelope.data.as_ref();
                let channel = envelope
                    .channel
                    .or_else(|| {
                        nested
                            .and_then(|d| d.get("channel"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .ok_or_else(|| ProtocolError::MissingChannel { kind: kind.clone() })?;
                let success = envelope
                    .success
                    .or_else(|| nested.and_then(|d| d.get("success")).and_then(Value::as_bool))
                    .ok_or_else(|| ProtocolError::MissingField {
                        kind: kind.clone(),
                        field: "success",
                    })?;
                let action = match envelope.action {
                    Some(action) => action,
                    None => nested
                        .and_then(|d| d.get("action"))
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()?
                        .unwrap_or(SubscriptionAction::Subscribe),
                };
                Ok(ServerFrame::SubscriptionResponse {
                    channel,
                    success,
                    action,
                    message: envelope.message,
                })
            }
            "error" => {
                let data: ErrorData = match envelope.data {
                    Some(data) => serde_json::from_value(data)?,
                    None => ErrorData {
                        code: None,
                        message: envelope.message.clone(),
                        details: None,
                    },
                };
                Ok(ServerFrame::Error {
                    channel: envelope.channel,
                    code: data
                        .code
                        .map(value_to_string)
                        .unwrap_or_else(|| "UNKNOWN".to_string()),
                    message: data
                        .message
                        .or(envelope.message)
                        .unwrap_or_else(|| "unspecified error".to_string()),
                    details: data.details,
                })
            }
            _ => {
                let channel = envelope
                    .channel
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| ProtocolError::MissingChannel { kind: kind.clone() })?;
                Ok(ServerFrame::Data(ChannelMessage {
                    kind,
                    channel,
                    data: envelope.data.unwrap_or(Value::Null),
                    timestamp: envelope.timestamp.map(value_to_string),
                    received_at: Utc::now(),
                }))
            }
        }
    }

    /// Frame `type` tag, for logging
    pub fn kind(&self) -> &str {
        match self {
            ServerFrame::ConnectionEstablished { .. } => "connection_established",
            ServerFrame::SubscriptionResponse { .. } => "subscription_response",
            ServerFrame::Ping => "ping",
            ServerFrame::Pong => "pong",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Data(message) => &message.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = ClientFrame::subscribe(
            "dashboard_updates",
            Some(WireSubscriptionOptions {
                priority: Priority::High,
                buffer_messages: true,
                max_buffer: 50,
            }),
        );
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "subscribe",
                "channel": "dashboard_updates",
                "data": {
                    "action": "subscribe",
                    "channel": "dashboard_updates",
                    "options": {"priority": "high", "buffer_messages": true, "max_buffer": 50}
                }
            })
        );
    }

    #[test]
    fn test_unsubscribe_and_pong_shape() {
        let value: Value =
            serde_json::from_str(&ClientFrame::unsubscribe("alerts").encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "unsubscribe",
                "channel": "alerts",
                "data": {"action": "unsubscribe", "channel": "alerts"}
            })
        );

        assert_eq!(ClientFrame::Pong.encode().unwrap(), r#"{"type":"pong"}"#);
        assert_eq!(ClientFrame::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_parse_connection_established() {
        let frame = ServerFrame::parse(
            r#"{"type":"connection_established","channel":"system",
                "data":{"connection_id":"c-1","user_id":"u-9","timestamp":"2026-01-01T00:00:00Z"}}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            ServerFrame::ConnectionEstablished {
                connection_id: "c-1".to_string(),
                user_id: Some("u-9".to_string()),
                timestamp: Some("2026-01-01T00:00:00Z".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_data_frame_keeps_payload_opaque() {
        let frame = ServerFrame::parse(
            r#"{"type":"session_update","channel":"sessions","data":{"id":7,"nested":[1,2]},"timestamp":"t"}"#,
        )
        .unwrap();

        match frame {
            ServerFrame::Data(message) => {
                assert_eq!(message.kind, "session_update");
                assert_eq!(message.channel, "sessions");
                assert_eq!(message.data, json!({"id": 7, "nested": [1, 2]}));
                assert_eq!(message.timestamp.as_deref(), Some("t"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscription_response() {
        let frame = ServerFrame::parse(
            r#"{"type":"subscription_response","channel":"alerts","success":false,"action":"subscribe","message":"unknown channel"}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            ServerFrame::SubscriptionResponse {
                channel: "alerts".to_string(),
                success: false,
                action: SubscriptionAction::Subscribe,
                message: Some("unknown channel".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_subscription_response_nested_fields() {
        let frame = ServerFrame::parse(
            r#"{"type":"subscription_response","data":{"channel":"alerts","success":true,"action":"unsubscribe"}}"#,
        )
        .unwrap();

        assert!(matches!(
            frame,
            ServerFrame::SubscriptionResponse {
                success: true,
                action: SubscriptionAction::Unsubscribe,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_error_frame() {
        let frame = ServerFrame::parse(
            r#"{"type":"error","channel":"alerts","data":{"code":403,"message":"forbidden"}}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            ServerFrame::Error {
                channel: Some("alerts".to_string()),
                code: "403".to_string(),
                message: "forbidden".to_string(),
                details: None,
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_frames() {
        assert!(matches!(
            ServerFrame::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"channel":"x"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"type":"dashboard_update","data":{}}"#),
            Err(ProtocolError::MissingChannel { .. })
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"type":"connection_established"}"#),
            Err(ProtocolError::MissingField { field: "data", .. })
        ));
    }

    #[test]
    fn test_encode_message() {
        let message = QueuedMessage::new("alerts", "alert_ack", json!({"id": 3}), Priority::High);
        let value: Value = serde_json::from_str(&encode_message(&message).unwrap()).unwrap();

        assert_eq!(value["type"], "alert_ack");
        assert_eq!(value["channel"], "alerts");
        assert_eq!(value["data"], json!({"id": 3}));
        assert!(value["timestamp"].is_string());
    }
}
