//! Control-plane wire protocol.
//!
//! Every frame is one JSON document with `type`, `timestamp`, an optional
//! `request_id` and a `data` object whose schema depends on the type.
//! Control operations (`shutdown`, `reload_layout`, `status`,
//! `list_clients`) are answered with a frame of the same type carrying the
//! response data and the request's `request_id`; that keeps the type set
//! closed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use panemux_core::StateEventType;

/// Protocol version panels must speak.
pub const PROTOCOL_VERSION: &str = "1.0";

/// The closed set of panel types accepted at handshake.
pub const PANEL_TYPES: [&str; 4] = ["sessions", "messages", "input", "controller"];

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    HandshakeResponse,
    Subscribe,
    Unsubscribe,
    StateUpdate,
    StateUpdateResponse,
    StateRequest,
    StateResponse,
    StateEvent,
    Ping,
    Pong,
    Heartbeat,
    Error,
    Shutdown,
    ReloadLayout,
    Status,
    ListClients,
}

/// Structured error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    AuthFailed,
    VersionConflict,
    StateNotFound,
    InternalError,
    ConnectionClosed,
    Timeout,
    TooManyRetries,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl IpcMessage {
    pub fn new(msg_type: MessageType, data: serde_json::Value) -> Self {
        Self {
            msg_type,
            timestamp: Utc::now(),
            request_id: None,
            data,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Response frame correlated with `request`.
    pub fn reply_to(request: &IpcMessage, msg_type: MessageType, data: serde_json::Value) -> Self {
        Self {
            msg_type,
            timestamp: Utc::now(),
            request_id: request.request_id.clone(),
            data,
        }
    }

    /// Structured `error` frame.
    pub fn error(code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        let data = ErrorData {
            code,
            message: message.into(),
            details,
        };
        Self::new(
            MessageType::Error,
            serde_json::to_value(&data).unwrap_or(serde_json::Value::Null),
        )
    }
}

// ---------------------------------------------------------------------------
// data payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeData {
    pub panel_id: String,
    pub panel_type: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponseData {
    pub success: bool,
    #[serde(default)]
    pub connection_id: String,
    pub server_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeData {
    #[serde(default)]
    pub event_types: Vec<StateEventType>,
    #[serde(default)]
    pub panel_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    #[serde(default)]
    pub panel_id: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateResponseData {
    pub success: bool,
    /// State version after the update (current version on failure).
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownData {
    #[serde(default)]
    pub cleanup: bool,
    /// Explicit override for the multiple-clients refusal.
    #[serde(default)]
    pub force: bool,
}

/// Handshake validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("panel_id cannot be empty")]
    EmptyPanelId,
    #[error("panel_type must be one of: sessions, messages, input, controller")]
    InvalidPanelType,
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

/// Validate a handshake against the closed panel-type set and the protocol
/// version (same major accepted).
pub fn validate_handshake(data: &HandshakeData) -> Result<(), HandshakeError> {
    if data.panel_id.is_empty() {
        return Err(HandshakeError::EmptyPanelId);
    }
    if !PANEL_TYPES.contains(&data.panel_type.as_str()) {
        return Err(HandshakeError::InvalidPanelType);
    }
    let major = data.version.split('.').next().unwrap_or("");
    let expected_major = PROTOCOL_VERSION.split('.').next().unwrap_or("");
    if major.is_empty() || major != expected_major {
        return Err(HandshakeError::UnsupportedVersion(data.version.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::HandshakeResponse).unwrap(),
            "\"handshake_response\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::ReloadLayout).unwrap(),
            "\"reload_layout\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::ListClients).unwrap(),
            "\"list_clients\""
        );
    }

    #[test]
    fn error_codes_are_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::AuthFailed).unwrap(),
            "\"AUTH_FAILED\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::TooManyRetries).unwrap(),
            "\"TOO_MANY_RETRIES\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::VersionConflict).unwrap(),
            "\"VERSION_CONFLICT\""
        );
    }

    #[test]
    fn frame_round_trips_with_request_id() {
        let frame = IpcMessage::new(
            MessageType::StateRequest,
            serde_json::json!({}),
        )
        .with_request_id("req-7");
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: IpcMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.request_id.as_deref(), Some("req-7"));
    }

    #[test]
    fn reply_copies_request_id() {
        let request = IpcMessage::new(MessageType::Status, serde_json::json!({}))
            .with_request_id("req-1");
        let reply = IpcMessage::reply_to(&request, MessageType::Status, serde_json::json!({"ok": true}));
        assert_eq!(reply.request_id.as_deref(), Some("req-1"));
        assert_eq!(reply.msg_type, MessageType::Status);
    }

    #[test]
    fn error_frame_shape() {
        let frame = IpcMessage::error(ErrorCode::AuthFailed, "denied", None);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "AUTH_FAILED");
        assert_eq!(value["data"]["message"], "denied");
        assert!(value["data"].get("details").is_none());
    }

    #[test]
    fn handshake_validation_accepts_all_panel_types() {
        for panel_type in PANEL_TYPES {
            let data = HandshakeData {
                panel_id: format!("{panel_type}-1"),
                panel_type: panel_type.into(),
                version: PROTOCOL_VERSION.into(),
            };
            assert!(validate_handshake(&data).is_ok(), "{panel_type}");
        }
    }

    #[test]
    fn handshake_validation_rejects_bad_input() {
        let base = HandshakeData {
            panel_id: "p1".into(),
            panel_type: "sessions".into(),
            version: PROTOCOL_VERSION.into(),
        };

        let mut empty_id = base.clone();
        empty_id.panel_id.clear();
        assert_eq!(
            validate_handshake(&empty_id),
            Err(HandshakeError::EmptyPanelId)
        );

        let mut bad_type = base.clone();
        bad_type.panel_type = "dashboard".into();
        assert_eq!(
            validate_handshake(&bad_type),
            Err(HandshakeError::InvalidPanelType)
        );

        let mut bad_version = base;
        bad_version.version = "2.0".into();
        assert!(matches!(
            validate_handshake(&bad_version),
            Err(HandshakeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn handshake_accepts_same_major_minor_bump() {
        let data = HandshakeData {
            panel_id: "p1".into(),
            panel_type: "input".into(),
            version: "1.3".into(),
        };
        assert!(validate_handshake(&data).is_ok());
    }

    #[test]
    fn shutdown_data_defaults() {
        let data: ShutdownData = serde_json::from_str("{}").unwrap();
        assert!(!data.cleanup);
        assert!(!data.force);
    }
}
