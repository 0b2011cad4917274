//! IPC client for the control plane, used by the CLI subcommands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::codec::{CodecError, IpcCodec};
use crate::protocol::{
    ErrorData, HandshakeResponseData, IpcMessage, MessageType, PROTOCOL_VERSION,
};

/// Per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {0}")]
    NotRunning(PathBuf),

    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("authorization failed: {0}")]
    Denied(String),

    #[error("daemon error [{code}]: {message}")]
    Daemon { code: String, message: String },

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by daemon")]
    ConnectionClosed,
}

/// A handshaked control connection.
#[derive(Debug)]
pub struct ControlClient {
    framed: Framed<UnixStream, IpcCodec>,
    next_request: u64,
}

impl ControlClient {
    /// Connect and handshake as a `controller` panel.
    pub async fn connect(socket: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::ConnectionRefused
            {
                ClientError::NotRunning(socket.to_path_buf())
            } else {
                ClientError::Connect(e)
            }
        })?;
        let mut framed = Framed::new(stream, IpcCodec::new());

        let panel_id = format!("controller-{}", std::process::id());
        framed
            .send(IpcMessage::new(
                MessageType::Handshake,
                serde_json::json!({
                    "panel_id": panel_id,
                    "panel_type": "controller",
                    "version": PROTOCOL_VERSION,
                }),
            ))
            .await?;

        let frame = tokio::time::timeout(REQUEST_TIMEOUT, framed.next())
            .await
            .map_err(|_| ClientError::Timeout(REQUEST_TIMEOUT))?
            .ok_or(ClientError::ConnectionClosed)??;
        match frame.msg_type {
            MessageType::HandshakeResponse => {
                let response: HandshakeResponseData = serde_json::from_value(frame.data)
                    .map_err(|e| ClientError::HandshakeRejected(e.to_string()))?;
                if !response.success {
                    return Err(ClientError::HandshakeRejected(
                        response.error.unwrap_or_else(|| "unknown".into()),
                    ));
                }
            }
            other => {
                return Err(ClientError::HandshakeRejected(format!(
                    "unexpected frame: {other:?}"
                )))
            }
        }

        Ok(Self {
            framed,
            next_request: 1,
        })
    }

    /// Send one request and wait for its correlated reply, skipping event
    /// frames interleaved by the server.
    pub async fn request(
        &mut self,
        msg_type: MessageType,
        data: serde_json::Value,
    ) -> Result<IpcMessage, ClientError> {
        let request_id = format!("req-{}", self.next_request);
        self.next_request += 1;

        self.framed
            .send(IpcMessage::new(msg_type, data).with_request_id(&request_id))
            .await?;

        let deadline = tokio::time::Instant::now() + REQUEST_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(ClientError::Timeout(REQUEST_TIMEOUT))?;
            let frame = tokio::time::timeout(remaining, self.framed.next())
                .await
                .map_err(|_| ClientError::Timeout(REQUEST_TIMEOUT))?
                .ok_or(ClientError::ConnectionClosed)??;

            match frame.msg_type {
                MessageType::StateEvent => continue,
                MessageType::Error => {
                    let error: ErrorData = serde_json::from_value(frame.data.clone())
                        .unwrap_or(ErrorData {
                            code: crate::protocol::ErrorCode::InternalError,
                            message: "malformed error frame".into(),
                            details: None,
                        });
                    let code = serde_json::to_value(error.code)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| "INTERNAL_ERROR".into());
                    if code == "AUTH_FAILED" {
                        return Err(ClientError::Denied(error.message));
                    }
                    return Err(ClientError::Daemon {
                        code,
                        message: error.message,
                    });
                }
                _ if frame.request_id.as_deref() == Some(request_id.as_str()) => {
                    return Ok(frame)
                }
                // Unsolicited frame (e.g. a pong for someone else's ping on a
                // shared connection); keep waiting for our reply.
                _ => continue,
            }
        }
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.request(MessageType::Ping, serde_json::json!({})).await?;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<serde_json::Value, ClientError> {
        let reply = self.request(MessageType::Status, serde_json::json!({})).await?;
        Ok(reply.data)
    }

    pub async fn list_clients(&mut self) -> Result<serde_json::Value, ClientError> {
        let reply = self
            .request(MessageType::ListClients, serde_json::json!({}))
            .await?;
        Ok(reply.data)
    }

    pub async fn shutdown(&mut self, cleanup: bool, force: bool) -> Result<(), ClientError> {
        self.request(
            MessageType::Shutdown,
            serde_json::json!({ "cleanup": cleanup, "force": force }),
        )
        .await?;
        Ok(())
    }

    pub async fn reload_layout(&mut self) -> Result<(), ClientError> {
        self.request(MessageType::ReloadLayout, serde_json::json!({}))
            .await?;
        Ok(())
    }
}
