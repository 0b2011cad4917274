//! Classify the daemon socket path before binding.
//!
//! The checker never deletes anything; the orchestrator composes it with a
//! cleanup step when the verdict is [`SocketStatus::Stale`].

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixStream;

/// How long a probe connect may take before the listener counts as gone.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Verdict for a socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// No filesystem entry at the path.
    Nonexistent,
    /// A socket file exists but nothing accepts connections on it.
    Stale,
    /// A listener accepted (and we immediately closed) a probe connection.
    Active,
    /// stat or connect failed with an authorization error.
    PermissionDenied,
}

#[derive(Debug, Error)]
pub enum SocketCheckError {
    #[error("path exists but is not a socket: {0}")]
    NotASocket(PathBuf),
    #[error("failed to inspect socket {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Classify `path` as nonexistent / stale / active / permission-denied.
pub async fn check_socket(path: &Path) -> Result<SocketStatus, SocketCheckError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SocketStatus::Nonexistent)
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Ok(SocketStatus::PermissionDenied)
        }
        Err(e) => {
            return Err(SocketCheckError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    if !metadata.file_type().is_socket() {
        return Err(SocketCheckError::NotASocket(path.to_path_buf()));
    }

    match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await {
        // Connection accepted; drop the stream immediately.
        Ok(Ok(_stream)) => Ok(SocketStatus::Active),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Ok(SocketStatus::Stale)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Ok(SocketStatus::PermissionDenied)
        }
        Ok(Err(e)) => Err(SocketCheckError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
        Err(_elapsed) => Ok(SocketStatus::Stale),
    }
}
