//! Error types for the tmux backend.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("tmux not found")]
    NotFound,

    #[error("tmux command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to parse tmux output: {0}")]
    Parse(String),

    #[error("tmux io error: {0}")]
    Io(#[from] std::io::Error),
}
