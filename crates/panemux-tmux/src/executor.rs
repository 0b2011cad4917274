//! TmuxCommandRunner trait and the timeout-bounded subprocess executor.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::error::TmuxError;

/// Default bound on a single tmux invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for executing tmux commands. Enables mock injection for testing.
pub trait TmuxCommandRunner: Send + Sync {
    fn run(&self, args: &[&str]) -> impl Future<Output = Result<String, TmuxError>> + Send;
}

impl<T: TmuxCommandRunner> TmuxCommandRunner for &T {
    fn run(&self, args: &[&str]) -> impl Future<Output = Result<String, TmuxError>> + Send {
        (**self).run(args)
    }
}

impl<T: TmuxCommandRunner> TmuxCommandRunner for Arc<T> {
    fn run(&self, args: &[&str]) -> impl Future<Output = Result<String, TmuxError>> + Send {
        (**self).run(args)
    }
}

/// Real tmux executor spawning one `tmux` process per call.
///
/// Every invocation is bounded by `timeout`; on expiry the child is killed
/// and the call fails with [`TmuxError::Timeout`].
#[derive(Debug, Clone)]
pub struct TmuxExecutor {
    tmux_bin: String,
    socket_name: Option<String>,
    timeout: Duration,
}

impl TmuxExecutor {
    pub fn new() -> Self {
        Self {
            tmux_bin: "tmux".into(),
            socket_name: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_bin(bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: bin.into(),
            socket_name: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Use a dedicated tmux server socket (`tmux -L <name>`).
    #[must_use]
    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for TmuxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxCommandRunner for TmuxExecutor {
    async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let mut cmd = Command::new(&self.tmux_bin);
        if let Some(ref name) = self.socket_name {
            cmd.args(["-L", name]);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TmuxError::Timeout(self.timeout))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TmuxError::NotFound
                } else {
                    TmuxError::Io(e)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TmuxError::CommandFailed(format!(
                "exit {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                stderr.trim(),
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
