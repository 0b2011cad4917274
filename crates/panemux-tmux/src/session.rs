//! Session-level tmux operations: existence checks, creation, teardown,
//! attached-client queries and the status-line warning.

use crate::error::TmuxError;
use crate::executor::TmuxCommandRunner;

/// Tab-delimited format string for `tmux list-clients -F`.
const LIST_CLIENTS_FORMAT: &str = "#{client_tty}\t#{client_pid}\t#{client_name}";

/// One client attached to the owned session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub tty: String,
    pub pid: Option<u32>,
    pub name: String,
}

/// Exact-match target for a session name (`=` disables prefix matching).
fn exact(name: &str) -> String {
    format!("={name}")
}

/// Whether the session exists on the tmux server.
pub async fn has_session(
    runner: &impl TmuxCommandRunner,
    name: &str,
) -> Result<bool, TmuxError> {
    match runner.run(&["has-session", "-t", &exact(name)]).await {
        Ok(_) => Ok(true),
        Err(TmuxError::CommandFailed(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create a detached session running `command` in its first pane, with the
/// given environment exported into the pane. Returns the first pane's id.
pub async fn new_session(
    runner: &impl TmuxCommandRunner,
    name: &str,
    command: &str,
    env: &[(String, String)],
) -> Result<String, TmuxError> {
    let mut args: Vec<String> = vec![
        "new-session".into(),
        "-d".into(),
        "-s".into(),
        name.into(),
        "-P".into(),
        "-F".into(),
        "#{pane_id}".into(),
    ];
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(command.into());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = runner.run(&arg_refs).await?;
    let pane_id = output.trim();
    if pane_id.is_empty() {
        return Err(TmuxError::Parse(
            "new-session printed no pane id".into(),
        ));
    }
    Ok(pane_id.to_string())
}

/// Kill the session. Missing session is not an error (teardown is idempotent).
pub async fn kill_session(runner: &impl TmuxCommandRunner, name: &str) -> Result<(), TmuxError> {
    match runner.run(&["kill-session", "-t", &exact(name)]).await {
        Ok(_) => Ok(()),
        Err(TmuxError::CommandFailed(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Clients currently attached to the session. A missing session yields an
/// empty list.
pub async fn list_clients(
    runner: &impl TmuxCommandRunner,
    name: &str,
) -> Result<Vec<ClientInfo>, TmuxError> {
    let output = match runner
        .run(&["list-clients", "-t", &exact(name), "-F", LIST_CLIENTS_FORMAT])
        .await
    {
        Ok(out) => out,
        Err(TmuxError::CommandFailed(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    parse_list_clients_output(&output)
}

/// Parse the raw output of `tmux list-clients -F <FORMAT>`.
pub fn parse_list_clients_output(output: &str) -> Result<Vec<ClientInfo>, TmuxError> {
    let mut clients = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parts: Vec<&str> = trimmed.split('\t').collect();
        if parts.len() < 2 {
            return Err(TmuxError::Parse(format!(
                "expected at least 2 tab-separated client fields, got {}",
                parts.len()
            )));
        }
        clients.push(ClientInfo {
            tty: parts[0].to_string(),
            pid: parts[1].trim().parse().ok(),
            name: parts.get(2).map(|s| s.to_string()).unwrap_or_default(),
        });
    }
    Ok(clients)
}

/// Put a warning message on the session's status line. Used when the daemon
/// stops without cleanup and leaves the panes unsupervised.
pub async fn set_status_warning(
    runner: &impl TmuxCommandRunner,
    name: &str,
    message: &str,
) -> Result<(), TmuxError> {
    runner
        .run(&["set-option", "-t", &exact(name), "status-right", message])
        .await?;
    Ok(())
}

/// Argv for attaching the calling terminal to the session.
pub fn attach_args(name: &str) -> Vec<String> {
    vec!["attach-session".into(), "-t".into(), exact(name)]
}

/// Argv for detaching clients from the session.
///
/// tmux's `-s` form detaches every client attached to the session; from
/// outside tmux there is no "current client" to single out, so both CLI
/// spellings map to the same invocation.
pub fn detach_args(name: &str, _all: bool) -> Vec<String> {
    vec!["detach-client".into(), "-s".into(), exact(name)]
}
