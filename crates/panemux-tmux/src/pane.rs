//! Pane-level operations: liveness probes, health classification, respawn
//! and environment inspection of the process running inside a pane.

use std::collections::HashMap;

use crate::error::TmuxError;
use crate::executor::TmuxCommandRunner;

/// Format string for the pane liveness probe.
const PANE_PROBE_FORMAT: &str = "#{pane_dead}\t#{pane_pid}";

/// Four-valued pane health tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneHealth {
    /// Pane exists, is not dead, and its process is alive.
    Healthy,
    /// tmux reports `pane_dead=1`.
    Dead,
    /// Pane exists but its pid is unreadable or no longer running.
    Zombie,
    /// The target is not present in the session.
    Missing,
}

/// Raw probe result for an existing pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaneProbe {
    pub dead: bool,
    pub pid: Option<u32>,
}

/// Query `#{pane_dead}` and `#{pane_pid}` for a target. `Ok(None)` means the
/// target does not exist.
pub async fn probe_pane(
    runner: &impl TmuxCommandRunner,
    target: &str,
) -> Result<Option<PaneProbe>, TmuxError> {
    let output = match runner
        .run(&["display-message", "-p", "-t", target, PANE_PROBE_FORMAT])
        .await
    {
        Ok(out) => out,
        Err(TmuxError::CommandFailed(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(parse_probe_output(&output)?))
}

/// Parse one `pane_dead\tpane_pid` probe line.
pub fn parse_probe_output(output: &str) -> Result<PaneProbe, TmuxError> {
    let line = output.trim();
    let mut parts = line.split('\t');
    let dead = match parts.next().map(str::trim) {
        Some("1") => true,
        Some("0") => false,
        other => {
            return Err(TmuxError::Parse(format!(
                "unexpected pane_dead value: {other:?}"
            )))
        }
    };
    let pid = parts.next().and_then(|s| s.trim().parse().ok());
    Ok(PaneProbe { dead, pid })
}

/// Classify a probe into the four-valued health tag. `pid_alive` is injected
/// so the pure classification is testable without a live process table.
pub fn classify_health(probe: Option<PaneProbe>, pid_alive: impl Fn(u32) -> bool) -> PaneHealth {
    match probe {
        None => PaneHealth::Missing,
        Some(p) if p.dead => PaneHealth::Dead,
        Some(PaneProbe { pid: Some(pid), .. }) if pid_alive(pid) => PaneHealth::Healthy,
        Some(_) => PaneHealth::Zombie,
    }
}

/// Probe a pane and classify it against the real process table.
pub async fn pane_health(
    runner: &impl TmuxCommandRunner,
    target: &str,
) -> Result<PaneHealth, TmuxError> {
    let probe = probe_pane(runner, target).await?;
    Ok(classify_health(probe, pid_is_alive))
}

/// Whether a pid exists in the process table.
#[cfg(target_os = "linux")]
pub fn pid_is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn pid_is_alive(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Respawn the pane's command, killing whatever still runs there, with the
/// environment exported into the new process.
pub async fn respawn_pane(
    runner: &impl TmuxCommandRunner,
    target: &str,
    command: &str,
    env: &[(String, String)],
) -> Result<(), TmuxError> {
    let mut args: Vec<String> = vec!["respawn-pane".into(), "-k".into(), "-t".into(), target.into()];
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(command.into());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    runner.run(&arg_refs).await?;
    Ok(())
}

/// Split the window containing `target`, running `command` in the new pane.
/// Returns the new pane's id.
pub async fn split_window(
    runner: &impl TmuxCommandRunner,
    target: &str,
    horizontal: bool,
    percent: Option<u8>,
    command: &str,
    env: &[(String, String)],
) -> Result<String, TmuxError> {
    let mut args: Vec<String> = vec![
        "split-window".into(),
        if horizontal { "-h".into() } else { "-v".into() },
        "-t".into(),
        target.into(),
        "-P".into(),
        "-F".into(),
        "#{pane_id}".into(),
    ];
    if let Some(pct) = percent {
        args.push("-p".into());
        args.push(pct.to_string());
    }
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(command.into());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = runner.run(&arg_refs).await?;
    let pane_id = output.trim();
    if pane_id.is_empty() {
        return Err(TmuxError::Parse("split-window printed no pane id".into()));
    }
    Ok(pane_id.to_string())
}

/// All pane ids currently in the session, target-formatted.
pub async fn list_pane_targets(
    runner: &impl TmuxCommandRunner,
    session: &str,
) -> Result<Vec<String>, TmuxError> {
    let output = runner
        .run(&[
            "list-panes",
            "-s",
            "-t",
            &format!("={session}"),
            "-F",
            "#{pane_id}",
        ])
        .await?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

// ---------------------------------------------------------------------------
// Pane process environment
// ---------------------------------------------------------------------------

/// Read the environment of the process running in a pane.
///
/// Uses `/proc/<pid>/environ` on Linux; elsewhere falls back to `ps eww`.
pub fn read_pane_environment(pid: u32) -> std::io::Result<HashMap<String, String>> {
    #[cfg(target_os = "linux")]
    {
        let raw = std::fs::read(format!("/proc/{pid}/environ"))?;
        Ok(parse_proc_environ(&raw))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let output = std::process::Command::new("ps")
            .args(["eww", &pid.to_string()])
            .output()?;
        Ok(parse_ps_environ(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse the NUL-separated `KEY=VAL` pairs of `/proc/<pid>/environ`.
pub fn parse_proc_environ(raw: &[u8]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for chunk in raw.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(chunk);
        if let Some((key, value)) = text.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    env
}

/// Parse `KEY=VAL` tokens from the trailing columns of `ps eww` output.
pub fn parse_ps_environ(output: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in output.lines().skip(1) {
        for token in line.split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                // Environment keys never contain '/'; this filters argv paths.
                if !key.is_empty() && !key.contains('/') {
                    env.insert(key.to_string(), value.to_string());
                }
            }
        }
    }
    env
}
