//! panemux CLI: daemon launcher plus IPC-client control subcommands.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use panemux_daemon::client::{ClientError, ControlClient};
use panemux_daemon::config::{load_layout, load_session};
use panemux_daemon::orchestrator::{Orchestrator, OrchestratorError, OrchestratorOptions, RunMode};
use panemux_daemon::paths::{base_dir, session_paths, SessionPaths};
use panemux_daemon::socket_check::{check_socket, SocketStatus};
use panemux_tmux::session::{attach_args, detach_args};
use panemux_tmux::TmuxExecutor;

const EXIT_FAILURE: u8 = 1;
const EXIT_AUTH: u8 = 2;
/// Already-running on start, not-found on control commands.
const EXIT_STATE: u8 = 3;

#[derive(Parser)]
#[command(name = "panemux", version, about = "Multi-pane terminal orchestrator for tmux")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator daemon for a session
    Start {
        /// Session name (defaults to the session config)
        name: Option<String>,

        /// Run the IPC/state plane without creating a tmux session
        #[arg(long)]
        server_only: bool,

        /// Stay in the foreground; SIGINT/SIGTERM trigger cleanup shutdown
        #[arg(long, conflicts_with = "daemon")]
        foreground: bool,

        /// Daemon signal semantics (the default)
        #[arg(long)]
        daemon: bool,

        /// Replace an active socket instead of refusing to start
        #[arg(long)]
        force_new: bool,

        /// If a daemon is already serving the session, attach instead
        #[arg(long, conflicts_with = "force_new")]
        reuse: bool,

        /// Stop the daemon after the session has had no clients for a while
        #[arg(long)]
        auto_shutdown_when_empty: bool,
    },
    /// Attach the current terminal to the session
    Attach {
        name: Option<String>,
    },
    /// Detach clients from the session
    Detach {
        name: Option<String>,

        /// Detach every client
        #[arg(long)]
        all: bool,
    },
    /// Stop the daemon
    Stop {
        name: Option<String>,

        /// Also kill the tmux session
        #[arg(long)]
        cleanup: bool,

        /// Refuse to stop while clients are attached
        #[arg(long)]
        check_clients: bool,

        /// Override the attached-clients refusal
        #[arg(long)]
        force: bool,
    },
    /// Show daemon status
    Status {
        name: Option<String>,

        /// Raw JSON output
        #[arg(long)]
        json: bool,
    },
    /// List sessions under the panemux base directory
    List {
        /// Session names only
        #[arg(long, short)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            name,
            server_only,
            foreground,
            daemon: _,
            force_new,
            reuse,
            auto_shutdown_when_empty,
        } => {
            let session = resolve_session(name);
            let paths = session_paths(&base_dir(), &session);
            init_logging(if foreground { None } else { Some(&paths) });
            run_start(
                session,
                paths,
                server_only,
                foreground,
                force_new,
                reuse,
                auto_shutdown_when_empty,
            )
            .await
        }
        Commands::Attach { name } => {
            init_logging(None);
            run_attach(&resolve_session(name))
        }
        Commands::Detach { name, all } => {
            init_logging(None);
            run_detach(&resolve_session(name), all)
        }
        Commands::Stop {
            name,
            cleanup,
            check_clients,
            force,
        } => {
            init_logging(None);
            run_stop(&resolve_session(name), cleanup, check_clients, force).await
        }
        Commands::Status { name, json } => {
            init_logging(None);
            run_status(&resolve_session(name), json).await
        }
        Commands::List { quiet } => {
            init_logging(None);
            run_list(quiet).await
        }
    }
}

/// Resolve the session name from the CLI or the session document.
fn resolve_session(name: Option<String>) -> String {
    if let Some(name) = name {
        return name;
    }
    load_session(&base_dir().join("session.yaml"))
        .map(|config| config.session.name)
        .unwrap_or_else(|e| {
            eprintln!("warning: {e}; using default session name");
            "panemux".into()
        })
}

/// Stderr logging for interactive commands, file logging for the daemon.
fn init_logging(daemon_paths: Option<&SessionPaths>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match daemon_paths {
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        Some(paths) => {
            let _ = paths.ensure_dirs();
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&paths.log_file)
            {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(file)
                        .with_ansi(false)
                        .init();
                }
                Err(e) => {
                    eprintln!(
                        "warning: cannot open log file {}: {e}; logging to stderr",
                        paths.log_file.display()
                    );
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(std::io::stderr)
                        .init();
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_start(
    session: String,
    paths: SessionPaths,
    server_only: bool,
    foreground: bool,
    force_new: bool,
    reuse: bool,
    auto_shutdown_when_empty: bool,
) -> ExitCode {
    // --reuse: a healthy daemon already serving the session means attach,
    // not start.
    if reuse {
        if let Ok(SocketStatus::Active) = check_socket(&paths.socket).await {
            println!("daemon already running for '{session}', attaching");
            return run_attach(&session);
        }
    }

    let layout = match load_layout(&paths.base_dir.join("layout.yaml")) {
        Ok(layout) => layout,
        Err(e) => {
            eprintln!("panemux: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let mut options = OrchestratorOptions::new(session, paths);
    options.run_mode = if foreground {
        RunMode::Foreground
    } else {
        RunMode::Daemon
    };
    options.server_only = server_only;
    options.force_new = force_new;
    options.auto_shutdown_when_empty = auto_shutdown_when_empty;
    options.empty_grace = Duration::from_secs(60);
    options.layout = layout;

    match Orchestrator::run(options, Arc::new(TmuxExecutor::new())).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(OrchestratorError::SocketActive(path)) => {
            eprintln!(
                "panemux: daemon already running ({}); use --reuse to attach or --force-new to replace",
                path.display()
            );
            ExitCode::from(EXIT_STATE)
        }
        Err(OrchestratorError::AlreadyRunning(path)) => {
            eprintln!("panemux: another daemon holds {}", path.display());
            ExitCode::from(EXIT_STATE)
        }
        Err(e) => {
            error!(error = %e, "daemon failed");
            eprintln!("panemux: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_attach(session: &str) -> ExitCode {
    let args = attach_args(session);
    match std::process::Command::new("tmux").args(&args).status() {
        Ok(status) if status.success() => ExitCode::SUCCESS,
        Ok(_) => {
            eprintln!("panemux: no tmux session '{session}'");
            ExitCode::from(EXIT_STATE)
        }
        Err(e) => {
            eprintln!("panemux: failed to run tmux: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_detach(session: &str, all: bool) -> ExitCode {
    let args = detach_args(session, all);
    match std::process::Command::new("tmux").args(&args).status() {
        Ok(status) if status.success() => ExitCode::SUCCESS,
        Ok(_) => {
            eprintln!("panemux: no tmux session '{session}'");
            ExitCode::from(EXIT_STATE)
        }
        Err(e) => {
            eprintln!("panemux: failed to run tmux: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run_stop(session: &str, cleanup: bool, check_clients: bool, force: bool) -> ExitCode {
    let paths = session_paths(&base_dir(), session);
    let mut client = match ControlClient::connect(&paths.socket).await {
        Ok(client) => client,
        Err(ClientError::NotRunning(_)) => {
            eprintln!("panemux: no daemon running for '{session}'");
            return ExitCode::from(EXIT_STATE);
        }
        Err(e) => {
            eprintln!("panemux: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if check_clients && !force {
        match client.list_clients().await {
            Ok(data) => {
                let attached = data["clients"].as_array().map(Vec::len).unwrap_or(0);
                if attached > 0 {
                    eprintln!(
                        "panemux: {attached} client(s) attached to '{session}'; use --force to stop anyway"
                    );
                    return ExitCode::from(EXIT_FAILURE);
                }
            }
            Err(e) => {
                eprintln!("panemux: client check failed: {e}");
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    }

    match client.shutdown(cleanup, force).await {
        Ok(()) => {
            println!("daemon for '{session}' stopping{}", if cleanup { " (cleanup)" } else { "" });
            ExitCode::SUCCESS
        }
        Err(ClientError::Denied(reason)) => {
            eprintln!("panemux: not authorized: {reason}");
            ExitCode::from(EXIT_AUTH)
        }
        Err(e) => {
            eprintln!("panemux: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run_status(session: &str, json: bool) -> ExitCode {
    let paths = session_paths(&base_dir(), session);
    let mut client = match ControlClient::connect(&paths.socket).await {
        Ok(client) => client,
        Err(ClientError::NotRunning(_)) => {
            eprintln!("panemux: no daemon running for '{session}'");
            return ExitCode::from(EXIT_STATE);
        }
        Err(e) => {
            eprintln!("panemux: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let status = match client.status().await {
        Ok(status) => status,
        Err(ClientError::Denied(reason)) => {
            eprintln!("panemux: not authorized: {reason}");
            return ExitCode::from(EXIT_AUTH);
        }
        Err(e) => {
            eprintln!("panemux: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).unwrap_or_else(|_| status.to_string())
        );
    } else {
        print!("{}", format_status(&status));
    }
    ExitCode::SUCCESS
}

/// Human-readable status summary.
fn format_status(status: &serde_json::Value) -> String {
    let mut out = String::new();
    let session = status["session"].as_str().unwrap_or("?");
    let version = status["daemon_version"].as_str().unwrap_or("?");
    let uptime = status["uptime_seconds"].as_i64().unwrap_or(0);
    let state_version = status["state_version"].as_u64().unwrap_or(0);
    let clients = status["attached_clients"].as_u64().unwrap_or(0);

    out.push_str(&format!("session:  {session} (panemux {version})\n"));
    out.push_str(&format!("uptime:   {uptime}s\n"));
    out.push_str(&format!("state:    version {state_version}\n"));
    out.push_str(&format!("clients:  {clients}\n"));
    if let Some(panes) = status["panes"].as_array() {
        out.push_str("panes:\n");
        for pane in panes {
            out.push_str(&format!(
                "  {:<12} {:<6} {}\n",
                pane["role"].as_str().unwrap_or("?"),
                pane["target"].as_str().unwrap_or("?"),
                pane["state"].as_str().unwrap_or("?"),
            ));
        }
    }
    out
}

async fn run_list(quiet: bool) -> ExitCode {
    let base = base_dir();
    let entries = match std::fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(_) => {
            if !quiet {
                println!("no sessions under {}", base.display());
            }
            return ExitCode::SUCCESS;
        }
    };

    let mut rows = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sock") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let state = match check_socket(&path).await {
            Ok(SocketStatus::Active) => "running",
            Ok(SocketStatus::Stale) => "stale",
            Ok(SocketStatus::PermissionDenied) => "denied",
            Ok(SocketStatus::Nonexistent) | Err(_) => "unknown",
        };
        rows.push((name.to_string(), state));
    }
    rows.sort();

    if rows.is_empty() && !quiet {
        println!("no sessions under {}", base.display());
    }
    for (name, state) in rows {
        if quiet {
            println!("{name}");
        } else {
            println!("{name:<24} {state}");
        }
    }
    ExitCode::SUCCESS
}
