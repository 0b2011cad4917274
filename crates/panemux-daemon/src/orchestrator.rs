//! The daemon root: composes every subsystem, owns the tmux session, and
//! sequences startup and shutdown.
//!
//! Startup: directories, socket hygiene, process lock, ownership record,
//! repository + coordinator, session create/reclaim, supervisors, watcher,
//! tracker, IPC server, then the signal-and-shutdown loop keyed by run mode.
//! Shutdown: stop accepting IPC, drain, cancel supervisors, final save, then
//! either kill the tmux session (cleanup) or leave it with a status-line
//! warning.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::FileExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panemux_core::SessionOwnership;
use panemux_tmux::layout::{apply_layout, LayoutPlan};
use panemux_tmux::pane::{list_pane_targets, respawn_pane};
use panemux_tmux::session::{has_session, kill_session, set_status_warning};
use panemux_tmux::{TmuxCommandRunner, TmuxError};

use crate::bus::EventBus;
use crate::clients::ClientTracker;
use crate::config::{ConfigError, LayoutConfig};
use crate::coordinator::{CoordinatorConfig, CoordinatorError, StateCoordinator};
use crate::gate::PermissionGate;
use crate::paths::SessionPaths;
use crate::repository::{FileRepository, RepositoryConfig};
use crate::server::{ControlCommand, IpcServer, PaneRegistry, PaneView, ServerConfig, ServerDeps};
use crate::socket_check::{check_socket, SocketCheckError, SocketStatus};
use crate::supervisor::{
    refresh_environment, PaneConfig, PaneSupervisor, RestartPolicy, SupervisorHandle,
};
use crate::watcher::SessionWatcher;

/// Environment variable carrying the IPC socket path into every pane.
pub const SOCKET_ENV_VAR: &str = "PANEMUX_SOCKET";

/// Why and how the daemon is going down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Kill the tmux session on the way out.
    pub cleanup: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// SIGINT/SIGTERM trigger cleanup shutdown.
    Foreground,
    /// Signals are ignored; shutdown only via IPC or session vanish.
    Daemon,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub session: String,
    pub run_mode: RunMode,
    /// Replace an active socket instead of refusing to start.
    pub force_new: bool,
    /// Skip the pane/session plane entirely (IPC and state only).
    pub server_only: bool,
    pub auto_shutdown_when_empty: bool,
    pub empty_grace: Duration,
    pub paths: SessionPaths,
    pub layout: LayoutConfig,
    pub restart_policy: RestartPolicy,
}

impl OrchestratorOptions {
    pub fn new(session: impl Into<String>, paths: SessionPaths) -> Self {
        Self {
            session: session.into(),
            run_mode: RunMode::Daemon,
            force_new: false,
            server_only: false,
            auto_shutdown_when_empty: false,
            empty_grace: Duration::from_secs(60),
            paths,
            layout: LayoutConfig::default(),
            restart_policy: RestartPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("daemon already serving socket {0} (use --force-new to replace it)")]
    SocketActive(PathBuf),

    #[error("no permission to use socket {0}")]
    SocketPermission(PathBuf),

    #[error(transparent)]
    SocketCheck(#[from] SocketCheckError),

    #[error("another daemon holds the process lock {0}")]
    AlreadyRunning(PathBuf),

    #[error(transparent)]
    Tmux(#[from] TmuxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Advisory process lock; releases the flock and removes the file on every
/// exit path.
struct ProcessLock {
    file: Option<File>,
    path: PathBuf,
}

impl ProcessLock {
    fn acquire(path: &Path) -> Result<ProcessLock, OrchestratorError> {
        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(OrchestratorError::AlreadyRunning(path.to_path_buf()));
        }
        file.set_len(0)?;
        let _ = write!(file, "{}", std::process::id());
        Ok(ProcessLock {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Orchestrator<R> {
    options: OrchestratorOptions,
    runner: Arc<R>,
    plan: Mutex<LayoutPlan>,
    supervisors: Mutex<HashMap<String, SupervisorHandle>>,
    supervisor_cancel: CancellationToken,
    registry: PaneRegistry,
    bus: Arc<EventBus>,
}

impl<R: TmuxCommandRunner + 'static> Orchestrator<R> {
    /// Run the daemon to completion. Returns after the shutdown sequence.
    pub async fn run(options: OrchestratorOptions, runner: Arc<R>) -> Result<(), OrchestratorError> {
        // 1. Directories.
        options.paths.ensure_dirs()?;

        // 2. Socket hygiene.
        match check_socket(&options.paths.socket).await? {
            SocketStatus::Nonexistent => {}
            SocketStatus::Stale => {
                info!(path = %options.paths.socket.display(), "removing stale socket");
                std::fs::remove_file(&options.paths.socket)?;
            }
            SocketStatus::Active => {
                if options.force_new {
                    warn!(
                        path = %options.paths.socket.display(),
                        "replacing active socket (--force-new)"
                    );
                    std::fs::remove_file(&options.paths.socket)?;
                } else {
                    return Err(OrchestratorError::SocketActive(
                        options.paths.socket.clone(),
                    ));
                }
            }
            SocketStatus::PermissionDenied => {
                return Err(OrchestratorError::SocketPermission(
                    options.paths.socket.clone(),
                ));
            }
        }

        // 3. Process lock; held until this function returns.
        let _process_lock = ProcessLock::acquire(&options.paths.process_lock)?;

        // 4. Session ownership.
        let ownership = SessionOwnership::capture();
        info!(
            session = %options.session,
            uid = ownership.uid,
            user = %ownership.username,
            host = %ownership.hostname,
            "session ownership recorded"
        );

        // 5. Repository and state.
        let repository = Arc::new(FileRepository::new(RepositoryConfig::new(
            options.paths.state_file.clone(),
        )));

        // 6. Core components.
        let bus = Arc::new(EventBus::new(1000));
        let coordinator = StateCoordinator::new(
            Arc::clone(&repository),
            Arc::clone(&bus),
            CoordinatorConfig::default(),
        );
        coordinator.initialize()?;

        let gate = Arc::new(PermissionGate::new(ownership));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<ShutdownRequest>(4);
        let (control_tx, mut control_rx) = mpsc::channel::<ControlCommand>(8);

        let orchestrator = Arc::new(Orchestrator {
            plan: Mutex::new(options.layout.to_plan()?),
            options,
            runner,
            supervisors: Mutex::new(HashMap::new()),
            supervisor_cancel: CancellationToken::new(),
            registry: Arc::new(Mutex::new(Vec::new())),
            bus: Arc::clone(&bus),
        });

        // 7. tmux session, panes and supervisors (skipped in server-only).
        if !orchestrator.options.server_only {
            orchestrator.start_session_plane().await?;
        }

        // 8. Long-lived tasks.
        let workers_cancel = CancellationToken::new();
        let worker_handles = coordinator.spawn_workers(workers_cancel.clone());

        let pollers_cancel = CancellationToken::new();
        let mut poller_handles = Vec::new();
        if !orchestrator.options.server_only {
            let watcher = SessionWatcher::new(
                Arc::clone(&orchestrator.runner),
                orchestrator.options.session.clone(),
                shutdown_tx.clone(),
                pollers_cancel.clone(),
            );
            poller_handles.push(tokio::spawn(watcher.run()));
        }

        let mut tracker = ClientTracker::new(
            Arc::clone(&orchestrator.runner),
            orchestrator.options.session.clone(),
            shutdown_tx.clone(),
            pollers_cancel.clone(),
        );
        if orchestrator.options.auto_shutdown_when_empty {
            tracker = tracker.with_empty_shutdown(orchestrator.options.empty_grace);
        }
        let counter = tracker.counter();
        if !orchestrator.options.server_only {
            poller_handles.push(tokio::spawn(tracker.run()));
        }

        let server_cancel = CancellationToken::new();
        let server = IpcServer::new(
            ServerConfig::new(orchestrator.options.paths.socket.clone()),
            ServerDeps {
                session: orchestrator.options.session.clone(),
                coordinator: Arc::clone(&coordinator),
                bus: Arc::clone(&bus),
                gate,
                repository: Arc::clone(&repository),
                runner: Arc::clone(&orchestrator.runner),
                counter,
                panes: Arc::clone(&orchestrator.registry),
                shutdown_tx: shutdown_tx.clone(),
                control_tx,
            },
            server_cancel.clone(),
        );
        let server_handle = tokio::spawn(server.run());

        // Seed the event history with a full snapshot so panels that attach
        // late can catch up without a state request.
        if let Err(e) = coordinator.full_sync() {
            warn!(error = %e, "initial state sync failed");
        }

        info!(
            session = %orchestrator.options.session,
            mode = ?orchestrator.options.run_mode,
            "daemon running"
        );

        // 9. Signal-and-shutdown loop.
        let request = orchestrator
            .wait_for_shutdown(&mut shutdown_rx, &mut control_rx)
            .await?;
        info!(reason = %request.reason, cleanup = request.cleanup, "shutting down");

        // --- shutdown sequence ---

        // Stop accepting IPC; the server drains active connections itself.
        server_cancel.cancel();
        if let Err(e) = tokio::time::timeout(Duration::from_secs(6), server_handle).await {
            warn!(error = %e, "ipc server did not stop in time");
        }

        // Cancel supervisors; wait with a deadline.
        orchestrator.supervisor_cancel.cancel();
        let supervisors: Vec<SupervisorHandle> = {
            let mut map = orchestrator
                .supervisors
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, handle)| handle).collect()
        };
        let join_all = async {
            for handle in supervisors {
                let _ = handle.join.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), join_all).await.is_err() {
            warn!("supervisors did not stop within the deadline");
        }

        // Stop pollers and background savers, then the final save.
        pollers_cancel.cancel();
        workers_cancel.cancel();
        for handle in poller_handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        for handle in worker_handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        if let Err(e) = coordinator.save_now() {
            warn!(error = %e, "final state save failed");
        }

        // Session teardown or the unsupervised-panes warning.
        if !orchestrator.options.server_only {
            if request.cleanup {
                if let Err(e) =
                    kill_session(orchestrator.runner.as_ref(), &orchestrator.options.session).await
                {
                    warn!(error = %e, "failed to kill tmux session");
                }
            } else {
                let _ = set_status_warning(
                    orchestrator.runner.as_ref(),
                    &orchestrator.options.session,
                    "panemux daemon stopped - panes unsupervised",
                )
                .await;
                info!(
                    session = %orchestrator.options.session,
                    "panes left running; reclaim with `panemux start {}` or clean up with `panemux stop {} --cleanup`",
                    orchestrator.options.session,
                    orchestrator.options.session
                );
            }
        }

        // The server removed the socket; the process lock releases on drop.
        let _ = std::fs::remove_file(&orchestrator.options.paths.socket);
        info!(session = %orchestrator.options.session, "daemon stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // session plane
    // ------------------------------------------------------------------

    fn pane_env(&self) -> Vec<(String, String)> {
        vec![(
            SOCKET_ENV_VAR.to_string(),
            self.options.paths.socket.display().to_string(),
        )]
    }

    /// Create or reclaim the tmux session and start one supervisor per pane.
    async fn start_session_plane(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let env = self.pane_env();
        let plan = self.plan.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let targets = if has_session(self.runner.as_ref(), &self.options.session).await? {
            self.reclaim_session(&plan, &env).await?
        } else {
            info!(session = %self.options.session, "creating tmux session");
            apply_layout(self.runner.as_ref(), &self.options.session, &plan, &env).await?
        };

        for panel in &plan.panels {
            let Some(target) = targets.get(&panel.role) else {
                warn!(role = %panel.role, "no pane target for role, skipping supervisor");
                continue;
            };
            let pane = PaneConfig {
                role: panel.role.clone(),
                target: target.clone(),
                command: panel.command.clone(),
                env: env.clone(),
            };
            self.start_supervisor(pane);
        }
        Ok(())
    }

    /// Reattach to an existing session: map panes to roles in creation
    /// order, refresh environments, and recreate from scratch when the
    /// topology no longer matches the layout.
    async fn reclaim_session(
        &self,
        plan: &LayoutPlan,
        env: &[(String, String)],
    ) -> Result<HashMap<String, String>, OrchestratorError> {
        info!(session = %self.options.session, "reclaiming existing tmux session");
        let mut targets = list_pane_targets(self.runner.as_ref(), &self.options.session).await?;
        targets.sort_by_key(|t| t.trim_start_matches('%').parse::<u64>().unwrap_or(u64::MAX));

        if targets.len() != plan.panels.len() {
            warn!(
                found = targets.len(),
                expected = plan.panels.len(),
                "pane topology does not match layout, recreating session"
            );
            kill_session(self.runner.as_ref(), &self.options.session).await?;
            return Ok(apply_layout(self.runner.as_ref(), &self.options.session, plan, env).await?);
        }

        let mut mapped = HashMap::new();
        let socket_path = self.options.paths.socket.display().to_string();
        for (panel, target) in plan.panels.iter().zip(&targets) {
            let pane = PaneConfig {
                role: panel.role.clone(),
                target: target.clone(),
                command: panel.command.clone(),
                env: env.to_vec(),
            };
            match refresh_environment(self.runner.as_ref(), &pane, SOCKET_ENV_VAR, &socket_path)
                .await
            {
                Ok(true) => info!(role = %panel.role, target = %target, "pane respawned for new socket"),
                Ok(false) => debug!(role = %panel.role, target = %target, "pane environment current"),
                Err(e) => warn!(role = %panel.role, error = %e, "environment refresh failed"),
            }
            mapped.insert(panel.role.clone(), target.clone());
        }
        Ok(mapped)
    }

    fn start_supervisor(self: &Arc<Self>, pane: PaneConfig) {
        let role = pane.role.clone();
        let target = pane.target.clone();
        let supervisor = PaneSupervisor::new(
            Arc::clone(&self.runner),
            pane,
            self.options.restart_policy.clone(),
            Arc::clone(&self.bus),
            self.supervisor_cancel.child_token(),
        );
        let handle = supervisor.start();

        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.retain(|view| view.role != role);
            registry.push(PaneView {
                role: role.clone(),
                target,
                state: Arc::clone(&handle.state),
            });
        }
        let mut supervisors = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = supervisors.insert(role, handle) {
            old.cancel.cancel();
        }
    }

    // ------------------------------------------------------------------
    // control plane
    // ------------------------------------------------------------------

    async fn wait_for_shutdown(
        self: &Arc<Self>,
        shutdown_rx: &mut mpsc::Receiver<ShutdownRequest>,
        control_rx: &mut mpsc::Receiver<ControlCommand>,
    ) -> Result<ShutdownRequest, OrchestratorError> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            match self.options.run_mode {
                RunMode::Foreground => {
                    tokio::select! {
                        _ = sigint.recv() => {
                            return Ok(ShutdownRequest {
                                cleanup: true,
                                reason: "SIGINT".into(),
                            });
                        }
                        _ = sigterm.recv() => {
                            return Ok(ShutdownRequest {
                                cleanup: true,
                                reason: "SIGTERM".into(),
                            });
                        }
                        _ = sighup.recv() => {
                            debug!("ignoring SIGHUP");
                        }
                        request = shutdown_rx.recv() => {
                            if let Some(request) = request {
                                return Ok(request);
                            }
                        }
                        command = control_rx.recv() => {
                            if let Some(command) = command {
                                self.handle_control(command).await;
                            }
                        }
                    }
                }
                RunMode::Daemon => {
                    tokio::select! {
                        _ = sigint.recv() => {
                            info!("SIGINT ignored in daemon mode; use `panemux stop`");
                        }
                        _ = sigterm.recv() => {
                            info!("SIGTERM ignored in daemon mode; use `panemux stop`");
                        }
                        _ = sighup.recv() => {
                            debug!("ignoring SIGHUP");
                        }
                        request = shutdown_rx.recv() => {
                            if let Some(request) = request {
                                return Ok(request);
                            }
                        }
                        command = control_rx.recv() => {
                            if let Some(command) = command {
                                self.handle_control(command).await;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_control(self: &Arc<Self>, command: ControlCommand) {
        match command {
            ControlCommand::ReloadLayout => {
                if let Err(e) = self.reload_layout().await {
                    warn!(error = %e, "layout reload failed");
                }
            }
        }
    }

    /// Re-read the layout document and apply command changes: panes whose
    /// command template changed are respawned once and get a fresh
    /// supervisor; unchanged panes are untouched.
    async fn reload_layout(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.options.server_only {
            return Ok(());
        }
        let layout_path = self.options.paths.base_dir.join("layout.yaml");
        let layout = crate::config::load_layout(&layout_path)?;
        let new_plan = layout.to_plan()?;
        info!(path = %layout_path.display(), "layout reloaded");

        let old_plan = {
            let mut plan = self.plan.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *plan, new_plan.clone())
        };
        let env = self.pane_env();

        for panel in &new_plan.panels {
            let unchanged = old_plan.command_for(&panel.role) == Some(panel.command.as_str());
            if unchanged {
                continue;
            }
            let target = {
                let supervisors = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
                supervisors.get(&panel.role).map(|h| h.target.clone())
            };
            let Some(target) = target else {
                warn!(role = %panel.role, "new panel in layout has no pane; ignored until restart");
                continue;
            };

            info!(role = %panel.role, target = %target, "pane command changed, respawning");
            {
                let supervisors = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(handle) = supervisors.get(&panel.role) {
                    handle.cancel.cancel();
                }
            }
            respawn_pane(self.runner.as_ref(), &target, &panel.command, &env).await?;
            self.start_supervisor(PaneConfig {
                role: panel.role.clone(),
                target,
                command: panel.command.clone(),
                env: env.clone(),
            });
        }
        Ok(())
    }
}
