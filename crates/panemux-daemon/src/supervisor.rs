//! Per-pane lifecycle supervision.
//!
//! Two layers: a pure, clock-parameterized restart tracker with no IO, and
//! an async loop that polls tmux for liveness, respawns the panel command
//! with backoff, and gives up after too many consecutive failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panemux_core::event::SYSTEM_SOURCE;
use panemux_core::{StateEvent, StateEventType};
use panemux_tmux::pane::{pane_health, respawn_pane, PaneHealth};
use panemux_tmux::{TmuxCommandRunner, TmuxError};

use crate::bus::EventBus;

// ─── Restart policy ──────────────────────────────────────────────

/// Supervision parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Liveness poll interval (default 2 s).
    pub liveness_interval: Duration,
    /// First backoff delay (default 500 ms).
    pub initial_backoff: Duration,
    /// Backoff ceiling (default 30 s).
    pub max_backoff: Duration,
    /// A run at least this long resets the backoff to baseline (default 10 s).
    pub success_reset: Duration,
    /// Consecutive failures before the supervisor gives up (default 10).
    pub max_consecutive_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            success_reset: Duration::from_secs(10),
            max_consecutive_failures: 10,
        }
    }
}

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    Restarting,
    Failed,
    Stopped,
}

/// Decision after recording a pane death.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after the given (pre-jitter) delay.
    Restart { after: Duration },
    /// Consecutive-failure limit reached.
    GiveUp,
}

/// Pure restart state machine. All time values are passed in as epoch
/// milliseconds; no clock access.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    policy: RestartPolicy,
    consecutive_failures: u32,
    next_backoff: Duration,
    running_since_ms: Option<u64>,
}

impl BackoffTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        let initial = policy.initial_backoff;
        Self {
            policy,
            consecutive_failures: 0,
            next_backoff: initial,
            running_since_ms: None,
        }
    }

    /// The pane's process came up at `now_ms`.
    pub fn record_started(&mut self, now_ms: u64) {
        self.running_since_ms = Some(now_ms);
    }

    /// The pane died at `now_ms`. A run longer than `success_reset` first
    /// resets the backoff and the failure count to baseline.
    pub fn record_failure(&mut self, now_ms: u64) -> RestartDecision {
        if let Some(since) = self.running_since_ms.take() {
            let ran_for = now_ms.saturating_sub(since);
            if ran_for >= self.policy.success_reset.as_millis() as u64 {
                self.consecutive_failures = 0;
                self.next_backoff = self.policy.initial_backoff;
            }
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.policy.max_consecutive_failures {
            return RestartDecision::GiveUp;
        }

        let delay = self.next_backoff;
        self.next_backoff = (self.next_backoff * 2).min(self.policy.max_backoff);
        RestartDecision::Restart { after: delay }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

// ─── Pane supervisor ─────────────────────────────────────────────

/// Static description of one supervised pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneConfig {
    /// Application role tag (`sessions`, `messages`, `input`, `controller`).
    pub role: String,
    /// Opaque tmux target, e.g. `%3`.
    pub target: String,
    /// Command template respawned on death.
    pub command: String,
    /// Environment exported into the pane's process.
    pub env: Vec<(String, String)>,
}

/// Handle the orchestrator keeps per supervisor.
pub struct SupervisorHandle {
    pub role: String,
    pub target: String,
    pub state: Arc<Mutex<SupervisorState>>,
    pub cancel: CancellationToken,
    pub join: tokio::task::JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One logical supervisor per pane.
pub struct PaneSupervisor<R> {
    runner: R,
    pane: PaneConfig,
    policy: RestartPolicy,
    bus: Arc<EventBus>,
    state: Arc<Mutex<SupervisorState>>,
    cancel: CancellationToken,
}

impl<R: TmuxCommandRunner + 'static> PaneSupervisor<R> {
    pub fn new(
        runner: R,
        pane: PaneConfig,
        policy: RestartPolicy,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            pane,
            policy,
            bus,
            state: Arc::new(Mutex::new(SupervisorState::NotStarted)),
            cancel,
        }
    }

    /// Spawn the supervise loop.
    pub fn start(self) -> SupervisorHandle {
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let role = self.pane.role.clone();
        let target = self.pane.target.clone();
        let join = tokio::spawn(self.run());
        SupervisorHandle {
            role,
            target,
            state,
            cancel,
            join,
        }
    }

    fn set_state(&self, next: SupervisorState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    async fn run(self) {
        let mut tracker = BackoffTracker::new(self.policy.clone());
        self.set_state(SupervisorState::Starting);
        info!(role = %self.pane.role, target = %self.pane.target, "supervisor started");

        match pane_health(&self.runner, &self.pane.target).await {
            Ok(PaneHealth::Healthy) => {
                tracker.record_started(now_ms());
                self.set_state(SupervisorState::Running);
            }
            Ok(_) | Err(_) => {
                // First tick below deals with it.
                self.set_state(SupervisorState::Running);
            }
        }

        let mut ticker = tokio::time::interval(self.policy.liveness_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match pane_health(&self.runner, &self.pane.target).await {
                        Ok(PaneHealth::Healthy) => {}
                        Ok(health) => {
                            debug!(
                                role = %self.pane.role,
                                target = %self.pane.target,
                                ?health,
                                "pane not healthy"
                            );
                            if !self.handle_death(&mut tracker).await {
                                return;
                            }
                        }
                        Err(e) => {
                            // Transient tmux failure; keep the pane as-is and
                            // probe again next tick.
                            warn!(
                                role = %self.pane.role,
                                error = %e,
                                "liveness probe failed"
                            );
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    debug!(role = %self.pane.role, "supervisor cancelled");
                    self.set_state(SupervisorState::Stopped);
                    return;
                }
            }
        }
    }

    /// Backoff, respawn, and update the tracker. Returns `false` when the
    /// supervisor gave up or was cancelled.
    async fn handle_death(&self, tracker: &mut BackoffTracker) -> bool {
        match tracker.record_failure(now_ms()) {
            RestartDecision::GiveUp => {
                warn!(
                    role = %self.pane.role,
                    target = %self.pane.target,
                    failures = tracker.consecutive_failures(),
                    "pane exceeded restart budget, giving up"
                );
                self.set_state(SupervisorState::Failed);
                self.bus.broadcast(StateEvent::new(
                    StateEventType::PaneAlert,
                    serde_json::json!({
                        "role": self.pane.role,
                        "target": self.pane.target,
                        "consecutive_failures": tracker.consecutive_failures(),
                    }),
                    0,
                    SYSTEM_SOURCE,
                ));
                false
            }
            RestartDecision::Restart { after } => {
                self.set_state(SupervisorState::Restarting);
                tokio::select! {
                    _ = tokio::time::sleep(after) => {}
                    _ = self.cancel.cancelled() => {
                        self.set_state(SupervisorState::Stopped);
                        return false;
                    }
                }

                self.set_state(SupervisorState::Starting);
                match respawn_pane(
                    &self.runner,
                    &self.pane.target,
                    &self.pane.command,
                    &self.pane.env,
                )
                .await
                {
                    Ok(()) => {
                        info!(
                            role = %self.pane.role,
                            target = %self.pane.target,
                            "pane respawned"
                        );
                        tracker.record_started(now_ms());
                        self.set_state(SupervisorState::Running);
                    }
                    Err(e) => {
                        warn!(
                            role = %self.pane.role,
                            error = %e,
                            "respawn failed, will retry"
                        );
                        self.set_state(SupervisorState::Restarting);
                    }
                }
                true
            }
        }
    }
}

/// Check the socket-path variable inside a reclaimed pane's process; respawn
/// once on mismatch. Returns whether a respawn was issued.
pub async fn refresh_environment(
    runner: &impl TmuxCommandRunner,
    pane: &PaneConfig,
    socket_var: &str,
    socket_path: &str,
) -> Result<bool, TmuxError> {
    let probe = panemux_tmux::pane::probe_pane(runner, &pane.target).await?;
    let pid = match probe {
        Some(p) if !p.dead => match p.pid {
            Some(pid) => pid,
            None => return Ok(false),
        },
        // Dead or missing panes are the supervisor's problem, not ours.
        _ => return Ok(false),
    };

    let env = match panemux_tmux::pane::read_pane_environment(pid) {
        Ok(env) => env,
        Err(e) => {
            debug!(target = %pane.target, pid, error = %e, "environment unreadable");
            return Ok(false);
        }
    };

    if env.get(socket_var).map(String::as_str) == Some(socket_path) {
        return Ok(false);
    }

    info!(
        role = %pane.role,
        target = %pane.target,
        "socket path changed, respawning pane"
    );
    respawn_pane(runner, &pane.target, &pane.command, &pane.env).await?;
    Ok(true)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    // ── BackoffTracker ──────────────────────────────────────────

    #[test]
    fn first_failure_uses_initial_backoff() {
        let mut tracker = BackoffTracker::new(RestartPolicy::default());
        let decision = tracker.record_failure(1_000);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                after: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let mut tracker = BackoffTracker::new(RestartPolicy::default());
        tracker.record_failure(1_000);
        let decision = tracker.record_failure(2_000);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                after: Duration::from_secs(1)
            }
        );
        let decision = tracker.record_failure(3_000);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                after: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn backoff_caps_at_maximum() {
        let policy = RestartPolicy {
            max_backoff: Duration::from_secs(4),
            max_consecutive_failures: 100,
            ..RestartPolicy::default()
        };
        let mut tracker = BackoffTracker::new(policy);
        let mut last = Duration::ZERO;
        for i in 0..8 {
            if let RestartDecision::Restart { after } = tracker.record_failure(i * 1_000) {
                last = after;
            }
        }
        assert_eq!(last, Duration::from_secs(4));
    }

    #[test]
    fn long_run_resets_backoff_to_baseline() {
        let mut tracker = BackoffTracker::new(RestartPolicy::default());
        tracker.record_failure(0);
        tracker.record_failure(1_000);
        tracker.record_failure(2_000);

        // Comes back up and stays up past the 10 s success threshold.
        tracker.record_started(10_000);
        let decision = tracker.record_failure(25_000);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                after: Duration::from_millis(500)
            }
        );
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn short_run_does_not_reset_backoff() {
        let mut tracker = BackoffTracker::new(RestartPolicy::default());
        tracker.record_failure(0); // 500ms
        tracker.record_started(1_000);
        // Dies again after only 2 s of uptime.
        let decision = tracker.record_failure(3_000);
        assert_eq!(
            decision,
            RestartDecision::Restart {
                after: Duration::from_secs(1)
            }
        );
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn gives_up_at_failure_limit() {
        let policy = RestartPolicy {
            max_consecutive_failures: 3,
            ..RestartPolicy::default()
        };
        let mut tracker = BackoffTracker::new(policy);
        assert!(matches!(
            tracker.record_failure(0),
            RestartDecision::Restart { .. }
        ));
        assert!(matches!(
            tracker.record_failure(1_000),
            RestartDecision::Restart { .. }
        ));
        assert_eq!(tracker.record_failure(2_000), RestartDecision::GiveUp);
    }

    // ── Supervise loop ──────────────────────────────────────────

    /// Scripted pane probe: pops one health answer per display-message call,
    /// records respawns, and reports the last scripted answer forever after.
    struct ScriptedPane {
        probes: Mutex<VecDeque<&'static str>>,
        respawns: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl TmuxCommandRunner for ScriptedPane {
        async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
            match args[0] {
                "display-message" => {
                    let mut probes = self.probes.lock().unwrap();
                    let answer = if probes.len() > 1 {
                        probes.pop_front().unwrap()
                    } else {
                        probes.front().copied().unwrap_or("0\t100")
                    };
                    Ok(answer.to_string())
                }
                "respawn-pane" => {
                    self.respawns
                        .lock()
                        .unwrap()
                        .push(args.iter().map(|s| s.to_string()).collect());
                    Ok(String::new())
                }
                other => panic!("unexpected tmux command: {other}"),
            }
        }
    }

    fn pane_config() -> PaneConfig {
        PaneConfig {
            role: "input".into(),
            target: "%2".into(),
            command: "panemux-panel --role input".into(),
            env: vec![("PANEMUX_SOCKET".into(), "/tmp/p.sock".into())],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dead_pane_is_respawned() {
        let respawns = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(ScriptedPane {
            // healthy at startup, dead on the next probe, then healthy.
            probes: Mutex::new(VecDeque::from(["0\t100", "1\t100", "0\t101"])),
            respawns: Arc::clone(&respawns),
        });

        let cancel = CancellationToken::new();
        let bus = Arc::new(EventBus::new(16));
        let supervisor = PaneSupervisor::new(
            Arc::clone(&runner),
            pane_config(),
            RestartPolicy::default(),
            bus,
            cancel.clone(),
        );
        let handle = supervisor.start();

        // Enough virtual time for probe, backoff and respawn.
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.join.await.expect("join");

        let respawns = respawns.lock().unwrap();
        assert_eq!(respawns.len(), 1, "exactly one respawn");
        let args = &respawns[0];
        assert!(args.contains(&"-k".to_string()));
        assert_eq!(args.last().unwrap(), "panemux-panel --role input");
        assert_eq!(*handle.state.lock().unwrap(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_gives_up_and_emits_alert() {
        let respawns = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(ScriptedPane {
            // Permanently dead.
            probes: Mutex::new(VecDeque::from(["1\t100"])),
            respawns: Arc::clone(&respawns),
        });

        let bus = Arc::new(EventBus::new(16));
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        bus.subscribe("watcher", "controller", tx);
        while rx.try_recv().is_ok() {}

        let cancel = CancellationToken::new();
        let policy = RestartPolicy {
            max_consecutive_failures: 3,
            ..RestartPolicy::default()
        };
        let supervisor = PaneSupervisor::new(
            Arc::clone(&runner),
            pane_config(),
            policy,
            Arc::clone(&bus),
            cancel.clone(),
        );
        let handle = supervisor.start();

        tokio::time::timeout(Duration::from_secs(600), handle.join)
            .await
            .expect("supervisor terminates by itself")
            .expect("join");
        assert_eq!(handle.state.lock().unwrap().clone(), SupervisorState::Failed);

        let mut saw_alert = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == StateEventType::PaneAlert {
                assert_eq!(event.data["role"], "input");
                assert_eq!(event.data["consecutive_failures"], 3);
                saw_alert = true;
            }
        }
        assert!(saw_alert, "pane_alert event emitted");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_supervisor() {
        let runner = Arc::new(ScriptedPane {
            probes: Mutex::new(VecDeque::from(["0\t100"])),
            respawns: Arc::new(Mutex::new(Vec::new())),
        });
        let cancel = CancellationToken::new();
        let supervisor = PaneSupervisor::new(
            Arc::clone(&runner),
            pane_config(),
            RestartPolicy::default(),
            Arc::new(EventBus::new(16)),
            cancel.clone(),
        );
        let handle = supervisor.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.join)
            .await
            .expect("prompt exit")
            .expect("join");
        assert_eq!(*handle.state.lock().unwrap(), SupervisorState::Stopped);
    }

    // ── Environment refresh ─────────────────────────────────────

    #[tokio::test]
    async fn refresh_skips_dead_pane() {
        struct DeadPane;
        impl TmuxCommandRunner for DeadPane {
            async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
                assert_eq!(args[0], "display-message");
                Ok("1\t100".into())
            }
        }
        let respawned = refresh_environment(
            &DeadPane,
            &pane_config(),
            "PANEMUX_SOCKET",
            "/tmp/p.sock",
        )
        .await
        .expect("ok");
        assert!(!respawned);
    }

    #[tokio::test]
    async fn refresh_matches_current_process_environment() {
        // Probe reports our own pid. Pick a variable that was present at
        // exec time (the environ snapshot does not reflect later set_var
        // calls) and expect no respawn when the value matches.
        let own_env = match panemux_tmux::pane::read_pane_environment(std::process::id()) {
            Ok(env) if !env.is_empty() => env,
            _ => return, // environ not inspectable here; nothing to assert
        };
        let (key, value) = own_env.into_iter().next().expect("non-empty");

        struct SelfPane;
        impl TmuxCommandRunner for SelfPane {
            async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
                match args[0] {
                    "display-message" => Ok(format!("0\t{}", std::process::id())),
                    "respawn-pane" => panic!("must not respawn on matching env"),
                    other => panic!("unexpected command: {other}"),
                }
            }
        }
        let respawned = refresh_environment(&SelfPane, &pane_config(), &key, &value)
            .await
            .expect("ok");
        assert!(!respawned);
    }

    #[tokio::test]
    async fn refresh_respawns_on_socket_mismatch() {
        let respawns = Arc::new(Mutex::new(Vec::new()));
        struct StalePane {
            respawns: Arc<Mutex<Vec<Vec<String>>>>,
        }
        impl TmuxCommandRunner for StalePane {
            async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
                match args[0] {
                    "display-message" => Ok(format!("0\t{}", std::process::id())),
                    "respawn-pane" => {
                        self.respawns
                            .lock()
                            .unwrap()
                            .push(args.iter().map(|s| s.to_string()).collect());
                        Ok(String::new())
                    }
                    other => panic!("unexpected command: {other}"),
                }
            }
        }
        // Our own environ does not contain this variable at this value.
        let respawned = refresh_environment(
            &StalePane {
                respawns: Arc::clone(&respawns),
            },
            &pane_config(),
            "PANEMUX_SOCKET_NOT_SET",
            "/tmp/other.sock",
        )
        .await
        .expect("ok");
        assert!(respawned);
        assert_eq!(respawns.lock().unwrap().len(), 1);
    }
}
