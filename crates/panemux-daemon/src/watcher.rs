//! Detects disappearance of the owned tmux session.
//!
//! Two consecutive non-existence observations trigger a non-cleanup daemon
//! shutdown; transient probe errors are logged, never counted.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panemux_tmux::session::has_session;
use panemux_tmux::TmuxCommandRunner;

use crate::orchestrator::ShutdownRequest;

/// Consecutive misses before the watcher gives the session up for dead.
const MISSES_BEFORE_SHUTDOWN: u32 = 2;

pub struct SessionWatcher<R> {
    runner: R,
    session: String,
    interval: Duration,
    shutdown_tx: mpsc::Sender<ShutdownRequest>,
    cancel: CancellationToken,
}

impl<R: TmuxCommandRunner + 'static> SessionWatcher<R> {
    pub fn new(
        runner: R,
        session: impl Into<String>,
        shutdown_tx: mpsc::Sender<ShutdownRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            session: session.into(),
            interval: Duration::from_secs(1),
            shutdown_tx,
            cancel,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut misses = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match has_session(&self.runner, &self.session).await {
                        Ok(true) => misses = 0,
                        Ok(false) => {
                            misses += 1;
                            debug!(session = %self.session, misses, "session not found");
                            if misses >= MISSES_BEFORE_SHUTDOWN {
                                info!(
                                    session = %self.session,
                                    "tmux session vanished, requesting shutdown"
                                );
                                let _ = self
                                    .shutdown_tx
                                    .send(ShutdownRequest {
                                        cleanup: false,
                                        reason: "tmux session vanished".into(),
                                    })
                                    .await;
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(session = %self.session, error = %e, "session probe failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    debug!("session watcher cancelled");
                    return;
                }
            }
        }
    }
}
