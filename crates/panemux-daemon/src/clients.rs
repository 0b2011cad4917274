//! Tracks clients attached to the owned tmux session.
//!
//! Feeds the permission gate's multi-client check and the `status` surface.
//! Shutdown is driven from here only when `auto_shutdown_when_empty` is on
//! and zero clients have been observed for the whole grace period.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panemux_tmux::session::list_clients;
use panemux_tmux::TmuxCommandRunner;

use crate::orchestrator::ShutdownRequest;

/// Callback invoked when the attached-client count changes.
pub type OnClientChange = Box<dyn Fn(usize) + Send + Sync>;

/// Shared view of the tracker's latest observation.
#[derive(Clone, Default)]
pub struct ClientCounter {
    count: Arc<AtomicUsize>,
    last_check: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl ClientCounter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, count: usize) {
        self.count.store(count, Ordering::SeqCst);
        *self.last_check.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }
}

pub struct ClientTracker<R> {
    runner: R,
    session: String,
    interval: Duration,
    counter: ClientCounter,
    on_change: Option<OnClientChange>,
    /// When set, a sustained zero-client observation for this long requests
    /// a non-cleanup shutdown.
    empty_shutdown_grace: Option<Duration>,
    shutdown_tx: mpsc::Sender<ShutdownRequest>,
    cancel: CancellationToken,
}

impl<R: TmuxCommandRunner + 'static> ClientTracker<R> {
    pub fn new(
        runner: R,
        session: impl Into<String>,
        shutdown_tx: mpsc::Sender<ShutdownRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            session: session.into(),
            interval: Duration::from_secs(5),
            counter: ClientCounter::default(),
            on_change: None,
            empty_shutdown_grace: None,
            shutdown_tx,
            cancel,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_on_change(mut self, on_change: OnClientChange) -> Self {
        self.on_change = Some(on_change);
        self
    }

    #[must_use]
    pub fn with_empty_shutdown(mut self, grace: Duration) -> Self {
        self.empty_shutdown_grace = Some(grace);
        self
    }

    /// Shared counter handle; clone before starting the loop.
    pub fn counter(&self) -> ClientCounter {
        self.counter.clone()
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_count: Option<usize> = None;
        let mut empty_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let count = match list_clients(&self.runner, &self.session).await {
                        Ok(clients) => clients.len(),
                        Err(e) => {
                            warn!(session = %self.session, error = %e, "client poll failed");
                            continue;
                        }
                    };
                    self.counter.record(count);

                    if last_count != Some(count) {
                        debug!(session = %self.session, count, "attached client count changed");
                        if let Some(ref on_change) = self.on_change {
                            on_change(count);
                        }
                        last_count = Some(count);
                    }

                    if let Some(grace) = self.empty_shutdown_grace {
                        if count == 0 {
                            let since = *empty_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= grace {
                                info!(
                                    session = %self.session,
                                    "no clients attached for {:?}, requesting shutdown",
                                    grace
                                );
                                let _ = self
                                    .shutdown_tx
                                    .send(ShutdownRequest {
                                        cleanup: true,
                                        reason: "no attached clients".into(),
                                    })
                                    .await;
                                return;
                            }
                        } else {
                            empty_since = None;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    debug!("client tracker cancelled");
                    return;
                }
            }
        }
    }
}
