//! Single-writer state coordination: versioned updates, conflict routing,
//! persistence scheduling and event emission.
//!
//! Lock discipline: `try_commit` does all mutation under the state mutex
//! with no await points inside; `apply_update` drops the lock before the
//! conflict resolver runs, and the resolver re-enters only through
//! [`StateCoordinator::apply_direct`]. Accepted updates enqueue a state
//! clone onto a bounded save channel drained by a background worker; a
//! periodic ticker flushes anything the channel dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use panemux_core::event::SYSTEM_SOURCE;
use panemux_core::{
    SharedAppState, StateEvent, StateEventType, StateSyncPayload, StateUpdate, UpdatePayload,
};

use crate::bus::EventBus;
use crate::conflict::{ConflictConfig, ConflictResolver, ConflictStats};
use crate::repository::{FileRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("version conflict: expected {expected}, current {current}")]
    VersionConflict { expected: u64, current: u64 },

    #[error("conflict resolution exhausted after {attempts} attempts")]
    TooManyRetries { attempts: u32 },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of an accepted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedUpdate {
    /// State version after the update.
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub auto_save_interval: Duration,
    pub save_queue_depth: usize,
    pub conflict: ConflictConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            auto_save_interval: Duration::from_secs(5),
            save_queue_depth: 64,
            conflict: ConflictConfig::default(),
        }
    }
}

/// Counters exposed through the `status` control surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorMetrics {
    pub total_updates: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    pub updates_by_type: HashMap<String, u64>,
    pub total_saves: u64,
    pub successful_saves: u64,
    pub failed_saves: u64,
    pub dropped_saves: u64,
    pub last_update_at: Option<DateTime<Utc>>,
    pub last_save_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: SharedAppState,
}

/// Owner of the authoritative shared state.
pub struct StateCoordinator {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
    repository: Arc<FileRepository>,
    resolver: ConflictResolver,
    save_tx: mpsc::Sender<SharedAppState>,
    save_rx: Mutex<Option<mpsc::Receiver<SharedAppState>>>,
    metrics: Mutex<CoordinatorMetrics>,
    dirty: AtomicBool,
    auto_save_interval: Duration,
}

impl StateCoordinator {
    pub fn new(
        repository: Arc<FileRepository>,
        bus: Arc<EventBus>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let (save_tx, save_rx) = mpsc::channel(config.save_queue_depth);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: SharedAppState::new(),
            }),
            bus,
            repository,
            resolver: ConflictResolver::new(config.conflict),
            save_tx,
            save_rx: Mutex::new(Some(save_rx)),
            metrics: Mutex::new(CoordinatorMetrics::default()),
            dirty: AtomicBool::new(false),
            auto_save_interval: config.auto_save_interval,
        })
    }

    /// Load persisted state or fall back to a fresh one.
    pub fn initialize(&self) -> Result<(), CoordinatorError> {
        self.repository.initialize()?;
        match self.repository.load() {
            Ok(state) => {
                info!(version = state.version.version, "loaded persisted state");
                let mut inner = self.lock_inner();
                inner.state = state;
            }
            Err(RepositoryError::NotFound(_)) => {
                info!("no persisted state, starting fresh");
                self.save_now()?;
            }
            Err(e) => {
                error!(error = %e, "state unrecoverable, starting fresh");
                {
                    let mut inner = self.lock_inner();
                    inner.state = SharedAppState::new();
                }
                self.save_now()?;
            }
        }
        Ok(())
    }

    /// Spawn the save worker and the auto-save ticker.
    pub fn spawn_workers(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let save_rx = self
            .save_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut save_rx) = save_rx {
            let this = Arc::clone(self);
            let save_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        queued = save_rx.recv() => {
                            match queued {
                                Some(state) => this.persist(&state),
                                None => break,
                            }
                        }
                        _ = save_cancel.cancelled() => {
                            debug!("save worker: cancellation requested");
                            break;
                        }
                    }
                }
            }));
        }

        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.auto_save_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if this.dirty.load(Ordering::SeqCst) {
                            if let Err(e) = this.save_now() {
                                warn!(error = %e, "auto-save failed");
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("auto-save ticker: cancellation requested");
                        break;
                    }
                }
            }
        }));

        handles
    }

    /// Apply an update, routing version mismatches to the conflict resolver.
    pub async fn apply_update(
        &self,
        update: StateUpdate,
    ) -> Result<AppliedUpdate, CoordinatorError> {
        let kind = update.payload.kind();
        let started = Instant::now();

        let result = match self.try_commit(&update) {
            Ok(applied) => {
                self.queue_save();
                Ok(applied)
            }
            Err(CoordinatorError::VersionConflict { expected, current }) => {
                debug!(
                    update_id = %update.id,
                    expected,
                    current,
                    "version conflict, invoking resolver"
                );
                // The state lock is released here; the resolver retries
                // through apply_direct only.
                self.resolver.resolve(self, update).await
            }
            Err(e) => Err(e),
        };

        self.record_update(kind, result.is_ok(), started.elapsed());
        result
    }

    /// No-resolve entry point used by the conflict resolver's retry paths.
    /// A version mismatch here surfaces as a plain conflict error.
    pub(crate) fn apply_direct(
        &self,
        update: StateUpdate,
    ) -> Result<AppliedUpdate, CoordinatorError> {
        let applied = self.try_commit(&update)?;
        self.queue_save();
        Ok(applied)
    }

    /// Persist and broadcast a full `state_sync` event.
    pub fn full_sync(&self) -> Result<(), CoordinatorError> {
        self.save_now()?;
        self.broadcast_sync();
        Ok(())
    }

    /// Replace the state with a fresh instance, persist, and announce it.
    pub fn reset(&self) -> Result<(), CoordinatorError> {
        {
            let mut inner = self.lock_inner();
            inner.state = SharedAppState::new();
        }
        self.save_now()?;
        self.broadcast_sync();
        Ok(())
    }

    /// Clone of the current state.
    pub fn state(&self) -> SharedAppState {
        self.lock_inner().state.clone()
    }

    pub fn current_version(&self) -> u64 {
        self.lock_inner().state.version.version
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn conflict_stats(&self) -> ConflictStats {
        self.resolver.stats()
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Synchronous save of the current state. Used by auto-save and the
    /// shutdown path.
    pub fn save_now(&self) -> Result<(), CoordinatorError> {
        let state = self.state();
        let result = self.repository.save(&state);
        self.record_save(&result);
        result.map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check the expected version and commit under the state mutex.
    /// No await points while the lock is held.
    fn try_commit(&self, update: &StateUpdate) -> Result<AppliedUpdate, CoordinatorError> {
        let version = {
            let mut inner = self.lock_inner();
            let current = inner.state.version.version;
            if current != update.expected_version {
                return Err(CoordinatorError::VersionConflict {
                    expected: update.expected_version,
                    current,
                });
            }

            apply_payload(&mut inner.state, &update.payload);

            let now = Utc::now();
            inner.state.version.version += 1;
            inner.state.version.timestamp = now;
            inner.state.version.source = update.source_panel.clone();
            inner.state.last_update = now;
            inner.state.update_count += 1;
            inner.state.version.version
        };

        self.dirty.store(true, Ordering::SeqCst);
        self.bus.broadcast(StateEvent::from_update(update, version));
        Ok(AppliedUpdate { version })
    }

    /// Enqueue a post-update snapshot for the save worker. A full channel
    /// drops this save; the next accepted update or the auto-save ticker
    /// subsumes it.
    fn queue_save(&self) {
        let state = self.state();
        if let Err(mpsc::error::TrySendError::Full(_)) = self.save_tx.try_send(state) {
            warn!("save queue full, dropping save");
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.dropped_saves += 1;
        }
    }

    fn persist(&self, state: &SharedAppState) {
        let result = self.repository.save(state);
        self.record_save(&result);
    }

    fn record_save(&self, result: &Result<(), RepositoryError>) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.total_saves += 1;
        match result {
            Ok(()) => {
                metrics.successful_saves += 1;
                metrics.last_save_at = Some(Utc::now());
                self.dirty.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                metrics.failed_saves += 1;
                warn!(error = %e, "state save failed, keeping in-memory state");
            }
        }
    }

    fn broadcast_sync(&self) {
        let state = self.state();
        let version = state.version.version;
        let payload = StateSyncPayload { state };
        let event = StateEvent::new(
            StateEventType::StateSync,
            serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
            version,
            SYSTEM_SOURCE,
        );
        self.bus.broadcast(event);
    }

    fn record_update(&self, kind: &str, success: bool, _elapsed: Duration) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.total_updates += 1;
        *metrics.updates_by_type.entry(kind.to_string()).or_insert(0) += 1;
        metrics.last_update_at = Some(Utc::now());
        if success {
            metrics.successful_updates += 1;
        } else {
            metrics.failed_updates += 1;
        }
    }
}

/// Apply one payload to the state. Pure structural mutation; version
/// stamping happens in the caller.
fn apply_payload(state: &mut SharedAppState, payload: &UpdatePayload) {
    match payload {
        UpdatePayload::SessionAdded { session } => {
            state.upsert_session(session.clone());
        }
        UpdatePayload::SessionChanged { session_id } => {
            state.select_session(session_id);
        }
        UpdatePayload::SessionUpdated {
            session_id,
            title,
            is_active,
        } => {
            if let Some(session) = state.session_mut(session_id) {
                if !title.is_empty() {
                    session.title = title.clone();
                }
                session.is_active = *is_active;
                session.updated_at = Utc::now();
            }
        }
        UpdatePayload::SessionDeleted { session_id } => {
            state.remove_session(session_id);
        }
        UpdatePayload::MessageAdded { message } => {
            if let Some(session) = state.session_mut(&message.session_id) {
                session.message_count += 1;
            }
            state.messages.push(message.clone());
            state.current_message = Some(message.clone());
        }
        UpdatePayload::MessageUpdated {
            message_id,
            content,
            status,
            parts,
        } => {
            if let Some(message) = state.messages.iter_mut().find(|m| m.id == *message_id) {
                if !content.is_empty() {
                    message.content = content.clone();
                }
                if let Some(status) = status {
                    message.status = *status;
                }
                if parts.is_some() {
                    message.parts = parts.clone();
                }
            }
        }
        UpdatePayload::MessageDeleted { message_id } => {
            if let Some(pos) = state.messages.iter().position(|m| m.id == *message_id) {
                let session_id = state.messages[pos].session_id.clone();
                state.messages.remove(pos);
                if let Some(session) = state.session_mut(&session_id) {
                    session.message_count = session.message_count.saturating_sub(1);
                }
            }
        }
        UpdatePayload::MessagesCleared { session_id } => {
            let before = state.messages.len();
            state.messages.retain(|m| m.session_id != *session_id);
            let removed = before - state.messages.len();
            if let Some(session) = state.session_mut(session_id) {
                session.message_count = 0;
            }
            debug!(session_id = %session_id, removed, "cleared session messages");
        }
        UpdatePayload::InputUpdated {
            buffer,
            cursor_position,
            selection_start,
            selection_end,
            mode,
        } => {
            state.input.buffer = buffer.clone();
            state.input.cursor_position = *cursor_position;
            state.input.selection_start = *selection_start;
            state.input.selection_end = *selection_end;
            if !mode.is_empty() {
                state.input.mode = mode.clone();
            }
        }
        UpdatePayload::CursorMoved {
            position,
            selection_start,
            selection_end,
        } => {
            state.input.cursor_position = *position;
            state.input.selection_start = *selection_start;
            state.input.selection_end = *selection_end;
        }
        UpdatePayload::ThemeChanged { theme } => {
            state.theme = theme.clone();
        }
        UpdatePayload::ModelChanged { provider, model } => {
            state.provider = provider.clone();
            state.model = model.clone();
        }
        UpdatePayload::AgentChanged { agent } => {
            state.agent = agent.clone();
        }
        UpdatePayload::UiActionTriggered { .. } => {
            // No state mutation; the version bump alone carries the event.
        }
    }
}
