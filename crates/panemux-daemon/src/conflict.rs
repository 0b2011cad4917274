//! Version-conflict resolution strategies.
//!
//! The coordinator's locked apply path releases its lock before calling
//! [`ConflictResolver::resolve`]; the resolver retries exclusively through
//! [`crate::coordinator::StateCoordinator::apply_direct`], which reacquires
//! the lock and never re-enters the resolver. That one-way flow is what
//! keeps the pair deadlock- and recursion-free.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use panemux_core::StateUpdate;

use crate::coordinator::{AppliedUpdate, CoordinatorError, StateCoordinator};

/// Upper bound on last-write-wins restamp attempts. Each failed attempt
/// implies another writer made progress, so this only trips under
/// pathological contention.
const LAST_WRITE_WINS_CAP: u32 = 64;

/// How a version conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Restamp the update to the current version and apply.
    LastWriteWins,
    /// Retry with a fresh expected version, bounded attempts and backoff.
    VersionBased,
    /// Surface the conflict to the submitting panel.
    ManualResolve,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LastWriteWins => "last_write_wins",
            Self::VersionBased => "version_based",
            Self::ManualResolve => "manual_resolve",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConflictConfig {
    pub strategy: ConflictStrategy,
    /// Retry budget for `version_based`.
    pub max_retries: u32,
    /// Base backoff between `version_based` retries; grows linearly,
    /// capped at 10x.
    pub retry_backoff: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::VersionBased,
            max_retries: 5,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// Counters exposed through the coordinator's metrics surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConflictStats {
    pub total_conflicts: u64,
    pub resolved: u64,
    pub failed: u64,
    pub retries: u64,
}

pub struct ConflictResolver {
    config: Mutex<ConflictConfig>,
    stats: Mutex<ConflictStats>,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            config: Mutex::new(config),
            stats: Mutex::new(ConflictStats::default()),
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).strategy
    }

    pub fn set_strategy(&self, strategy: ConflictStrategy) {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .strategy = strategy;
    }

    pub fn stats(&self) -> ConflictStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolve a conflict for `update`. Called by the coordinator with its
    /// state lock released; retries go through `apply_direct` only.
    pub async fn resolve(
        &self,
        coordinator: &StateCoordinator,
        update: StateUpdate,
    ) -> Result<AppliedUpdate, CoordinatorError> {
        let config = self
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.total_conflicts += 1;
        }

        let outcome = match config.strategy {
            ConflictStrategy::ManualResolve => Err(CoordinatorError::VersionConflict {
                expected: update.expected_version,
                current: coordinator.current_version(),
            }),
            ConflictStrategy::LastWriteWins => {
                self.resolve_last_write_wins(coordinator, &update).await
            }
            ConflictStrategy::VersionBased => {
                self.resolve_version_based(coordinator, &update, &config).await
            }
        };

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match &outcome {
            Ok(_) => stats.resolved += 1,
            Err(_) => stats.failed += 1,
        }
        outcome
    }

    async fn resolve_last_write_wins(
        &self,
        coordinator: &StateCoordinator,
        update: &StateUpdate,
    ) -> Result<AppliedUpdate, CoordinatorError> {
        for attempt in 0..LAST_WRITE_WINS_CAP {
            let current = coordinator.current_version();
            match coordinator.apply_direct(update.with_expected_version(current)) {
                Ok(applied) => {
                    debug!(
                        update_id = %update.id,
                        attempt,
                        version = applied.version,
                        "conflict resolved by last-write-wins"
                    );
                    return Ok(applied);
                }
                Err(CoordinatorError::VersionConflict { .. }) => {
                    let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                    stats.retries += 1;
                }
                Err(e) => return Err(e),
            }
            tokio::task::yield_now().await;
        }
        Err(CoordinatorError::TooManyRetries {
            attempts: LAST_WRITE_WINS_CAP,
        })
    }

    async fn resolve_version_based(
        &self,
        coordinator: &StateCoordinator,
        update: &StateUpdate,
        config: &ConflictConfig,
    ) -> Result<AppliedUpdate, CoordinatorError> {
        for attempt in 0..config.max_retries {
            let current = coordinator.current_version();
            match coordinator.apply_direct(update.with_expected_version(current)) {
                Ok(applied) => {
                    debug!(
                        update_id = %update.id,
                        attempt,
                        version = applied.version,
                        "conflict resolved by version-based retry"
                    );
                    return Ok(applied);
                }
                Err(CoordinatorError::VersionConflict { .. }) => {
                    {
                        let mut stats =
                            self.stats.lock().unwrap_or_else(|e| e.into_inner());
                        stats.retries += 1;
                    }
                    let backoff = config
                        .retry_backoff
                        .saturating_mul((attempt + 1).min(10));
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoordinatorError::TooManyRetries {
            attempts: config.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConflictStrategy::LastWriteWins).unwrap(),
            "\"last_write_wins\""
        );
        assert_eq!(ConflictStrategy::VersionBased.to_string(), "version_based");
        assert_eq!(ConflictStrategy::ManualResolve.to_string(), "manual_resolve");
    }

    #[test]
    fn default_config_is_version_based() {
        let config = ConflictConfig::default();
        assert_eq!(config.strategy, ConflictStrategy::VersionBased);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn set_strategy_switches() {
        let resolver = ConflictResolver::new(ConflictConfig::default());
        resolver.set_strategy(ConflictStrategy::ManualResolve);
        assert_eq!(resolver.strategy(), ConflictStrategy::ManualResolve);
    }
}
