//! Property tests over the coordinator's update discipline: strict version
//! monotonicity, source attribution, structural invariants after arbitrary
//! accepted sequences, and resolver completion under concurrent conflicts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use panemux_core::{
    MessageEntry, MessageKind, MessageStatus, SessionEntry, StateUpdate, UpdatePayload,
};
use panemux_daemon::bus::EventBus;
use panemux_daemon::conflict::{ConflictConfig, ConflictStrategy};
use panemux_daemon::coordinator::{CoordinatorConfig, StateCoordinator};
use panemux_daemon::repository::{FileRepository, RepositoryConfig};

/// Abstract operation; concretized against the live state so session and
/// message ids are never reused.
#[derive(Debug, Clone)]
enum Op {
    AddSession,
    SelectKnown(u8),
    SelectGhost,
    DeleteSession(u8),
    AddMessage(u8),
    DeleteMessage(u8),
    ClearMessages(u8),
    Theme(String),
    Model,
    Agent,
    Input(String, u8),
    Cursor(u8),
    UiAction,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::AddSession),
        2 => any::<u8>().prop_map(Op::SelectKnown),
        1 => Just(Op::SelectGhost),
        1 => any::<u8>().prop_map(Op::DeleteSession),
        3 => any::<u8>().prop_map(Op::AddMessage),
        1 => any::<u8>().prop_map(Op::DeleteMessage),
        1 => any::<u8>().prop_map(Op::ClearMessages),
        1 => ".{0,12}".prop_map(Op::Theme),
        1 => Just(Op::Model),
        1 => Just(Op::Agent),
        1 => (".{0,20}", any::<u8>()).prop_map(|(b, c)| Op::Input(b, c)),
        1 => any::<u8>().prop_map(Op::Cursor),
        1 => Just(Op::UiAction),
    ]
}

fn build_coordinator(dir: &std::path::Path) -> Arc<StateCoordinator> {
    let repository = Arc::new(FileRepository::new(RepositoryConfig::new(
        dir.join("state/prop.json"),
    )));
    let bus = Arc::new(EventBus::new(64));
    let coordinator = StateCoordinator::new(repository, bus, CoordinatorConfig::default());
    coordinator.initialize().expect("initialize");
    coordinator
}

/// Turn an abstract op into a payload against the current state. Session and
/// message ids come from monotone counters so deleted ids never return.
fn concretize(
    op: &Op,
    coordinator: &StateCoordinator,
    next_session: &mut u32,
    next_message: &mut u32,
) -> UpdatePayload {
    let state = coordinator.state();
    let pick_session = |selector: u8| -> Option<String> {
        if state.sessions.is_empty() {
            None
        } else {
            Some(state.sessions[selector as usize % state.sessions.len()].id.clone())
        }
    };

    match op {
        Op::AddSession => {
            let id = format!("s{}", *next_session);
            *next_session += 1;
            UpdatePayload::SessionAdded {
                session: SessionEntry::new(id, "generated"),
            }
        }
        Op::SelectKnown(selector) => UpdatePayload::SessionChanged {
            session_id: pick_session(*selector).unwrap_or_else(|| "ghost".into()),
        },
        Op::SelectGhost => UpdatePayload::SessionChanged {
            session_id: "ghost".into(),
        },
        Op::DeleteSession(selector) => UpdatePayload::SessionDeleted {
            session_id: pick_session(*selector).unwrap_or_else(|| "ghost".into()),
        },
        Op::AddMessage(selector) => match pick_session(*selector) {
            Some(session_id) => {
                let id = format!("m{}", *next_message);
                *next_message += 1;
                UpdatePayload::MessageAdded {
                    message: MessageEntry {
                        id,
                        session_id,
                        kind: MessageKind::User,
                        content: "generated".into(),
                        timestamp: Utc::now(),
                        status: MessageStatus::Completed,
                        parts: None,
                    },
                }
            }
            // No sessions yet: degrade to a harmless scalar update.
            None => UpdatePayload::ThemeChanged {
                theme: "fallback".into(),
            },
        },
        Op::DeleteMessage(selector) => {
            let message_id = if state.messages.is_empty() {
                "ghost".into()
            } else {
                state.messages[*selector as usize % state.messages.len()].id.clone()
            };
            UpdatePayload::MessageDeleted { message_id }
        }
        Op::ClearMessages(selector) => UpdatePayload::MessagesCleared {
            session_id: pick_session(*selector).unwrap_or_else(|| "ghost".into()),
        },
        Op::Theme(theme) => UpdatePayload::ThemeChanged {
            theme: theme.clone(),
        },
        Op::Model => UpdatePayload::ModelChanged {
            provider: "prov".into(),
            model: "model".into(),
        },
        Op::Agent => UpdatePayload::AgentChanged {
            agent: "build".into(),
        },
        Op::Input(buffer, cursor) => UpdatePayload::InputUpdated {
            buffer: buffer.clone(),
            cursor_position: *cursor as usize,
            selection_start: 0,
            selection_end: 0,
            mode: String::new(),
        },
        Op::Cursor(position) => UpdatePayload::CursorMoved {
            position: *position as usize,
            selection_start: 0,
            selection_end: 0,
        },
        Op::UiAction => UpdatePayload::UiActionTriggered {
            action: "generated".into(),
            data: None,
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// For any accepted sequence: the version advances by exactly one per
    /// update with the submitter recorded, and every structural invariant
    /// holds in the final state.
    #[test]
    fn accepted_sequences_preserve_invariants(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let tmp = tempfile::tempdir().expect("tempdir");
        let coordinator = build_coordinator(tmp.path());

        let mut next_session = 0u32;
        let mut next_message = 0u32;
        for (i, op) in ops.iter().enumerate() {
            let payload = concretize(op, &coordinator, &mut next_session, &mut next_message);
            let before = coordinator.current_version();
            let source = format!("panel-{}", i % 3);
            let applied = rt
                .block_on(coordinator.apply_update(StateUpdate::new(
                    before,
                    source.as_str(),
                    payload,
                )))
                .expect("matching expected_version is always accepted");

            prop_assert_eq!(applied.version, before + 1);
            let state = coordinator.state();
            prop_assert_eq!(state.version.version, before + 1);
            prop_assert_eq!(state.version.source, source);
        }

        let state = coordinator.state();
        prop_assert!(state.validate().is_ok());
        prop_assert_eq!(state.update_count, ops.len() as u64);

        // Per-session message count matches the message table.
        for session in &state.sessions {
            let actual = state
                .messages
                .iter()
                .filter(|m| m.session_id == session.id)
                .count() as u64;
            prop_assert_eq!(
                session.message_count,
                actual,
                "count mismatch for session {}",
                &session.id
            );
        }

        // Round-trip: serialize then deserialize yields an equal state.
        let json = serde_json::to_string(&state).unwrap();
        let decoded: panemux_core::SharedAppState = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(decoded, state);
    }

    /// Idempotence: a second SessionDeleted or MessagesCleared leaves every
    /// non-version field exactly as the first left it.
    #[test]
    fn delete_and_clear_are_idempotent(extra_messages in 1usize..5) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let tmp = tempfile::tempdir().expect("tempdir");
        let coordinator = build_coordinator(tmp.path());

        rt.block_on(async {
            let mut version = coordinator.current_version();
            for payload in [
                UpdatePayload::SessionAdded { session: SessionEntry::new("s0", "a") },
                UpdatePayload::SessionAdded { session: SessionEntry::new("s1", "b") },
            ] {
                coordinator
                    .apply_update(StateUpdate::new(version, "seed", payload))
                    .await
                    .expect("seed");
                version += 1;
            }
            for i in 0..extra_messages {
                coordinator
                    .apply_update(StateUpdate::new(
                        version,
                        "seed",
                        UpdatePayload::MessageAdded {
                            message: MessageEntry {
                                id: format!("m{i}"),
                                session_id: "s0".into(),
                                kind: MessageKind::User,
                                content: String::new(),
                                timestamp: Utc::now(),
                                status: MessageStatus::Completed,
                                parts: None,
                            },
                        },
                    ))
                    .await
                    .expect("seed message");
                version += 1;
            }
        });

        let apply_twice = |payload: UpdatePayload| {
            let first = {
                let version = coordinator.current_version();
                rt.block_on(coordinator.apply_update(StateUpdate::new(
                    version,
                    "prop",
                    payload.clone(),
                )))
                .expect("first application");
                coordinator.state()
            };
            let second = {
                let version = coordinator.current_version();
                rt.block_on(coordinator.apply_update(StateUpdate::new(version, "prop", payload)))
                    .expect("second application");
                coordinator.state()
            };
            (first, second)
        };

        let (first, second) = apply_twice(UpdatePayload::MessagesCleared {
            session_id: "s0".into(),
        });
        prop_assert_eq!(&first.messages, &second.messages);
        prop_assert_eq!(&first.sessions, &second.sessions);

        let (first, second) = apply_twice(UpdatePayload::SessionDeleted {
            session_id: "s1".into(),
        });
        prop_assert_eq!(&first.sessions, &second.sessions);
        prop_assert_eq!(&first.current_session_id, &second.current_session_id);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// K concurrent submissions against the same starting version all get
    /// accepted under `version_based`, in some serialization order, and the
    /// resolver never deadlocks.
    #[test]
    fn concurrent_conflicts_all_resolve(k in 2u64..7) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let tmp = tempfile::tempdir().expect("tempdir");

        let repository = Arc::new(FileRepository::new(RepositoryConfig::new(
            tmp.path().join("state/prop.json"),
        )));
        let bus = Arc::new(EventBus::new(64));
        let coordinator = StateCoordinator::new(
            repository,
            bus,
            CoordinatorConfig {
                conflict: ConflictConfig {
                    strategy: ConflictStrategy::VersionBased,
                    max_retries: 64,
                    retry_backoff: Duration::from_millis(1),
                },
                ..CoordinatorConfig::default()
            },
        );
        coordinator.initialize().expect("initialize");

        let accepted = rt.block_on(async {
            let mut handles = Vec::new();
            for i in 0..k {
                let c = Arc::clone(&coordinator);
                handles.push(tokio::spawn(async move {
                    c.apply_update(StateUpdate::new(
                        1,
                        format!("panel-{i}"),
                        UpdatePayload::SessionAdded {
                            session: SessionEntry::new(format!("s{i}"), "race"),
                        },
                    ))
                    .await
                }));
            }

            let mut accepted = 0u64;
            for handle in handles {
                let result = tokio::time::timeout(Duration::from_secs(10), handle)
                    .await
                    .expect("no deadlock")
                    .expect("join");
                if result.is_ok() {
                    accepted += 1;
                }
            }
            accepted
        });

        prop_assert_eq!(accepted, k, "exactly K accepted updates");
        prop_assert_eq!(coordinator.current_version(), 1 + k);
        prop_assert_eq!(coordinator.state().sessions.len() as u64, k);
    }
}
