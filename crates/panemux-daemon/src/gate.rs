//! Policy checks on privileged IPC operations.
//!
//! Every privileged frame routes through here with the peer credentials the
//! server captured at accept time. Denials become `AUTH_FAILED` error frames
//! and never count as successes in the metrics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use panemux_core::SessionOwnership;

/// Peer identity extracted from the socket at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

/// Gated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Shutdown,
    ReloadLayout,
    Status,
    ListClients,
    Ping,
    StateMutation,
    StateRead,
}

/// Who may perform an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// The session owner's uid only.
    Owner,
    /// The owner's uid or any peer in the owner's group.
    OwnerGroup,
    /// Anyone the socket's filesystem permissions let in.
    Any,
    /// An explicit uid allowlist (the owner is always included).
    Uids(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateDenied {
    #[error("operation {operation:?} denied for uid {uid}")]
    NotPermitted { operation: Operation, uid: u32 },
    #[error("cleanup shutdown refused: {clients} clients attached (use force to override)")]
    ClientsAttached { clients: usize },
}

/// The permission gate: one policy per operation, owner-checked against the
/// immutable ownership record captured at startup.
pub struct PermissionGate {
    ownership: SessionOwnership,
    policies: HashMap<Operation, Policy>,
}

impl PermissionGate {
    pub fn new(ownership: SessionOwnership) -> Self {
        let mut policies = HashMap::new();
        policies.insert(Operation::Shutdown, Policy::Owner);
        policies.insert(Operation::ReloadLayout, Policy::Owner);
        policies.insert(Operation::Status, Policy::Any);
        policies.insert(Operation::ListClients, Policy::Any);
        policies.insert(Operation::Ping, Policy::Any);
        policies.insert(Operation::StateMutation, Policy::Owner);
        policies.insert(Operation::StateRead, Policy::Any);
        Self { ownership, policies }
    }

    /// Override the policy for one operation.
    pub fn set_policy(&mut self, operation: Operation, policy: Policy) {
        self.policies.insert(operation, policy);
    }

    pub fn ownership(&self) -> &SessionOwnership {
        &self.ownership
    }

    /// Check `peer` against the policy for `operation`.
    pub fn check(&self, operation: Operation, peer: &PeerCredentials) -> Result<(), GateDenied> {
        let policy = self.policies.get(&operation).unwrap_or(&Policy::Owner);
        let allowed = match policy {
            Policy::Owner => self.ownership.is_owner(peer.uid),
            Policy::OwnerGroup => {
                self.ownership.is_owner(peer.uid) || self.ownership.is_owner_group(peer.gid)
            }
            Policy::Any => true,
            Policy::Uids(uids) => {
                self.ownership.is_owner(peer.uid) || uids.contains(&peer.uid)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(GateDenied::NotPermitted {
                operation,
                uid: peer.uid,
            })
        }
    }

    /// Shutdown carries an extra rule: a cleanup shutdown with more than one
    /// attached client is refused unless the explicit override flag is set.
    pub fn check_shutdown(
        &self,
        peer: &PeerCredentials,
        cleanup: bool,
        attached_clients: usize,
        force: bool,
    ) -> Result<(), GateDenied> {
        self.check(Operation::Shutdown, peer)?;
        if cleanup && attached_clients > 1 && !force {
            return Err(GateDenied::ClientsAttached {
                clients: attached_clients,
            });
        }
        Ok(())
    }
}
