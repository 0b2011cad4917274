//! Session ownership record used for authorization decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the daemon process that owns a tmux session.
///
/// Captured once at startup and immutable afterwards; the permission gate
/// compares IPC peer credentials against this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOwnership {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
}

impl SessionOwnership {
    /// Capture the effective identity of the current process.
    pub fn capture() -> Self {
        let uid = nix::unistd::Uid::effective();
        let gid = nix::unistd::Gid::effective();
        let username = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".into());
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".into());
        Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            username,
            hostname,
            started_at: Utc::now(),
        }
    }

    /// Whether `uid` is the owning user.
    pub fn is_owner(&self, uid: u32) -> bool {
        self.uid == uid
    }

    /// Whether `gid` matches the owning group.
    pub fn is_owner_group(&self, gid: u32) -> bool {
        self.gid == gid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_reports_current_process_identity() {
        let ownership = SessionOwnership::capture();
        assert_eq!(ownership.uid, nix::unistd::Uid::effective().as_raw());
        assert_eq!(ownership.gid, nix::unistd::Gid::effective().as_raw());
        assert!(!ownership.hostname.is_empty());
        assert!(ownership.is_owner(ownership.uid));
        assert!(!ownership.is_owner(ownership.uid.wrapping_add(1)));
    }

    #[test]
    fn ownership_round_trips() {
        let ownership = SessionOwnership::capture();
        let json = serde_json::to_string(&ownership).unwrap();
        let decoded: SessionOwnership = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, ownership);
    }
}
