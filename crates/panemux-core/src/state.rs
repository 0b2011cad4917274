//! Versioned application state shared across panels.
//!
//! The coordinator owns the single authoritative value; panels only ever see
//! clones delivered through the event bus or explicit state requests. The
//! mutation helpers here are purely structural: version stamping happens in
//! exactly one place, the coordinator's commit path, so the version advances
//! by one per accepted update.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Optimistic-concurrency stamp carried by [`SharedAppState`].
///
/// `source` is the panel id of the last accepted mutation (`"init"` for a
/// freshly created state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersion {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Completed,
    Error,
}

/// One conversation session as seen by every panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub is_active: bool,
}

impl SessionEntry {
    /// Convenience constructor stamping both timestamps with `now`.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            is_active: false,
        }
    }
}

/// One message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: String,
    pub session_id: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Structured sub-parts (tool calls, attachments); opaque to the daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<serde_json::Value>>,
}

/// State of the input panel's edit buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    #[serde(default)]
    pub buffer: String,
    #[serde(default)]
    pub cursor_position: usize,
    #[serde(default)]
    pub selection_start: usize,
    #[serde(default)]
    pub selection_end: usize,
    pub mode: String,
    #[serde(default)]
    pub history: Vec<String>,
    /// -1 when not browsing history.
    pub history_index: i64,
}

impl Default for InputState {
    fn default() -> Self {
        Self {
            buffer: String::new(),
            cursor_position: 0,
            selection_start: 0,
            selection_end: 0,
            mode: "normal".into(),
            history: Vec::new(),
            history_index: -1,
        }
    }
}

/// The single coherent record coordinated across all panels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedAppState {
    pub version: StateVersion,

    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
    #[serde(default)]
    pub current_session_id: String,

    #[serde(default)]
    pub messages: Vec<MessageEntry>,
    /// Copy of the most recently added message, regardless of session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_message: Option<MessageEntry>,

    #[serde(default)]
    pub input: InputState,

    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub agent_model: HashMap<String, String>,

    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub update_count: u64,
}

impl SharedAppState {
    /// Fresh state at version 1 with source `"init"`.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: StateVersion {
                version: 1,
                timestamp: now,
                source: "init".into(),
            },
            sessions: Vec::new(),
            current_session_id: String::new(),
            messages: Vec::new(),
            current_message: None,
            input: InputState::default(),
            theme: "default".into(),
            provider: String::new(),
            model: String::new(),
            agent: String::new(),
            agent_model: HashMap::new(),
            last_update: now,
            update_count: 0,
        }
    }

    /// Insert a session, replacing any existing entry with the same id.
    pub fn upsert_session(&mut self, session: SessionEntry) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
    }

    /// Remove a session by id. Clears the current-session selection when it
    /// pointed at the removed entry. Returns whether an entry was removed.
    pub fn remove_session(&mut self, session_id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != session_id);
        if self.sessions.len() == before {
            return false;
        }
        if self.current_session_id == session_id {
            self.current_session_id.clear();
        }
        true
    }

    /// Select a session. Selecting an id that is not present silently clears
    /// the selection so the current-session invariant holds by construction.
    pub fn select_session(&mut self, session_id: &str) {
        if self.sessions.iter().any(|s| s.id == session_id) {
            self.current_session_id = session_id.to_string();
        } else {
            self.current_session_id.clear();
        }
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionEntry> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut SessionEntry> {
        self.sessions.iter_mut().find(|s| s.id == session_id)
    }

    /// Messages belonging to the currently selected session.
    pub fn current_messages(&self) -> Vec<&MessageEntry> {
        self.messages
            .iter()
            .filter(|m| m.session_id == self.current_session_id)
            .collect()
    }

    /// Check the structural invariants the repository and coordinator rely on.
    pub fn validate(&self) -> Result<(), StateValidationError> {
        if self.version.version == 0 {
            return Err(StateValidationError::NonPositiveVersion);
        }
        let mut seen = std::collections::HashSet::new();
        for session in &self.sessions {
            if session.id.is_empty() {
                return Err(StateValidationError::EmptySessionId);
            }
            if !seen.insert(session.id.as_str()) {
                return Err(StateValidationError::DuplicateSessionId(
                    session.id.clone(),
                ));
            }
        }
        if !self.current_session_id.is_empty()
            && !seen.contains(self.current_session_id.as_str())
        {
            return Err(StateValidationError::UnknownCurrentSession(
                self.current_session_id.clone(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedAppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural invariant violation found by [`SharedAppState::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateValidationError {
    #[error("state version must be positive")]
    NonPositiveVersion,
    #[error("session id cannot be empty")]
    EmptySessionId,
    #[error("duplicate session id: {0}")]
    DuplicateSessionId(String),
    #[error("current_session_id references unknown session: {0}")]
    UnknownCurrentSession(String),
}
