//! Typed state updates submitted by panels.
//!
//! An update carries the submitter's `expected_version` for optimistic
//! concurrency plus one payload out of a closed set. The adjacently tagged
//! representation keeps the wire shape stable: `{"type": "...", "payload":
//! {...}}` flattened into the update envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{MessageEntry, MessageStatus, SessionEntry};

/// The closed set of mutations a panel may request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UpdatePayload {
    SessionChanged {
        session_id: String,
    },
    SessionAdded {
        session: SessionEntry,
    },
    SessionUpdated {
        session_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        is_active: bool,
    },
    SessionDeleted {
        session_id: String,
    },
    MessageAdded {
        message: MessageEntry,
    },
    MessageUpdated {
        message_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        status: Option<MessageStatus>,
        #[serde(default)]
        parts: Option<Vec<serde_json::Value>>,
    },
    MessageDeleted {
        message_id: String,
    },
    MessagesCleared {
        session_id: String,
    },
    InputUpdated {
        #[serde(default)]
        buffer: String,
        #[serde(default)]
        cursor_position: usize,
        #[serde(default)]
        selection_start: usize,
        #[serde(default)]
        selection_end: usize,
        #[serde(default)]
        mode: String,
    },
    CursorMoved {
        position: usize,
        #[serde(default)]
        selection_start: usize,
        #[serde(default)]
        selection_end: usize,
    },
    ThemeChanged {
        theme: String,
    },
    ModelChanged {
        provider: String,
        model: String,
    },
    AgentChanged {
        agent: String,
    },
    /// Does not mutate state; the version bump acts as a broadcast vehicle.
    UiActionTriggered {
        action: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
}

impl UpdatePayload {
    /// Wire name of the payload variant, for logs and metrics keys.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionChanged { .. } => "session_changed",
            Self::SessionAdded { .. } => "session_added",
            Self::SessionUpdated { .. } => "session_updated",
            Self::SessionDeleted { .. } => "session_deleted",
            Self::MessageAdded { .. } => "message_added",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessagesCleared { .. } => "messages_cleared",
            Self::InputUpdated { .. } => "input_updated",
            Self::CursorMoved { .. } => "cursor_moved",
            Self::ThemeChanged { .. } => "theme_changed",
            Self::ModelChanged { .. } => "model_changed",
            Self::AgentChanged { .. } => "agent_changed",
            Self::UiActionTriggered { .. } => "ui_action_triggered",
        }
    }
}

/// An atomic state change request from one panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub id: String,
    pub expected_version: u64,
    pub source_panel: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: UpdatePayload,
}

impl StateUpdate {
    pub fn new(
        expected_version: u64,
        source_panel: impl Into<String>,
        payload: UpdatePayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("update_{}", now.timestamp_nanos_opt().unwrap_or_default()),
            expected_version,
            source_panel: source_panel.into(),
            timestamp: now,
            payload,
        }
    }

    /// Copy of this update restamped to a different expected version.
    /// Used by the conflict resolver's retry paths.
    pub fn with_expected_version(&self, expected_version: u64) -> Self {
        let mut update = self.clone();
        update.expected_version = expected_version;
        update
    }
}
