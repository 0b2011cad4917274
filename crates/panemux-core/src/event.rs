//! State change events fanned out to panels by the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::SharedAppState;
use crate::update::{StateUpdate, UpdatePayload};

/// Source panel id used for events the daemon synthesizes itself.
pub const SYSTEM_SOURCE: &str = "system";

/// The closed set of event types panels can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEventType {
    SessionChanged,
    SessionAdded,
    SessionDeleted,
    SessionUpdated,
    MessageAdded,
    MessageUpdated,
    MessageDeleted,
    MessagesCleared,
    InputUpdated,
    CursorMoved,
    ThemeChanged,
    ModelChanged,
    AgentChanged,
    UiActionTriggered,
    StateSync,
    PanelConnected,
    PanelDisconnected,
    /// A pane supervisor gave up restarting its panel process.
    PaneAlert,
}

/// A state change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: StateEventType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub version: u64,
    pub source_panel: String,
    pub timestamp: DateTime<Utc>,
}

impl StateEvent {
    pub fn new(
        event_type: StateEventType,
        data: serde_json::Value,
        version: u64,
        source_panel: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: now.format("%Y%m%d%H%M%S%.6f").to_string(),
            event_type,
            data,
            version,
            source_panel: source_panel.into(),
            timestamp: now,
        }
    }

    /// Build the event broadcast after `update` was accepted at `version`.
    ///
    /// The event data is the bare payload object, without the tag envelope.
    pub fn from_update(update: &StateUpdate, version: u64) -> Self {
        let tagged = serde_json::to_value(&update.payload).unwrap_or(serde_json::Value::Null);
        let data = tagged
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Self::new(
            event_type_for(&update.payload),
            data,
            version,
            update.source_panel.clone(),
        )
    }
}

fn event_type_for(payload: &UpdatePayload) -> StateEventType {
    match payload {
        UpdatePayload::SessionChanged { .. } => StateEventType::SessionChanged,
        UpdatePayload::SessionAdded { .. } => StateEventType::SessionAdded,
        UpdatePayload::SessionUpdated { .. } => StateEventType::SessionUpdated,
        UpdatePayload::SessionDeleted { .. } => StateEventType::SessionDeleted,
        UpdatePayload::MessageAdded { .. } => StateEventType::MessageAdded,
        UpdatePayload::MessageUpdated { .. } => StateEventType::MessageUpdated,
        UpdatePayload::MessageDeleted { .. } => StateEventType::MessageDeleted,
        UpdatePayload::MessagesCleared { .. } => StateEventType::MessagesCleared,
        UpdatePayload::InputUpdated { .. } => StateEventType::InputUpdated,
        UpdatePayload::CursorMoved { .. } => StateEventType::CursorMoved,
        UpdatePayload::ThemeChanged { .. } => StateEventType::ThemeChanged,
        UpdatePayload::ModelChanged { .. } => StateEventType::ModelChanged,
        UpdatePayload::AgentChanged { .. } => StateEventType::AgentChanged,
        UpdatePayload::UiActionTriggered { .. } => StateEventType::UiActionTriggered,
    }
}

/// Data carried by `panel_connected` / `panel_disconnected` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelConnectionPayload {
    pub panel_id: String,
    pub panel_type: String,
}

/// Data carried by `state_sync` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncPayload {
    pub state: SharedAppState,
}
