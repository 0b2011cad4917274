//! Shared data model for the panemux orchestrator.
//!
//! Everything panels and the daemon exchange lives here: the versioned
//! application state, the typed update payloads that mutate it, the events
//! broadcast after each accepted mutation, and the session-ownership record
//! used for authorization. No IO in this crate.

pub mod event;
pub mod ownership;
pub mod state;
pub mod update;

pub use event::{PanelConnectionPayload, StateEvent, StateEventType, StateSyncPayload};
pub use ownership::SessionOwnership;
pub use state::{
    InputState, MessageEntry, MessageKind, MessageStatus, SessionEntry, SharedAppState,
    StateValidationError, StateVersion,
};
pub use update::{StateUpdate, UpdatePayload};
