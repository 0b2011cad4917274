//! The panemux orchestrator daemon.
//!
//! A long-lived process that owns one tmux session, supervises one panel
//! process per pane, and coordinates versioned shared state across those
//! panels over a Unix-socket IPC bus. The [`orchestrator`] module composes
//! everything; the remaining modules are the individual subsystems.

pub mod bus;
pub mod client;
pub mod clients;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod gate;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod socket_check;
pub mod supervisor;
pub mod watcher;
