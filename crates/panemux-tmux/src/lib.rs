//! tmux backend for the panemux orchestrator.
//!
//! Every interaction with tmux goes through a short-lived subprocess bounded
//! by a per-call timeout. The [`executor::TmuxCommandRunner`] trait keeps the
//! higher layers mock-injectable; the parsers are pure functions over tmux's
//! tab-delimited format output.

pub mod error;
pub mod executor;
pub mod layout;
pub mod pane;
pub mod session;

pub use error::TmuxError;
pub use executor::{TmuxCommandRunner, TmuxExecutor};
pub use pane::{PaneHealth, PaneProbe};
