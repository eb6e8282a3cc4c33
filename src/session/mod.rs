//! Per-client network sessions

pub mod directory;
pub mod link;
pub mod manager;
pub mod queue;

pub use directory::{SessionDirectory, SessionRoute};
pub use link::SessionLink;
pub use queue::ProcessedSequences;
pub use manager::{ReconnectError, Session, SessionConfig, SessionEvent, SessionManager, SessionStats};

use serde::Serialize;

/// Session identifier, unique per process. Four bytes on the wire.
pub type SessionId = u32;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport up, not yet placed in the simulation
    Connecting,
    Active,
    /// No recent commands; entity idles
    Stale,
    /// Long silence; entity parked and excluded from collision and damage
    Spectating,
    /// Transport gone; resumable within the grace period
    Disconnected,
}
