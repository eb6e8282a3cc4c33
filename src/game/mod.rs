//! Game simulation modules

pub mod combat;
pub mod delta;
pub mod entity;
pub mod lag_comp;
pub mod r#match;
pub mod physics;
pub mod providers;
pub mod roster;
pub mod rules;
pub mod snapshot;
pub mod validator;

pub use entity::{EntityId, EntityState, FieldId, FieldValue, Vec2};
pub use r#match::{EndReason, GameMatch, MatchControl, MatchHandle, MatchRegistry, MatchServices, MatchSummary};
pub use roster::{MatchRoster, RosterEntry};
pub use rules::{MatchMode, MatchOutcome, TeamId};
pub use snapshot::{Snapshot, SnapshotStore};

use crate::error::Severity;
use crate::session::SessionId;
use crate::util::time::Tick;

use self::combat::WeaponKind;
use self::delta::DeltaError;
use self::providers::ProviderError;
use self::snapshot::SnapshotError;

/// Command payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Displacement for this tick, in world units
    Move { displacement: Vec2 },
    /// Hit-scan shot. `target` is the client's belief and only informational.
    Fire {
        weapon: WeaponKind,
        direction: Vec2,
        claimed_damage: f32,
        target: Option<EntityId>,
    },
}

/// Independent input channels; the tick loop takes at most one command per
/// channel per session per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionChannel {
    Movement,
    Fire,
}

impl Action {
    pub fn channel(&self) -> ActionChannel {
        match self {
            Action::Move { .. } => ActionChannel::Movement,
            Action::Fire { .. } => ActionChannel::Fire,
        }
    }
}

/// Client input event, stamped with its originating session on receipt
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub session: SessionId,
    pub sequence: u32,
    /// Client's estimate of the server tick when the input was produced
    pub client_tick: Tick,
    pub action: Action,
    pub received_at_ms: u64,
}

/// Errors that can stop a match
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("snapshot store: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("delta codec: {0}")]
    Delta(#[from] DeltaError),

    #[error("collaborator: {0}")]
    Provider(#[from] ProviderError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl MatchError {
    pub fn severity(&self) -> Severity {
        match self {
            MatchError::Snapshot(e) => e.severity(),
            MatchError::Delta(e) => e.severity(),
            MatchError::Provider(e) => e.severity(),
            MatchError::Invariant(_) => Severity::Fatal,
        }
    }
}
