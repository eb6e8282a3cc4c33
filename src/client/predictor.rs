//! Client-side prediction and server reconciliation
//!
//! ```text
//! Input:      [1] [2] [3] [4] [5]
//! Predicted:  [P1][P2][P3][P4][P5]
//! Server:     snapshot, last_command_seq = 2
//! Reconcile:  own entity := server state, replay [3, 4, 5]
//! ```
//!
//! The predictor also tracks the snapshot history the server diffs against,
//! answers every applied snapshot with an Ack and feeds remote entities to the
//! [`Interpolator`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Severity;
use crate::game::combat::WeaponKind;
use crate::game::delta::{self, Delta, DeltaError};
use crate::game::entity::{EntityId, EntityState, Vec2};
use crate::game::physics::PhysicsSystem;
use crate::game::providers::LevelGeometry;
use crate::game::{Action, Snapshot};
use crate::session::SessionId;
use crate::util::time::{Tick, TickRate};
use crate::ws::protocol::{Hello, Message, MessageType, ProtocolError, Welcome, PROTOCOL_VERSION};

use super::interpolation::{Interpolator, RenderedEntity};

/// Client-side failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error("delta baseline tick {0} is no longer held")]
    MissingBaseline(Tick),

    #[error("{0:?} received before Welcome")]
    NotJoined(MessageType),

    #[error("server closed the session: {0}")]
    Disconnected(String),
}

impl ClientError {
    pub fn severity(&self) -> Severity {
        match self {
            ClientError::Protocol(e) => e.severity(),
            ClientError::Delta(e) => e.severity(),
            ClientError::MissingBaseline(_) => Severity::Transient,
            ClientError::NotJoined(_) | ClientError::Disconnected(_) => Severity::Protocol,
        }
    }
}

/// Client tunables. Movement limits must match the server's.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tick_rate: TickRate,
    pub max_speed: f32,
    /// Requested in Hello; the server's Welcome has the final say
    pub interp_delay_ms: u16,
    pub max_extrapolation_ms: u64,
    /// Received snapshots kept as delta baselines
    pub baseline_history: usize,
    /// Unacknowledged inputs kept for replay
    pub input_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_rate: TickRate::default(),
            max_speed: 24.0,
            interp_delay_ms: 100,
            max_extrapolation_ms: 250,
            baseline_history: 64,
            input_capacity: 128,
        }
    }
}

/// Movement input awaiting server confirmation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingInput {
    pub sequence: u32,
    pub displacement: Vec2,
}

/// How the last authoritative state compared to the prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    /// Prediction matched after replay
    Confirmed,
    /// Prediction was off by `error` world units and was corrected
    Corrected { error: f32 },
}

/// Prediction state for one connection
pub struct ClientPredictor {
    config: ClientConfig,
    geometry: Arc<dyn LevelGeometry>,
    player_id: uuid::Uuid,
    session: Option<SessionId>,
    entity: Option<EntityId>,
    next_sequence: u32,
    /// Local estimate of the tick the server is simulating
    estimated_tick: Tick,
    pending: VecDeque<PendingInput>,
    history: BTreeMap<Tick, Snapshot>,
    predicted: Option<EntityState>,
    last_reconciliation: Option<Reconciliation>,
    corrections: u64,
    rtt_ms: Option<f64>,
    heartbeat_sequence: u32,
    interpolator: Interpolator,
}

impl ClientPredictor {
    pub fn new(player_id: uuid::Uuid, config: ClientConfig, geometry: Arc<dyn LevelGeometry>) -> Self {
        let interpolator = Interpolator::new(u64::from(config.interp_delay_ms), config.max_extrapolation_ms);
        Self {
            config,
            geometry,
            player_id,
            session: None,
            entity: None,
            next_sequence: 1,
            estimated_tick: 0,
            pending: VecDeque::new(),
            history: BTreeMap::new(),
            predicted: None,
            last_reconciliation: None,
            corrections: 0,
            rtt_ms: None,
            heartbeat_sequence: 0,
            interpolator,
        }
    }

    /// Opening message; pass the previous session to resume it
    pub fn hello(&self, resume_session: Option<SessionId>) -> Message {
        Message::Hello(Hello {
            version: PROTOCOL_VERSION,
            player_id: self.player_id,
            interp_delay_ms: self.config.interp_delay_ms,
            resume_session,
        })
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    pub fn estimated_tick(&self) -> Tick {
        self.estimated_tick
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingInput> {
        self.pending.iter()
    }

    /// Own entity as currently predicted
    pub fn predicted(&self) -> Option<&EntityState> {
        self.predicted.as_ref()
    }

    /// Newest authoritative snapshot
    pub fn authoritative(&self) -> Option<&Snapshot> {
        self.history.values().next_back()
    }

    pub fn last_reconciliation(&self) -> Option<Reconciliation> {
        self.last_reconciliation
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_ms
    }

    pub fn interpolator(&self) -> &Interpolator {
        &self.interpolator
    }

    /// Start a new session. Sequences restart because the server resets its
    /// per-session bookkeeping on every Welcome.
    pub fn on_welcome(&mut self, welcome: &Welcome) {
        self.session = Some(welcome.session);
        self.entity = Some(welcome.entity);
        self.estimated_tick = welcome.tick;
        self.next_sequence = 1;
        self.pending.clear();
        self.history.clear();
        self.predicted = None;
        self.interpolator.reset();
        self.interpolator.set_delay(u64::from(welcome.interp_delay_ms));

        debug!(
            session_id = welcome.session,
            entity_id = welcome.entity,
            tick = welcome.tick,
            "Joined match"
        );
    }

    /// Apply a movement input locally right away and return the command to send.
    /// The displacement is limited the same way the server limits it.
    pub fn apply_local(&mut self, displacement: Vec2) -> Message {
        let max_step = self.config.max_speed * self.config.tick_rate.delta();
        let displacement = displacement.clamp_length(max_step);

        if let Some(entity) = self.predicted.as_mut() {
            if entity.is_targetable() {
                PhysicsSystem::apply_displacement(
                    entity,
                    displacement,
                    self.config.tick_rate.delta(),
                    self.geometry.as_ref(),
                );
            }
        }

        let sequence = self.take_sequence();
        self.pending.push_back(PendingInput { sequence, displacement });
        while self.pending.len() > self.config.input_capacity {
            self.pending.pop_front();
        }
        self.command(sequence, Action::Move { displacement })
    }

    /// Fire is never predicted; hits are the server's call
    pub fn fire(
        &mut self,
        weapon: WeaponKind,
        direction: Vec2,
        claimed_damage: f32,
        target: Option<EntityId>,
    ) -> Message {
        let sequence = self.take_sequence();
        self.command(
            sequence,
            Action::Fire {
                weapon,
                direction,
                claimed_damage,
                target,
            },
        )
    }

    /// Client-originated heartbeat; the echo yields an RTT sample
    pub fn heartbeat(&mut self, now_ms: u64) -> Message {
        self.heartbeat_sequence = self.heartbeat_sequence.wrapping_add(1);
        Message::Heartbeat {
            sequence: self.heartbeat_sequence,
            origin_ms: now_ms,
            echo: false,
        }
    }

    /// Handle one server frame received at local time `now_ms`. Returns the
    /// reply to send back, if any.
    pub fn on_frame(&mut self, frame: &[u8], now_ms: u64) -> Result<Option<Message>, ClientError> {
        let message = Message::decode(frame)?;
        self.on_message(message, now_ms)
    }

    pub fn on_message(&mut self, message: Message, now_ms: u64) -> Result<Option<Message>, ClientError> {
        match message {
            Message::Welcome(welcome) => {
                self.on_welcome(&welcome);
                Ok(None)
            }
            Message::FullSnapshot {
                snapshot,
                last_command_seq,
            } => {
                self.require_session(MessageType::FullSnapshot)?;
                Ok(self.accept(snapshot, last_command_seq, now_ms))
            }
            Message::Delta {
                delta,
                last_command_seq,
            } => {
                self.require_session(MessageType::Delta)?;
                let snapshot = self.rebuild(&delta)?;
                Ok(self.accept(snapshot, last_command_seq, now_ms))
            }
            Message::Heartbeat {
                sequence,
                origin_ms,
                echo: false,
            } => Ok(Some(Message::Heartbeat {
                sequence,
                origin_ms,
                echo: true,
            })),
            Message::Heartbeat {
                origin_ms,
                echo: true,
                ..
            } => {
                let sample = now_ms.saturating_sub(origin_ms) as f64;
                self.rtt_ms = Some(match self.rtt_ms {
                    Some(rtt) => rtt + (sample - rtt) * 0.125,
                    None => sample,
                });
                Ok(None)
            }
            Message::Disconnect { reason } => {
                self.session = None;
                Err(ClientError::Disconnected(reason))
            }
            other => Err(ProtocolError::Unexpected(other.message_type()).into()),
        }
    }

    /// Everything to draw at local time `now_ms`: remote entities from the
    /// interpolation buffer plus the local player's prediction
    pub fn render(&self, now_ms: u64) -> Vec<RenderedEntity> {
        let mut rendered = self.interpolator.sample(now_ms, self.entity);
        if let Some(own) = &self.predicted {
            rendered.push(RenderedEntity::from_state(own, true));
        }
        rendered
    }

    fn require_session(&self, message_type: MessageType) -> Result<(), ClientError> {
        match self.session {
            Some(_) => Ok(()),
            None => Err(ClientError::NotJoined(message_type)),
        }
    }

    fn take_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    fn command(&self, sequence: u32, action: Action) -> Message {
        let client_tick = self.estimated_tick;
        Message::Command {
            sequence,
            client_tick,
            action,
        }
    }

    fn rebuild(&self, delta: &Delta) -> Result<Snapshot, ClientError> {
        let baseline = self
            .history
            .get(&delta.baseline_tick)
            .ok_or(ClientError::MissingBaseline(delta.baseline_tick))?;
        Ok(delta::decode(baseline, delta)?)
    }

    /// Record an authoritative snapshot, reconcile and acknowledge it
    fn accept(&mut self, snapshot: Snapshot, last_command_seq: u32, now_ms: u64) -> Option<Message> {
        let tick = snapshot.tick;
        if self.history.keys().next_back().is_some_and(|latest| tick <= *latest) {
            // Late duplicate of something already applied; still fine to re-ack
            return Some(Message::Ack { tick });
        }

        self.estimated_tick = self.estimated_tick.max(tick.wrapping_add(1));
        self.reconcile(&snapshot, last_command_seq);
        self.interpolator.push(snapshot.clone(), now_ms);

        self.history.insert(tick, snapshot);
        while self.history.len() > self.config.baseline_history.max(1) {
            self.history.pop_first();
        }
        Some(Message::Ack { tick })
    }

    /// Restart the prediction from the server's state and replay every input
    /// the server has not processed yet
    fn reconcile(&mut self, snapshot: &Snapshot, last_command_seq: u32) {
        while self
            .pending
            .front()
            .is_some_and(|input| input.sequence <= last_command_seq)
        {
            self.pending.pop_front();
        }

        let Some(own) = self.entity.and_then(|id| snapshot.entity(id)) else {
            self.predicted = None;
            return;
        };

        let before = self.predicted.map(|p| p.position);
        let mut replayed = *own;
        if replayed.is_targetable() {
            for input in &self.pending {
                PhysicsSystem::apply_displacement(
                    &mut replayed,
                    input.displacement,
                    self.config.tick_rate.delta(),
                    self.geometry.as_ref(),
                );
            }
        }

        let error = before.map_or(0.0, |p| p.distance(replayed.position));
        self.last_reconciliation = Some(if error > CORRECTION_EPSILON {
            self.corrections += 1;
            if error > LARGE_CORRECTION {
                warn!(error, tick = snapshot.tick, "Large prediction correction");
            }
            Reconciliation::Corrected { error }
        } else {
            Reconciliation::Confirmed
        });
        self.predicted = Some(replayed);
    }
}

/// Differences at or below this are quantization noise
const CORRECTION_EPSILON: f32 = 0.05;

const LARGE_CORRECTION: f32 = 5.0;
