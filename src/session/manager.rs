//! Session lifecycle inside a match
//!
//! The manager is owned by the tick loop and evaluated once per tick; the
//! connection tasks only ever touch a session's [`SessionLink`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Severity;
use crate::game::{EntityId, EntityState, TeamId};
use crate::util::time::Tick;

use super::link::SessionLink;
use super::queue::ProcessedSequences;
use super::{SessionId, SessionState};

/// Session timing thresholds
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Silence after which an active session goes stale
    pub stale_after_ms: u64,
    /// Silence after which the session becomes a spectator
    pub spectate_after_ms: u64,
    /// How long a disconnected session can be resumed
    pub reconnect_grace_ms: u64,
    /// Interpolation delay advertised to clients
    pub interp_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 500,
            spectate_after_ms: 5_000,
            reconnect_grace_ms: 10_000,
            interp_delay_ms: 100,
        }
    }
}

/// Resumption failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    #[error("session {0} is unknown to this match")]
    UnknownSession(SessionId),

    #[error("session {0} belongs to another player")]
    PlayerMismatch(SessionId),

    #[error("reconnect grace period for session {0} has expired")]
    GraceExpired(SessionId),
}

impl ReconnectError {
    pub fn severity(&self) -> Severity {
        Severity::Protocol
    }
}

/// Per-session gameplay counters for the match summary
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    pub shots: u32,
    pub hits: u32,
    pub headshots: u32,
    pub kills: u32,
    pub deaths: u32,
    pub damage_dealt: f32,
}

/// One player's session record
pub struct Session {
    pub id: SessionId,
    pub player_id: Uuid,
    pub team: TeamId,
    pub link: Arc<SessionLink>,
    pub state: SessionState,
    pub entity: Option<EntityId>,
    /// Entity state kept while disconnected so a reconnect can restore it
    pub retained_entity: Option<EntityState>,
    /// Next replication must be a full snapshot
    pub needs_full_sync: bool,
    /// Tick of the last full snapshot sent
    pub last_full_tick: Option<Tick>,
    /// Command sequences the tick loop has consumed
    pub processed: ProcessedSequences,
    pub disconnected_at_ms: Option<u64>,
    pub stats: SessionStats,
}

impl Session {
    /// Baseline the next delta is encoded against: the client's ack, or the
    /// last full snapshot when that is newer. The transport is ordered and
    /// reliable, so a full snapshot that left the egress queue will have been
    /// received first; see [`Session::forget_shed_baseline`].
    pub fn baseline_tick(&self) -> Option<Tick> {
        match (self.link.acked_tick(), self.last_full_tick) {
            (Some(acked), Some(full)) => Some(acked.max(full)),
            (acked, full) => acked.or(full),
        }
    }

    /// Drop the unacknowledged full-snapshot baseline if the egress queue has
    /// shed a frame since the last check. Returns true when it was dropped.
    pub fn forget_shed_baseline(&mut self) -> bool {
        if !self.link.take_egress_shed() {
            return false;
        }
        debug!(session_id = self.id, last_full_tick = ?self.last_full_tick, "Egress shed a frame, baseline falls back to the ack");
        self.last_full_tick = None;
        true
    }

    pub fn is_replicating(&self) -> bool {
        matches!(
            self.state,
            SessionState::Active | SessionState::Stale | SessionState::Spectating
        )
    }

    fn rtt_ms(&self) -> f64 {
        self.link.rtt_ms()
    }
}

/// State changes produced by one evaluation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEvent {
    Transition {
        session: SessionId,
        from: SessionState,
        to: SessionState,
    },
    /// Grace period ran out; the record has been removed
    Expired {
        session: SessionId,
        player_id: Uuid,
        team: TeamId,
        stats: SessionStats,
    },
}

/// All sessions of one match
pub struct SessionManager {
    config: SessionConfig,
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a session that has just completed its transport handshake
    pub fn insert(&mut self, id: SessionId, player_id: Uuid, team: TeamId, link: Arc<SessionLink>) {
        self.sessions.insert(
            id,
            Session {
                id,
                player_id,
                team,
                link,
                state: SessionState::Connecting,
                entity: None,
                retained_entity: None,
                needs_full_sync: true,
                last_full_tick: None,
                processed: ProcessedSequences::default(),
                disconnected_at_ms: None,
                stats: SessionStats::default(),
            },
        );
    }

    /// `Connecting -> Active` once the welcome has been queued
    pub fn activate(&mut self, id: SessionId, entity: EntityId) -> Option<SessionEvent> {
        let session = self.sessions.get_mut(&id)?;
        let from = session.state;
        session.state = SessionState::Active;
        session.entity = Some(entity);
        session.needs_full_sync = true;
        info!(session_id = id, player_id = %session.player_id, entity_id = entity, "Session active");
        Some(SessionEvent::Transition {
            session: id,
            from,
            to: SessionState::Active,
        })
    }

    /// Attach a fresh connection to an existing session. The old link is closed
    /// and the client is resynchronized with a full snapshot.
    pub fn reconnect(
        &mut self,
        id: SessionId,
        player_id: Uuid,
        link: Arc<SessionLink>,
        now_ms: u64,
    ) -> Result<SessionEvent, ReconnectError> {
        let grace = self.config.reconnect_grace_ms;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ReconnectError::UnknownSession(id))?;
        if session.player_id != player_id {
            return Err(ReconnectError::PlayerMismatch(id));
        }
        if let Some(at) = session.disconnected_at_ms {
            if now_ms.saturating_sub(at) > grace {
                return Err(ReconnectError::GraceExpired(id));
            }
        }

        session.link.close();
        link.touch(now_ms);
        session.link = link;
        session.disconnected_at_ms = None;
        session.needs_full_sync = true;
        session.last_full_tick = None;
        session.processed = ProcessedSequences::default();

        let from = session.state;
        session.state = SessionState::Active;
        info!(session_id = id, player_id = %player_id, from = ?from, "Session resumed");
        Ok(SessionEvent::Transition {
            session: id,
            from,
            to: SessionState::Active,
        })
    }

    /// Explicit leave: same as a transport failure
    pub fn disconnect(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get(&id) {
            session.link.close();
        }
    }

    /// Apply timeouts and closed links. Called exactly once per tick.
    pub fn evaluate(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let mut expired = Vec::new();

        for session in self.sessions.values_mut() {
            let from = session.state;

            if from == SessionState::Disconnected {
                let since = session.disconnected_at_ms.unwrap_or(now_ms);
                if now_ms.saturating_sub(since) > self.config.reconnect_grace_ms {
                    expired.push(session.id);
                }
                continue;
            }

            if session.link.is_closed() {
                session.state = SessionState::Disconnected;
                session.disconnected_at_ms = Some(now_ms);
                info!(session_id = session.id, from = ?from, rtt_ms = session.rtt_ms(), "Session disconnected");
                events.push(SessionEvent::Transition {
                    session: session.id,
                    from,
                    to: SessionState::Disconnected,
                });
                continue;
            }

            if from == SessionState::Connecting {
                continue;
            }

            let silence = now_ms.saturating_sub(session.link.last_command_ms());
            let to = if silence >= self.config.spectate_after_ms {
                SessionState::Spectating
            } else if silence > self.config.stale_after_ms {
                match from {
                    SessionState::Spectating => SessionState::Spectating,
                    _ => SessionState::Stale,
                }
            } else {
                SessionState::Active
            };

            if to != from {
                if from == SessionState::Spectating && to == SessionState::Active {
                    session.needs_full_sync = true;
                }
                session.state = to;
                debug!(session_id = session.id, from = ?from, to = ?to, silence_ms = silence, "Session state changed");
                events.push(SessionEvent::Transition {
                    session: session.id,
                    from,
                    to,
                });
            }
        }

        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                info!(session_id = id, player_id = %session.player_id, "Reconnect grace expired, session dropped");
                events.push(SessionEvent::Expired {
                    session: id,
                    player_id: session.player_id,
                    team: session.team,
                    stats: session.stats,
                });
            }
        }

        events
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that still count toward keeping the match alive
    pub fn live_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state != SessionState::Disconnected)
            .count()
    }

    pub fn by_entity(&self, entity: EntityId) -> Option<&Session> {
        self.sessions.values().find(|s| s.entity == Some(entity))
    }

    pub fn by_player(&self, player_id: Uuid) -> Option<&Session> {
        self.sessions.values().find(|s| s.player_id == player_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::game::{Action, Command, Vec2};

    fn manager_with_session(now_ms: u64) -> (SessionManager, Arc<SessionLink>) {
        let mut manager = SessionManager::new(SessionConfig::default());
        let link = Arc::new(SessionLink::new(1, 8, 8, now_ms));
        manager.insert(1, Uuid::new_v4(), 0, link.clone());
        manager.activate(1, 100);
        (manager, link)
    }

    fn command_at(received_at_ms: u64) -> Command {
        Command {
            session: 1,
            sequence: 1,
            client_tick: 0,
            action: Action::Move { displacement: Vec2::ZERO },
            received_at_ms,
        }
    }

    fn state(manager: &SessionManager) -> SessionState {
        manager.get(1).unwrap().state
    }

    #[test]
    fn silence_walks_active_to_stale_to_spectating() {
        let (mut manager, _link) = manager_with_session(0);

        assert!(manager.evaluate(500).is_empty());
        assert_eq!(state(&manager), SessionState::Active);

        let events = manager.evaluate(600);
        assert_eq!(
            events,
            vec![SessionEvent::Transition {
                session: 1,
                from: SessionState::Active,
                to: SessionState::Stale
            }]
        );

        manager.evaluate(4_999);
        assert_eq!(state(&manager), SessionState::Stale);
        manager.evaluate(5_000);
        assert_eq!(state(&manager), SessionState::Spectating);
    }

    #[test]
    fn commands_restore_spectator_with_resync() {
        let (mut manager, link) = manager_with_session(0);
        manager.evaluate(6_000);
        manager.get_mut(1).unwrap().needs_full_sync = false;

        link.push_command(command_at(6_040));
        manager.evaluate(6_050);
        assert_eq!(state(&manager), SessionState::Active);
        assert!(manager.get(1).unwrap().needs_full_sync);
    }

    #[test]
    fn closed_link_disconnects_and_grace_expires() {
        let (mut manager, link) = manager_with_session(0);
        link.close();
        manager.evaluate(100);
        assert_eq!(state(&manager), SessionState::Disconnected);
        assert_eq!(manager.live_count(), 0);

        assert!(manager.evaluate(10_100).is_empty());
        let events = manager.evaluate(10_101);
        assert!(matches!(events.as_slice(), [SessionEvent::Expired { session: 1, .. }]));
        assert!(manager.get(1).is_none());
    }

    #[test]
    fn reconnect_within_grace_restores_active() {
        let (mut manager, link) = manager_with_session(0);
        let player = manager.get(1).unwrap().player_id;
        link.close();
        manager.evaluate(100);

        let fresh = Arc::new(SessionLink::new(1, 8, 8, 2_000));
        assert_eq!(
            manager.reconnect(1, Uuid::new_v4(), fresh.clone(), 2_000),
            Err(ReconnectError::PlayerMismatch(1))
        );
        manager.reconnect(1, player, fresh, 2_000).unwrap();

        let session = manager.get(1).unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert!(session.needs_full_sync);
        assert_eq!(session.baseline_tick(), None);
    }

    #[test]
    fn reconnect_after_grace_is_refused() {
        let (mut manager, link) = manager_with_session(0);
        let player = manager.get(1).unwrap().player_id;
        link.close();
        manager.evaluate(100);
        let fresh = Arc::new(SessionLink::new(1, 8, 8, 20_000));
        assert_eq!(
            manager.reconnect(1, player, fresh, 10_101),
            Err(ReconnectError::GraceExpired(1))
        );
    }

    #[test]
    fn baseline_prefers_newest_of_ack_and_full() {
        let (mut manager, link) = manager_with_session(0);
        manager.get_mut(1).unwrap().last_full_tick = Some(12);
        assert_eq!(manager.get(1).unwrap().baseline_tick(), Some(12));
        link.ack(15);
        assert_eq!(manager.get(1).unwrap().baseline_tick(), Some(15));
    }

    #[test]
    fn shed_egress_drops_unacked_full_baseline() {
        let (mut manager, link) = manager_with_session(0);
        link.ack(10);
        let session = manager.get_mut(1).unwrap();
        session.last_full_tick = Some(12);
        assert!(!session.forget_shed_baseline());
        assert_eq!(session.baseline_tick(), Some(12));

        // Egress holds 8 frames
        for _ in 0..9 {
            link.send(Bytes::from_static(b"frame"));
        }
        assert!(session.forget_shed_baseline());
        assert_eq!(session.baseline_tick(), Some(10));
    }
}
