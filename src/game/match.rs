//! Match state and authoritative tick loop

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SimConfig;
use crate::error::Severity;
use crate::session::{
    ReconnectError, SessionEvent, SessionId, SessionLink, SessionManager, SessionState, SessionStats,
};
use crate::util::time::{unix_millis, Tick, Timer};
use crate::ws::protocol::{encode_delta, encode_disconnect, encode_full_snapshot, Message, Welcome};

use super::combat::{CombatSystem, HitResult, WeaponStats};
use super::delta::{self, Replication};
use super::entity::{flags, Archetype, EntityId, EntityState, Vec2};
use super::lag_comp::{HitScan, LagCompensator};
use super::physics::PhysicsSystem;
use super::providers::{EntityFactory, LevelGeometry};
use super::roster::MatchRoster;
use super::rules::{rules_for, MatchMode, MatchOutcome, MatchRules, ScoreEvent, TeamId};
use super::snapshot::{ReplicationStats, Snapshot, SnapshotStore};
use super::validator::{CommandValidator, SessionReport, Verdict, ZScorePolicy};
use super::{Action, Command, MatchError};

/// Events delivered to a match between ticks
pub enum MatchControl {
    /// A matched player's connection is ready
    Join {
        session: SessionId,
        player_id: Uuid,
        link: Arc<SessionLink>,
    },
    /// A dropped session is being resumed on a new connection
    Reconnect {
        session: SessionId,
        player_id: Uuid,
        link: Arc<SessionLink>,
        reply: oneshot::Sender<Result<(), ReconnectError>>,
    },
    /// Explicit leave
    Leave { session: SessionId },
    /// Stop the match at the next tick boundary
    End { reason: String },
}

/// The match task has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("match {0} is no longer running")]
pub struct MatchGone(pub Uuid);

/// Handle to communicate with a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub mode: MatchMode,
    control_tx: mpsc::Sender<MatchControl>,
    session_count: Arc<AtomicUsize>,
    current_tick: Arc<AtomicU32>,
}

impl MatchHandle {
    pub async fn send(&self, control: MatchControl) -> Result<(), MatchGone> {
        self.control_tx.send(control).await.map_err(|_| MatchGone(self.id))
    }

    /// Sessions that are not disconnected
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick.load(Ordering::Relaxed)
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_sessions(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().session_count())
            .sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a match stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    /// The mode's win or time condition was met
    Completed,
    /// Every session left, or nobody ever joined
    Abandoned,
    Requested(String),
    /// An internal invariant broke
    Fatal(String),
}

impl EndReason {
    fn disconnect_reason(&self) -> String {
        match self {
            EndReason::Completed => "match over".to_string(),
            EndReason::Abandoned => "match abandoned".to_string(),
            EndReason::Requested(reason) => format!("match ended: {reason}"),
            EndReason::Fatal(_) => "match terminated by server error".to_string(),
        }
    }
}

/// Per-session line of the match summary
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: SessionId,
    pub player_id: Uuid,
    pub team: TeamId,
    pub shots: u32,
    pub hits: u32,
    pub headshots: u32,
    pub kills: u32,
    pub deaths: u32,
    pub violations: u32,
    pub flagged: bool,
}

impl SessionSummary {
    fn new(session: SessionId, player_id: Uuid, team: TeamId, stats: SessionStats, report: SessionReport) -> Self {
        Self {
            session,
            player_id,
            team,
            shots: stats.shots,
            hits: stats.hits,
            headshots: stats.headshots,
            kills: stats.kills,
            deaths: stats.deaths,
            violations: report.violations,
            flagged: report.flagged,
        }
    }
}

/// Final report of a match, handed back to whoever spawned it
#[derive(Debug, Clone)]
pub struct MatchSummary {
    pub match_id: Uuid,
    pub roster: MatchRoster,
    pub ticks: Tick,
    pub outcome: MatchOutcome,
    pub end_reason: EndReason,
    pub scores: BTreeMap<TeamId, u32>,
    pub sessions: Vec<SessionSummary>,
    pub replication: ReplicationStats,
}

/// Collaborators a match calls out to
#[derive(Clone)]
pub struct MatchServices {
    pub geometry: Arc<dyn LevelGeometry>,
    pub factory: Arc<dyn EntityFactory>,
}

/// The authoritative game match
pub struct GameMatch {
    id: Uuid,
    config: Arc<SimConfig>,
    roster: MatchRoster,
    tick: Tick,
    entities: BTreeMap<EntityId, EntityState>,
    next_entity_id: EntityId,
    sessions: SessionManager,
    store: SnapshotStore,
    validator: CommandValidator,
    lag: LagCompensator,
    rules: Box<dyn MatchRules>,
    geometry: Arc<dyn LevelGeometry>,
    factory: Arc<dyn EntityFactory>,
    control_rx: mpsc::Receiver<MatchControl>,
    /// Dead entities and the tick they come back
    respawns: BTreeMap<EntityId, Tick>,
    replication: ReplicationStats,
    departed: Vec<SessionSummary>,
    rng: ChaCha8Rng,
    had_members: bool,
    end: Option<EndReason>,
    session_count: Arc<AtomicUsize>,
    current_tick: Arc<AtomicU32>,
}

impl GameMatch {
    /// Create a new match
    pub fn new(
        roster: MatchRoster,
        config: Arc<SimConfig>,
        services: MatchServices,
        seed: u64,
    ) -> (Self, MatchHandle) {
        let (control_tx, control_rx) = mpsc::channel(256);
        let session_count = Arc::new(AtomicUsize::new(0));
        let current_tick = Arc::new(AtomicU32::new(0));

        let handle = MatchHandle {
            id: roster.match_id,
            mode: roster.mode,
            control_tx,
            session_count: session_count.clone(),
            current_tick: current_tick.clone(),
        };

        let policy = ZScorePolicy {
            threshold: config.anomaly_z_threshold,
            ..ZScorePolicy::default()
        };

        let game_match = Self {
            id: roster.match_id,
            tick: 0,
            entities: BTreeMap::new(),
            next_entity_id: 1,
            sessions: SessionManager::new(config.session.clone()),
            store: SnapshotStore::new(config.snapshot_capacity),
            validator: CommandValidator::new(config.validator.clone(), Box::new(policy)),
            lag: LagCompensator::new(config.tick_rate),
            rules: rules_for(roster.mode, config.rules.clone()),
            geometry: services.geometry,
            factory: services.factory,
            control_rx,
            respawns: BTreeMap::new(),
            replication: ReplicationStats::default(),
            departed: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            had_members: false,
            end: None,
            session_count,
            current_tick,
            roster,
            config,
        };

        (game_match, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.store.latest()
    }

    /// Run the authoritative tick loop until the match ends
    pub async fn run(mut self) -> MatchSummary {
        info!(
            match_id = %self.id,
            mode = %self.roster.mode,
            players = self.roster.len(),
            tick_rate = self.config.tick_rate.ticks_per_second(),
            "Match started"
        );

        let budget = self.config.tick_rate.interval();
        let mut tick_interval = interval(budget);
        // A late tick delays the schedule instead of bursting to catch up
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick_interval.tick().await;
            let timer = Timer::new();

            match self.step(unix_millis()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.severity() == Severity::Fatal => {
                    error!(match_id = %self.id, tick = self.tick, error = %e, "Fatal error, terminating match");
                    self.end = Some(EndReason::Fatal(e.to_string()));
                    break;
                }
                Err(e) => {
                    warn!(match_id = %self.id, tick = self.tick, error = %e, severity = %e.severity(), "Tick error");
                }
            }

            let elapsed = timer.elapsed();
            if elapsed > budget {
                warn!(
                    match_id = %self.id,
                    tick = self.tick,
                    elapsed_us = elapsed.as_micros() as u64,
                    budget_us = budget.as_micros() as u64,
                    "Tick overran its budget"
                );
            }
        }

        self.finish()
    }

    /// Run one tick at wall-clock time `now_ms`. Returns false once the match
    /// has ended.
    pub fn step(&mut self, now_ms: u64) -> Result<bool, MatchError> {
        let tick = self
            .tick
            .checked_add(1)
            .ok_or_else(|| MatchError::Invariant("tick counter overflow".to_string()))?;
        self.tick = tick;
        self.current_tick.store(tick, Ordering::Relaxed);

        // Tick boundary: membership changes and timeouts
        self.process_control(now_ms);
        let events = self.sessions.evaluate(now_ms);
        self.apply_session_events(&events);

        // Commands: drain, validate, apply movement, resolve fire
        let mut moved = HashSet::new();
        let mut shots = Vec::new();
        for command in self.drain_commands() {
            match self.validator.validate(command, tick) {
                Verdict::Accept(command) | Verdict::Clamp { command, .. } => match command.action {
                    Action::Move { displacement } => {
                        if let Some(entity) = self.apply_move(command.session, displacement) {
                            moved.insert(entity);
                        }
                    }
                    Action::Fire { .. } => shots.push(command),
                },
                Verdict::Drop(rule) => {
                    debug!(match_id = %self.id, tick, rule = %rule, "Command dropped");
                }
            }
        }
        self.separate_bodies();
        for shot in &shots {
            if let Some(hit) = self.resolve_fire(shot) {
                debug!(
                    match_id = %self.id,
                    tick,
                    shooter = hit.shooter,
                    target = hit.target,
                    weapon = ?hit.weapon,
                    damage = hit.damage,
                    headshot = hit.headshot,
                    distance = hit.distance,
                    killed = hit.target_killed,
                    "Hit confirmed"
                );
            }
        }

        // Time-based simulation
        self.advance_timers(tick, &moved);

        // Materialize and replicate
        let snapshot = self
            .store
            .push(Snapshot::materialize(tick, now_ms, self.entities.values()))?;
        self.replication.record_snapshot(snapshot.len());
        self.replicate(&snapshot);

        self.session_count
            .store(self.sessions.live_count(), Ordering::Relaxed);
        Ok(!self.check_end())
    }

    fn process_control(&mut self, now_ms: u64) {
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                MatchControl::Join {
                    session,
                    player_id,
                    link,
                } => self.handle_join(session, player_id, link),
                MatchControl::Reconnect {
                    session,
                    player_id,
                    link,
                    reply,
                } => {
                    let result = self.handle_reconnect(session, player_id, link, now_ms);
                    let _ = reply.send(result);
                }
                MatchControl::Leave { session } => {
                    info!(match_id = %self.id, session_id = session, "Session left");
                    self.sessions.disconnect(session);
                }
                MatchControl::End { reason } => {
                    info!(match_id = %self.id, reason = %reason, "Match end requested");
                    self.end = Some(EndReason::Requested(reason));
                }
            }
        }
    }

    fn handle_join(&mut self, session: SessionId, player_id: Uuid, link: Arc<SessionLink>) {
        let Some(team) = self.roster.team_of(player_id) else {
            warn!(match_id = %self.id, player_id = %player_id, "Player not in roster, rejecting join");
            reject(&link, "not assigned to this match");
            return;
        };
        if self.sessions.by_player(player_id).is_some() {
            warn!(match_id = %self.id, player_id = %player_id, "Player already in match");
            reject(&link, "already connected to this match");
            return;
        }

        let entity_id = self.next_entity_id;
        let index = self.roster.team_index(player_id);
        let entity = match self.factory.spawn(entity_id, Archetype::SOLDIER, team, index) {
            Ok(entity) => entity,
            Err(e) => {
                warn!(match_id = %self.id, player_id = %player_id, error = %e, "Spawn failed, rejecting join");
                reject(&link, "spawn failed");
                return;
            }
        };
        self.next_entity_id += 1;

        self.sessions.insert(session, player_id, team, link.clone());
        self.entities.insert(entity_id, entity);
        link.send(self.welcome(session, entity_id));
        self.sessions.activate(session, entity_id);
        self.had_members = true;

        info!(
            match_id = %self.id,
            session_id = session,
            player_id = %player_id,
            team,
            entity_id,
            "Player joined match"
        );
    }

    fn handle_reconnect(
        &mut self,
        session: SessionId,
        player_id: Uuid,
        link: Arc<SessionLink>,
        now_ms: u64,
    ) -> Result<(), ReconnectError> {
        self.sessions.reconnect(session, player_id, link.clone(), now_ms)?;

        let Some(record) = self.sessions.get_mut(session) else {
            return Err(ReconnectError::UnknownSession(session));
        };
        let team = record.team;
        let retained = record.retained_entity.take();
        let entity_id = record.entity;

        let entity_id = match entity_id {
            Some(id) => {
                if !self.entities.contains_key(&id) {
                    if let Some(mut state) = retained {
                        state.set_flag(flags::PARKED, false);
                        if !state.is_alive() {
                            self.schedule_respawn(id);
                        }
                        self.entities.insert(id, state);
                    } else {
                        self.schedule_respawn(id);
                    }
                } else if let Some(state) = self.entities.get_mut(&id) {
                    state.set_flag(flags::PARKED, false);
                }
                id
            }
            None => {
                let id = self.next_entity_id;
                self.next_entity_id += 1;
                match self.factory.spawn(id, Archetype::SOLDIER, team, 0) {
                    Ok(state) => {
                        self.entities.insert(id, state);
                    }
                    Err(e) => {
                        warn!(match_id = %self.id, session_id = session, error = %e, "Respawn on reconnect failed");
                        self.schedule_respawn(id);
                    }
                }
                if let Some(record) = self.sessions.get_mut(session) {
                    record.entity = Some(id);
                }
                id
            }
        };

        link.send(self.welcome(session, entity_id));
        Ok(())
    }

    fn welcome(&self, session: SessionId, entity: EntityId) -> bytes::Bytes {
        Message::Welcome(Welcome {
            tick: self.tick,
            session,
            tick_rate: self.config.tick_rate.ticks_per_second() as u16,
            interp_delay_ms: self.config.session.interp_delay_ms as u16,
            entity,
        })
        .encode()
    }

    fn apply_session_events(&mut self, events: &[SessionEvent]) {
        for event in events {
            match *event {
                SessionEvent::Transition { session, from, to } => {
                    let Some(record) = self.sessions.get_mut(session) else {
                        continue;
                    };
                    let Some(entity_id) = record.entity else {
                        continue;
                    };
                    match to {
                        SessionState::Disconnected => {
                            // Removed at this tick boundary, kept for a possible reconnect
                            if let Some(state) = self.entities.remove(&entity_id) {
                                record.retained_entity = Some(state);
                            }
                            self.respawns.remove(&entity_id);
                        }
                        SessionState::Spectating => {
                            if let Some(state) = self.entities.get_mut(&entity_id) {
                                state.set_flag(flags::PARKED, true);
                                state.velocity = Vec2::ZERO;
                            }
                        }
                        SessionState::Active if from == SessionState::Spectating => {
                            if let Some(state) = self.entities.get_mut(&entity_id) {
                                state.set_flag(flags::PARKED, false);
                            }
                        }
                        _ => {}
                    }
                }
                SessionEvent::Expired {
                    session,
                    player_id,
                    team,
                    stats,
                } => {
                    let report = self.validator.report(session);
                    self.departed
                        .push(SessionSummary::new(session, player_id, team, stats, report));
                }
            }
        }
    }

    /// Take this tick's commands from every active session
    fn drain_commands(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        for session in self.sessions.iter_mut() {
            match session.state {
                SessionState::Active => {
                    commands.extend(session.link.ingress().take_per_channel(&mut session.processed));
                }
                SessionState::Stale | SessionState::Spectating => session.link.ingress().clear(),
                SessionState::Connecting | SessionState::Disconnected => {}
            }
        }
        commands
    }

    fn apply_move(&mut self, session: SessionId, displacement: Vec2) -> Option<EntityId> {
        let entity_id = self.sessions.get(session)?.entity?;
        let entity = self.entities.get_mut(&entity_id)?;
        if !entity.is_targetable() {
            return None;
        }
        PhysicsSystem::apply_displacement(
            entity,
            displacement,
            self.config.tick_rate.delta(),
            self.geometry.as_ref(),
        );
        Some(entity_id)
    }

    /// Push overlapping bodies apart
    fn separate_bodies(&mut self) {
        let bodies: Vec<(EntityId, f32)> = self
            .entities
            .values()
            .filter(|e| e.is_targetable())
            .filter_map(|e| self.factory.archetype(e.archetype).ok().map(|s| (e.id, s.hitbox_radius)))
            .collect();

        for (i, &(a_id, a_radius)) in bodies.iter().enumerate() {
            for &(b_id, b_radius) in &bodies[i + 1..] {
                let (Some(a), Some(b)) = (self.entities.get(&a_id), self.entities.get(&b_id)) else {
                    continue;
                };
                if !PhysicsSystem::check_collision(a.position, a_radius, b.position, b_radius) {
                    continue;
                }
                let (new_a, new_b) =
                    PhysicsSystem::resolve_collision(a.position, a_radius, b.position, b_radius);
                if let Some(a) = self.entities.get_mut(&a_id) {
                    a.position = self.geometry.clamp(new_a);
                }
                if let Some(b) = self.entities.get_mut(&b_id) {
                    b.position = self.geometry.clamp(new_b);
                }
            }
        }
    }

    /// Resolve one validated shot with lag compensation
    fn resolve_fire(&mut self, command: &Command) -> Option<HitResult> {
        let Action::Fire { weapon, direction, .. } = command.action else {
            return None;
        };
        let session = self.sessions.get(command.session)?;
        let shooter_id = session.entity?;
        let rtt = Duration::from_secs_f64(session.link.rtt_ms().max(0.0) / 1_000.0);
        let shooter_team = session.team;
        let shooter = self.entities.get(&shooter_id)?;
        if !shooter.is_targetable() {
            return None;
        }

        let stats = WeaponStats::for_kind(weapon);
        let shot = HitScan {
            shooter: shooter_id,
            origin: shooter.position,
            direction: direction.normalized()?,
            range: stats.range,
        };

        if let Some(record) = self.sessions.get_mut(command.session) {
            record.stats.shots += 1;
        }

        let hit = match self.lag.rewind(&self.store, self.tick, rtt) {
            Some(rewind) => self.lag.trace(
                &rewind.snapshot.entities,
                &shot,
                self.factory.as_ref(),
                self.geometry.as_ref(),
            ),
            // First tick of the match: nothing recorded yet
            None => self
                .lag
                .trace(&self.entities, &shot, self.factory.as_ref(), self.geometry.as_ref()),
        }?;

        // Damage always lands on the present-day entity
        let target = self.entities.get_mut(&hit.target)?;
        if !target.is_targetable() {
            return None;
        }
        let damage = stats.damage_for(hit.headshot);
        let (health, killed) = CombatSystem::apply_damage(target.health, damage);
        target.health = health;
        if killed {
            target.set_flag(flags::ALIVE, false);
            target.velocity = Vec2::ZERO;
        }

        if let Some(record) = self.sessions.get_mut(command.session) {
            record.stats.hits += 1;
            record.stats.damage_dealt += damage;
            if hit.headshot {
                record.stats.headshots += 1;
            }
            if killed {
                record.stats.kills += 1;
            }
        }
        self.validator.record_hit(command.session, hit.headshot);

        if killed {
            self.schedule_respawn(hit.target);
            let victim = self
                .sessions
                .by_entity(hit.target)
                .map(|s| (s.id, s.team));
            if let Some((victim_session, victim_team)) = victim {
                if let Some(record) = self.sessions.get_mut(victim_session) {
                    record.stats.deaths += 1;
                }
                self.rules.on_score_event(&ScoreEvent::Kill {
                    killer: command.session,
                    killer_team: shooter_team,
                    victim: victim_session,
                    victim_team,
                });
            }
        }

        Some(HitResult {
            shooter: shooter_id,
            target: hit.target,
            weapon,
            damage,
            headshot: hit.headshot,
            distance: hit.distance,
            target_killed: killed,
        })
    }

    fn schedule_respawn(&mut self, entity: EntityId) {
        let delay = self.config.tick_rate.ticks_in(self.config.respawn_delay).max(1);
        self.respawns.insert(entity, self.tick.saturating_add(delay));
    }

    /// Velocity decay, respawns and mode rules
    fn advance_timers(&mut self, tick: Tick, moved: &HashSet<EntityId>) {
        for entity in self.entities.values_mut() {
            if entity.is_alive() && !moved.contains(&entity.id) {
                PhysicsSystem::settle(entity);
            }
        }

        let due: Vec<EntityId> = self
            .respawns
            .iter()
            .filter(|(_, at)| **at <= tick)
            .map(|(id, _)| *id)
            .collect();
        for entity_id in due {
            self.respawns.remove(&entity_id);
            self.respawn(entity_id);
        }

        let positions: Vec<(TeamId, Vec2)> = self
            .sessions
            .iter()
            .filter_map(|s| {
                let entity = self.entities.get(&s.entity?)?;
                entity.is_targetable().then_some((s.team, entity.position))
            })
            .collect();
        self.rules.on_tick(tick, &positions);
    }

    fn respawn(&mut self, entity_id: EntityId) {
        let Some(session) = self.sessions.by_entity(entity_id) else {
            return;
        };
        let team = session.team;
        let spectating = session.state == SessionState::Spectating;
        let archetype = self
            .entities
            .get(&entity_id)
            .map_or(Archetype::SOLDIER, |e| e.archetype);
        let index = self.rng.gen_range(0..8);

        match self.factory.spawn(entity_id, archetype, team, index) {
            Ok(mut state) => {
                state.set_flag(flags::PARKED, spectating);
                self.entities.insert(entity_id, state);
                debug!(match_id = %self.id, entity_id, team, "Entity respawned");
            }
            Err(e) => {
                error!(match_id = %self.id, entity_id, error = %e, "Respawn failed, entity stays down");
            }
        }
    }

    /// Queue this tick's state for every replicating session
    fn replicate(&mut self, snapshot: &Arc<Snapshot>) {
        for session in self.sessions.iter_mut() {
            if !session.is_replicating() {
                continue;
            }
            session.forget_shed_baseline();
            let baseline = if session.needs_full_sync {
                None
            } else {
                session.baseline_tick()
            };
            let last_command_seq = session.processed.movement.unwrap_or(0);

            let frame = match delta::replicate(&self.store, baseline, snapshot) {
                Replication::Full(full) => {
                    session.needs_full_sync = false;
                    session.last_full_tick = Some(full.tick);
                    let frame = encode_full_snapshot(&full, last_command_seq);
                    self.replication.record_full(frame.len());
                    frame
                }
                Replication::Delta(delta) => {
                    let frame = encode_delta(&delta, last_command_seq);
                    self.replication.record_delta(frame.len());
                    frame
                }
            };
            session.link.send(frame);
        }
    }

    /// True once the match should stop
    fn check_end(&mut self) -> bool {
        if self.end.is_some() {
            return true;
        }
        if self.rules.is_match_complete() {
            info!(match_id = %self.id, tick = self.tick, outcome = ?self.rules.outcome(), "Match complete");
            self.end = Some(EndReason::Completed);
        } else if self.had_members && self.sessions.live_count() == 0 {
            info!(match_id = %self.id, "All sessions left, ending match");
            self.end = Some(EndReason::Abandoned);
        } else if !self.had_members && self.tick >= self.config.tick_rate.ticks_in(self.config.join_timeout) {
            warn!(match_id = %self.id, "Nobody joined, abandoning match");
            self.end = Some(EndReason::Abandoned);
        }
        self.end.is_some()
    }

    /// Disconnect everyone and produce the summary
    pub fn finish(mut self) -> MatchSummary {
        let end_reason = self.end.take().unwrap_or(EndReason::Abandoned);
        let goodbye = encode_disconnect(&end_reason.disconnect_reason());

        let mut sessions = std::mem::take(&mut self.departed);
        for session in self.sessions.iter() {
            session.link.send(goodbye.clone());
            session.link.close();
            sessions.push(SessionSummary::new(
                session.id,
                session.player_id,
                session.team,
                session.stats,
                self.validator.report(session.id),
            ));
        }
        self.session_count.store(0, Ordering::Relaxed);

        let outcome = match end_reason {
            EndReason::Fatal(_) => MatchOutcome::Draw,
            _ => self.rules.outcome(),
        };
        let flagged = sessions.iter().filter(|s| s.flagged).count();

        info!(
            match_id = %self.id,
            ticks = self.tick,
            end_reason = ?end_reason,
            outcome = ?outcome,
            sessions = sessions.len(),
            flagged,
            full_snapshots = self.replication.full_snapshots,
            deltas = self.replication.deltas,
            replicated_bytes = self.replication.total_bytes,
            avg_entities = self.replication.avg_entities_per_snapshot,
            "Match ended"
        );

        MatchSummary {
            match_id: self.id,
            ticks: self.tick,
            outcome,
            end_reason,
            scores: self.rules.scores(),
            sessions,
            replication: self.replication,
            roster: self.roster,
        }
    }
}

/// Tell a connection why it was refused and close it
fn reject(link: &SessionLink, reason: &str) {
    link.send(encode_disconnect(reason));
    link.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::combat::WeaponKind;
    use crate::game::providers::{ArenaEntityFactory, WalledArena};
    use crate::game::roster::RosterEntry;
    use crate::ws::protocol::MessageType;

    fn services() -> MatchServices {
        MatchServices {
            geometry: Arc::new(WalledArena::open(100.0)),
            factory: Arc::new(ArenaEntityFactory::new(10.0)),
        }
    }

    fn roster(players: &[Uuid]) -> MatchRoster {
        MatchRoster::new(
            Uuid::new_v4(),
            MatchMode::TeamDeathmatch,
            players
                .iter()
                .enumerate()
                .map(|(i, p)| RosterEntry {
                    player_id: *p,
                    rating: 1500.0,
                    team: (i % 2) as TeamId,
                })
                .collect(),
        )
    }

    fn drain(link: &SessionLink) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(frame) = link.try_next_outbound() {
            out.push(Message::decode(&frame).unwrap());
        }
        out
    }

    async fn joined_match(players: usize) -> (GameMatch, MatchHandle, Vec<Arc<SessionLink>>) {
        let ids: Vec<Uuid> = (0..players).map(|_| Uuid::new_v4()).collect();
        let (game, handle) = GameMatch::new(roster(&ids), Arc::new(SimConfig::default()), services(), 7);
        let mut links = Vec::new();
        for (i, player_id) in ids.iter().enumerate() {
            let session = i as SessionId + 1;
            let link = Arc::new(SessionLink::new(session, 16, 64, 0));
            handle
                .send(MatchControl::Join {
                    session,
                    player_id: *player_id,
                    link: link.clone(),
                })
                .await
                .unwrap();
            links.push(link);
        }
        (game, handle, links)
    }

    #[tokio::test]
    async fn join_sends_welcome_then_full_then_deltas() {
        let (mut game, _handle, links) = joined_match(2).await;
        assert!(game.step(0).unwrap());
        assert!(game.step(50).unwrap());

        let messages = drain(&links[0]);
        assert!(matches!(messages[0], Message::Welcome(Welcome { session: 1, entity: 1, .. })));
        assert!(matches!(&messages[1], Message::FullSnapshot { snapshot, .. } if snapshot.len() == 2));
        assert!(matches!(&messages[2], Message::Delta { delta, .. } if delta.baseline_tick == 1));
        assert_eq!(game.sessions().live_count(), 2);
    }

    #[tokio::test]
    async fn shed_full_snapshot_is_resent() {
        let player = Uuid::new_v4();
        let (mut game, handle) = GameMatch::new(roster(&[player]), Arc::new(SimConfig::default()), services(), 7);
        let link = Arc::new(SessionLink::new(1, 16, 2, 0));
        handle
            .send(MatchControl::Join {
                session: 1,
                player_id: player,
                link: link.clone(),
            })
            .await
            .unwrap();

        // Nobody drains: the delta at tick 2 pushes the welcome out
        game.step(0).unwrap();
        game.step(50).unwrap();
        game.step(100).unwrap();
        let messages = drain(&link);
        assert!(matches!(&messages[0], Message::Delta { delta, .. } if delta.baseline_tick == 1));
        assert!(matches!(&messages[1], Message::FullSnapshot { snapshot, .. } if snapshot.tick == 3));

        link.ack(3);
        game.step(150).unwrap();
        let messages = drain(&link);
        assert!(matches!(&messages[0], Message::Delta { delta, .. } if delta.baseline_tick == 3));
    }

    #[tokio::test]
    async fn stranger_is_rejected() {
        let (mut game, handle, _links) = joined_match(2).await;
        let stranger = Arc::new(SessionLink::new(9, 4, 4, 0));
        handle
            .send(MatchControl::Join {
                session: 9,
                player_id: Uuid::new_v4(),
                link: stranger.clone(),
            })
            .await
            .unwrap();
        game.step(0).unwrap();
        assert!(stranger.is_closed());
        let frames = drain(&stranger);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type(), MessageType::Disconnect);
    }

    #[tokio::test]
    async fn speeding_command_is_clamped_to_max_speed() {
        let (mut game, _handle, links) = joined_match(2).await;
        game.step(0).unwrap();
        let start = game.entity(1).unwrap().position;

        links[0].push_command(Command {
            session: 1,
            sequence: 1,
            client_tick: 1,
            action: Action::Move {
                displacement: Vec2::new(0.0, 5.0),
            },
            received_at_ms: 40,
        });
        game.step(50).unwrap();

        let moved = game.entity(1).unwrap().position.distance(start);
        let max_step = 24.0 * 0.05;
        assert!((moved - max_step).abs() < 1e-3, "moved {moved}");
    }

    #[tokio::test]
    async fn kill_schedules_respawn_and_scores() {
        let (mut game, _handle, links) = joined_match(2).await;
        game.step(0).unwrap();

        let shooter = *game.entity(1).unwrap();
        let target = *game.entity(2).unwrap();
        let aim = (target.position - shooter.position).normalized().unwrap();

        // Marksman headshots: 137.5 damage, one shot kills
        links[0].push_command(Command {
            session: 1,
            sequence: 1,
            client_tick: 1,
            action: Action::Fire {
                weapon: WeaponKind::Marksman,
                direction: aim,
                claimed_damage: 55.0,
                target: Some(2),
            },
            received_at_ms: 30,
        });
        game.step(50).unwrap();

        let victim = game.entity(2).unwrap();
        assert!(!victim.is_alive());
        assert_eq!(game.sessions().get(1).unwrap().stats.kills, 1);
        assert_eq!(game.sessions().get(2).unwrap().stats.deaths, 1);

        // Respawn after 3 s = 60 ticks; keep both sessions talking meanwhile
        for tick in 0..60u64 {
            let now = 100 + tick * 50;
            for (i, link) in links.iter().enumerate() {
                link.push_command(Command {
                    session: i as SessionId + 1,
                    sequence: 10 + tick as u32,
                    client_tick: game.tick(),
                    action: Action::Move { displacement: Vec2::ZERO },
                    received_at_ms: now,
                });
            }
            game.step(now).unwrap();
        }
        assert!(game.entity(2).unwrap().is_alive());
        assert_eq!(game.rules.scores().get(&0), Some(&1));
    }

    #[tokio::test]
    async fn everyone_leaving_ends_the_match() {
        let (mut game, handle, links) = joined_match(2).await;
        game.step(0).unwrap();
        handle.send(MatchControl::Leave { session: 1 }).await.unwrap();
        links[1].close();
        assert!(!game.step(50).unwrap());

        let summary = game.finish();
        assert_eq!(summary.end_reason, EndReason::Abandoned);
        assert_eq!(summary.sessions.len(), 2);
    }

    #[tokio::test]
    async fn end_request_disconnects_everyone() {
        let (mut game, handle, links) = joined_match(2).await;
        game.step(0).unwrap();
        handle
            .send(MatchControl::End {
                reason: "maintenance".into(),
            })
            .await
            .unwrap();
        assert!(!game.step(50).unwrap());
        let summary = game.finish();
        assert_eq!(summary.end_reason, EndReason::Requested("maintenance".into()));

        let last = drain(&links[0]).pop().unwrap();
        assert_eq!(
            last,
            Message::Disconnect {
                reason: "match ended: maintenance".into()
            }
        );
        assert!(links[0].is_closed());
    }

    #[tokio::test]
    async fn run_drives_ticks_until_end() {
        let (game, handle, _links) = joined_match(2).await;
        let task = tokio::spawn(game.run());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(handle.current_tick() >= 1);
        handle
            .send(MatchControl::End { reason: "test".into() })
            .await
            .unwrap();
        let summary = task.await.unwrap();
        assert!(summary.ticks >= 2);
        assert!(summary.replication.full_snapshots >= 2);
    }
}
