//! Remote entity rendering between buffered server snapshots
//!
//! Remote entities are drawn `interp_delay` behind the server clock so there
//! are normally two authoritative snapshots around the render time to blend
//! between. When the buffer runs dry the last known state is pushed forward
//! along its velocity and the result is flagged as predicted until the next
//! snapshot lands.
//!
//! ```text
//! server ts:   [t0]------[t1]------[t2]
//! render at:             ^ now - offset - delay
//!                        lerp(t1, t2)
//! ```

use std::collections::VecDeque;
use std::f32::consts::{PI, TAU};

use crate::game::entity::{Archetype, EntityId, EntityState, Vec2};
use crate::game::Snapshot;
use crate::util::time::Tick;

/// Snapshots kept for blending
const DEFAULT_BUFFER_LEN: usize = 32;

/// Weight of a new clock offset sample
const OFFSET_SMOOTHING: f64 = 0.125;

/// Entity state ready to draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderedEntity {
    pub id: EntityId,
    pub archetype: Archetype,
    pub position: Vec2,
    pub orientation: f32,
    pub health: f32,
    pub alive: bool,
    /// Not backed by two authoritative snapshots: extrapolated remote state or
    /// the local player's own prediction
    pub predicted: bool,
}

impl RenderedEntity {
    pub fn from_state(state: &EntityState, predicted: bool) -> Self {
        Self {
            id: state.id,
            archetype: state.archetype,
            position: state.position,
            orientation: state.orientation,
            health: state.health,
            alive: state.is_alive(),
            predicted,
        }
    }
}

/// Snapshot interpolation buffer for remote entities
#[derive(Debug, Clone)]
pub struct Interpolator {
    delay_ms: u64,
    max_extrapolation_ms: u64,
    capacity: usize,
    buffer: VecDeque<Snapshot>,
    /// Local clock minus server clock, smoothed
    clock_offset_ms: Option<f64>,
}

impl Interpolator {
    pub fn new(delay_ms: u64, max_extrapolation_ms: u64) -> Self {
        Self {
            delay_ms,
            max_extrapolation_ms,
            capacity: DEFAULT_BUFFER_LEN,
            buffer: VecDeque::with_capacity(DEFAULT_BUFFER_LEN),
            clock_offset_ms: None,
        }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// The server may advertise a different delay in its Welcome
    pub fn set_delay(&mut self, delay_ms: u64) {
        self.delay_ms = delay_ms;
    }

    pub fn clock_offset_ms(&self) -> Option<i64> {
        self.clock_offset_ms.map(|o| o.round() as i64)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.buffer.back().map(|s| s.tick)
    }

    /// Forget everything, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.clock_offset_ms = None;
    }

    /// Buffer an authoritative snapshot received at local time `received_ms`.
    /// Snapshots older than the newest buffered one are ignored.
    pub fn push(&mut self, snapshot: Snapshot, received_ms: u64) {
        if self.latest_tick().is_some_and(|latest| snapshot.tick <= latest) {
            return;
        }

        let sample = received_ms as f64 - snapshot.timestamp_ms as f64;
        self.clock_offset_ms = Some(match self.clock_offset_ms {
            Some(offset) => offset + (sample - offset) * OFFSET_SMOOTHING,
            None => sample,
        });

        self.buffer.push_back(snapshot);
        while self.buffer.len() > self.capacity {
            self.buffer.pop_front();
        }
    }

    /// Server-clock time to render at for local time `now_ms`
    pub fn render_time(&self, now_ms: u64) -> Option<f64> {
        let offset = self.clock_offset_ms?;
        Some(now_ms as f64 - offset - self.delay_ms as f64)
    }

    /// Every buffered entity except `skip` (usually the local player) as it
    /// should appear at local time `now_ms`
    pub fn sample(&self, now_ms: u64, skip: Option<EntityId>) -> Vec<RenderedEntity> {
        let Some(render_ms) = self.render_time(now_ms) else {
            return Vec::new();
        };

        let after_idx = self
            .buffer
            .iter()
            .position(|s| s.timestamp_ms as f64 > render_ms);
        let (before, after) = match after_idx {
            Some(0) => (None, self.buffer.front()),
            Some(i) => (self.buffer.get(i - 1), self.buffer.get(i)),
            None => (self.buffer.back(), None),
        };

        let visible = |id: &EntityId| Some(*id) != skip;
        match (before, after) {
            (Some(from), Some(to)) => {
                let span = to.timestamp_ms.saturating_sub(from.timestamp_ms) as f64;
                let alpha = if span > 0.0 {
                    ((render_ms - from.timestamp_ms as f64) / span).clamp(0.0, 1.0) as f32
                } else {
                    1.0
                };
                let spawned = to
                    .entities
                    .iter()
                    .filter(|(id, _)| !from.entities.contains_key(id))
                    .map(|(_, b)| RenderedEntity::from_state(b, false));
                from.entities
                    .iter()
                    .map(|(id, a)| match to.entities.get(id) {
                        Some(b) => blend(a, b, alpha),
                        None => RenderedEntity::from_state(a, false),
                    })
                    .chain(spawned)
                    .filter(|rendered| visible(&rendered.id))
                    .collect()
            }
            (Some(last), None) => {
                // Underrun
                let ahead_ms = (render_ms - last.timestamp_ms as f64)
                    .clamp(0.0, self.max_extrapolation_ms as f64);
                let dt = (ahead_ms / 1000.0) as f32;
                last.entities
                    .iter()
                    .filter(|(id, _)| visible(id))
                    .map(|(_, state)| {
                        let mut rendered = RenderedEntity::from_state(state, true);
                        if rendered.alive {
                            rendered.position = state.position + state.velocity * dt;
                        }
                        rendered
                    })
                    .collect()
            }
            (None, Some(first)) => first
                .entities
                .iter()
                .filter(|(id, _)| visible(id))
                .map(|(_, state)| RenderedEntity::from_state(state, false))
                .collect(),
            (None, None) => Vec::new(),
        }
    }
}

fn blend(a: &EntityState, b: &EntityState, alpha: f32) -> RenderedEntity {
    // A death or respawn in between is shown as-is rather than slid across the map
    if a.is_alive() != b.is_alive() {
        let nearest = if alpha < 0.5 { a } else { b };
        return RenderedEntity::from_state(nearest, false);
    }

    RenderedEntity {
        id: a.id,
        archetype: b.archetype,
        position: a.position.lerp(b.position, alpha),
        orientation: lerp_angle(a.orientation, b.orientation, alpha),
        health: if alpha < 1.0 { a.health } else { b.health },
        alive: b.is_alive(),
        predicted: false,
    }
}

/// Shortest-arc blend of two angles in `[0, TAU)`
fn lerp_angle(from: f32, to: f32, alpha: f32) -> f32 {
    let mut diff = (to - from).rem_euclid(TAU);
    if diff > PI {
        diff -= TAU;
    }
    (from + diff * alpha).rem_euclid(TAU)
}
