//! Server-side lag compensation for hit-scan weapons
//!
//! A shot is judged against the world the shooter was looking at: the engine
//! rewinds to `current_tick - round((rtt / 2) / tick_interval)`, traces the ray
//! against entity positions from that snapshot, and hands back the hit. Damage
//! itself is always applied to the present-day entity by the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::util::time::{Tick, TickRate};

use super::combat::CombatSystem;
use super::entity::{EntityId, EntityState, Vec2};
use super::providers::{EntityFactory, LevelGeometry};
use super::snapshot::{Snapshot, SnapshotStore};

/// A hit-scan ray fired this tick
#[derive(Debug, Clone, Copy)]
pub struct HitScan {
    pub shooter: EntityId,
    pub origin: Vec2,
    /// Unit vector
    pub direction: Vec2,
    pub range: f32,
}

/// The historical world a shot is judged against
#[derive(Debug, Clone)]
pub struct Rewind {
    /// Tick the shooter's latency points at
    pub requested_tick: Tick,
    /// Tick of the snapshot actually used
    pub used_tick: Tick,
    /// The requested tick had aged out and the oldest snapshot was used instead
    pub degraded: bool,
    pub snapshot: Arc<Snapshot>,
}

/// A hit found in rewound state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewoundHit {
    pub target: EntityId,
    pub distance: f32,
    pub headshot: bool,
    /// Where the target was at the rewound tick
    pub target_position: Vec2,
}

/// Rewinds hit detection to the shooter's view of the world
#[derive(Debug, Clone)]
pub struct LagCompensator {
    tick_rate: TickRate,
}

impl LagCompensator {
    pub fn new(tick_rate: TickRate) -> Self {
        Self { tick_rate }
    }

    /// Tick the shooter saw, before clamping to the store's window
    pub fn compensation_tick(&self, current_tick: Tick, rtt: Duration) -> Tick {
        current_tick.saturating_sub(self.tick_rate.ticks_in(rtt / 2))
    }

    /// Fetch the snapshot a shot at `current_tick` should be judged against.
    /// Returns `None` only when the store is empty.
    pub fn rewind(&self, store: &SnapshotStore, current_tick: Tick, rtt: Duration) -> Option<Rewind> {
        let requested_tick = self.compensation_tick(current_tick, rtt);
        let oldest = store.oldest_tick()?;
        let latest = store.latest_tick()?;

        // Nothing newer than the latest snapshot exists; the shooter cannot have seen it
        let wanted = requested_tick.min(latest);
        let degraded = wanted < oldest;
        let used_tick = wanted.max(oldest);

        let snapshot = match store.get(used_tick) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(error = %e, "Rewind lookup failed, using oldest snapshot");
                store.oldest()?
            }
        };

        if degraded {
            warn!(
                current_tick,
                requested_tick,
                used_tick = snapshot.tick,
                rtt_ms = rtt.as_millis() as u64,
                "Lag compensation degraded: requested tick evicted, using oldest snapshot"
            );
        }

        Some(Rewind {
            requested_tick,
            used_tick: snapshot.tick,
            degraded,
            snapshot,
        })
    }

    /// Trace a shot against a set of entity positions. The nearest targetable
    /// entity in front of any static geometry wins.
    pub fn trace(
        &self,
        entities: &BTreeMap<EntityId, EntityState>,
        shot: &HitScan,
        factory: &dyn EntityFactory,
        geometry: &dyn LevelGeometry,
    ) -> Option<RewoundHit> {
        let reach = geometry
            .raycast(shot.origin, shot.direction, shot.range)
            .unwrap_or(shot.range);

        let mut best: Option<RewoundHit> = None;
        for entity in entities.values() {
            if entity.id == shot.shooter || !entity.is_targetable() {
                continue;
            }
            let spec = match factory.archetype(entity.archetype) {
                Ok(spec) => spec,
                Err(e) => {
                    debug!(entity_id = entity.id, error = %e, "Skipping entity without archetype data");
                    continue;
                }
            };

            let Some((distance, offset)) =
                CombatSystem::ray_circle(shot.origin, shot.direction, entity.position, spec.hitbox_radius)
            else {
                continue;
            };
            if distance > reach {
                continue;
            }
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(RewoundHit {
                    target: entity.id,
                    distance,
                    headshot: offset <= spec.head_radius,
                    target_position: entity.position,
                });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{flags, Archetype};
    use crate::game::providers::{ArenaEntityFactory, Wall, WalledArena};

    const VELOCITY: f32 = 10.0;

    fn runner_at(tick: Tick, rate: TickRate) -> EntityState {
        EntityState {
            id: 2,
            archetype: Archetype::SOLDIER,
            position: Vec2::new(VELOCITY * tick as f32 * rate.delta(), 20.0),
            velocity: Vec2::new(VELOCITY, 0.0),
            health: 100.0,
            orientation: 0.0,
            flags: flags::ALIVE,
        }
    }

    fn store_with_runner(capacity: usize, last_tick: Tick, rate: TickRate) -> SnapshotStore {
        let mut store = SnapshotStore::new(capacity);
        for tick in 0..=last_tick {
            let runner = runner_at(tick, rate);
            store
                .push(Snapshot::materialize(tick, tick as u64 * 50, [&runner]))
                .unwrap();
        }
        store
    }

    #[test]
    fn compensation_tick_rounds_half_rtt() {
        let lag = LagCompensator::new(TickRate::new(20));
        assert_eq!(lag.compensation_tick(100, Duration::from_millis(200)), 98);
        assert_eq!(lag.compensation_tick(100, Duration::from_millis(140)), 99);
        assert_eq!(lag.compensation_tick(100, Duration::from_millis(160)), 98);
        assert_eq!(lag.compensation_tick(1, Duration::from_secs(10)), 0);
    }

    #[test]
    fn rewound_position_matches_constant_velocity_history() {
        let rate = TickRate::new(20);
        let lag = LagCompensator::new(rate);
        let store = store_with_runner(32, 40, rate);

        let rewind = lag.rewind(&store, 40, Duration::from_millis(200)).unwrap();
        assert_eq!(rewind.used_tick, 38);
        assert!(!rewind.degraded);

        let rewound = rewind.snapshot.entity(2).unwrap().position;
        let direct = Vec2::new(VELOCITY * 38.0 * rate.delta(), 20.0);
        assert!(rewound.distance(direct) < 0.01);
    }

    #[test]
    fn shot_at_seen_position_hits_only_when_rewound() {
        let rate = TickRate::new(20);
        let lag = LagCompensator::new(rate);
        let store = store_with_runner(32, 40, rate);
        let factory = ArenaEntityFactory::default();
        let arena = WalledArena::open(200.0);

        // Shooter aims straight up at where the runner was two ticks ago (x = 19)
        let shot = HitScan {
            shooter: 1,
            origin: Vec2::new(19.0, 0.0),
            direction: Vec2::new(0.0, 1.0),
            range: 80.0,
        };

        let rewind = lag.rewind(&store, 40, Duration::from_millis(200)).unwrap();
        let hit = lag.trace(&rewind.snapshot.entities, &shot, &factory, &arena).unwrap();
        assert_eq!(hit.target, 2);
        assert!(hit.headshot);

        // Against the present-day position (x = 20) the same ray misses
        let present = store.latest().unwrap();
        assert!(lag.trace(&present.entities, &shot, &factory, &arena).is_none());
    }

    #[test]
    fn evicted_tick_degrades_to_oldest() {
        let rate = TickRate::new(20);
        let lag = LagCompensator::new(rate);
        let store = store_with_runner(8, 40, rate);

        let rewind = lag.rewind(&store, 40, Duration::from_secs(2)).unwrap();
        assert_eq!(rewind.requested_tick, 20);
        assert_eq!(rewind.used_tick, 33);
        assert!(rewind.degraded);
    }

    #[test]
    fn walls_block_rewound_shots() {
        let rate = TickRate::new(20);
        let lag = LagCompensator::new(rate);
        let store = store_with_runner(32, 40, rate);
        let factory = ArenaEntityFactory::default();
        let arena = WalledArena::new(
            200.0,
            vec![Wall { a: Vec2::new(10.0, 10.0), b: Vec2::new(30.0, 10.0) }],
        );
        let shot = HitScan {
            shooter: 1,
            origin: Vec2::new(19.0, 0.0),
            direction: Vec2::new(0.0, 1.0),
            range: 80.0,
        };
        let rewind = lag.rewind(&store, 40, Duration::from_millis(200)).unwrap();
        assert!(lag.trace(&rewind.snapshot.entities, &shot, &factory, &arena).is_none());
    }

    #[test]
    fn empty_store_cannot_rewind() {
        let lag = LagCompensator::new(TickRate::default());
        assert!(lag.rewind(&SnapshotStore::new(4), 10, Duration::ZERO).is_none());
    }
}
