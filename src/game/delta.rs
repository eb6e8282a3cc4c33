//! Field-level delta compression between snapshots

use std::sync::Arc;

use tracing::debug;

use crate::error::Severity;
use crate::util::time::Tick;

use super::entity::{field_changed, EntityId, EntityState, FieldId, FieldValue};
use super::snapshot::{Snapshot, SnapshotError, SnapshotStore};

/// One sparse change inside a delta
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaOp {
    /// Overwrite one field of one entity
    Set {
        entity: EntityId,
        field: FieldId,
        value: FieldValue,
    },
    /// Entity no longer exists
    Remove { entity: EntityId },
}

/// Difference between a baseline snapshot and a target snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub baseline_tick: Tick,
    pub target_tick: Tick,
    pub target_timestamp_ms: u64,
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Delta decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("delta expects baseline tick {expected}, got {found}")]
    BaselineMismatch { expected: Tick, found: Tick },

    #[error("value type does not match field {field:?} of entity {entity}")]
    FieldType { entity: EntityId, field: FieldId },
}

impl DeltaError {
    /// A delta that cannot be applied is recovered with a full resync
    pub fn severity(&self) -> Severity {
        Severity::Transient
    }
}

/// Encode the changes that turn `baseline` into `target`.
///
/// New entities get every field, removed entities get a removal marker, and
/// float fields only count as changed when they differ at replication precision.
pub fn encode(baseline: &Snapshot, target: &Snapshot) -> Delta {
    let mut ops = Vec::new();

    for (id, entity) in &target.entities {
        match baseline.entities.get(id) {
            Some(previous) => push_changed_fields(&mut ops, previous, entity),
            None => push_all_fields(&mut ops, entity),
        }
    }

    for id in baseline.entities.keys() {
        if !target.entities.contains_key(id) {
            ops.push(DeltaOp::Remove { entity: *id });
        }
    }

    Delta {
        baseline_tick: baseline.tick,
        target_tick: target.tick,
        target_timestamp_ms: target.timestamp_ms,
        ops,
    }
}

/// Reconstruct the target snapshot from its baseline
pub fn decode(baseline: &Snapshot, delta: &Delta) -> Result<Snapshot, DeltaError> {
    if baseline.tick != delta.baseline_tick {
        return Err(DeltaError::BaselineMismatch {
            expected: delta.baseline_tick,
            found: baseline.tick,
        });
    }

    let mut target = baseline.clone();
    apply(&mut target, delta)?;
    Ok(target)
}

/// Apply a delta in place. Every op is absolute, so applying the same delta
/// again leaves the snapshot unchanged.
pub fn apply(snapshot: &mut Snapshot, delta: &Delta) -> Result<(), DeltaError> {
    for op in &delta.ops {
        match *op {
            DeltaOp::Set {
                entity,
                field,
                value,
            } => {
                let state = snapshot
                    .entities
                    .entry(entity)
                    .or_insert_with(|| EntityState::blank(entity));
                if !state.set_field(field, value) {
                    return Err(DeltaError::FieldType { entity, field });
                }
            }
            DeltaOp::Remove { entity } => {
                snapshot.entities.remove(&entity);
            }
        }
    }

    snapshot.tick = delta.target_tick;
    snapshot.timestamp_ms = delta.target_timestamp_ms;
    Ok(())
}

fn push_changed_fields(ops: &mut Vec<DeltaOp>, previous: &EntityState, current: &EntityState) {
    for field in FieldId::ALL {
        let value = current.field(field);
        if field_changed(previous.field(field), value) {
            ops.push(DeltaOp::Set {
                entity: current.id,
                field,
                value,
            });
        }
    }
}

fn push_all_fields(ops: &mut Vec<DeltaOp>, entity: &EntityState) {
    for field in FieldId::ALL {
        ops.push(DeltaOp::Set {
            entity: entity.id,
            field,
            value: entity.field(field),
        });
    }
}

/// What to send a session for one tick
#[derive(Debug, Clone)]
pub enum Replication {
    /// Full state, no diffing
    Full(Arc<Snapshot>),
    Delta(Delta),
}

/// Diff `target` against the session's baseline, falling back to a full
/// snapshot when there is no baseline or it has aged out of the store.
pub fn replicate(
    store: &SnapshotStore,
    baseline_tick: Option<Tick>,
    target: &Arc<Snapshot>,
) -> Replication {
    let Some(baseline_tick) = baseline_tick else {
        return Replication::Full(target.clone());
    };

    match store.get(baseline_tick) {
        Ok(baseline) => Replication::Delta(encode(&baseline, target)),
        Err(SnapshotError::Evicted(tick)) | Err(SnapshotError::NotRecorded(tick)) => {
            debug!(baseline_tick = tick, target_tick = target.tick, "Baseline unavailable, sending full snapshot");
            Replication::Full(target.clone())
        }
        Err(SnapshotError::NonMonotonic { .. }) => Replication::Full(target.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{flags, Archetype, Vec2};

    fn entity(id: EntityId, x: f32, y: f32, health: f32) -> EntityState {
        EntityState {
            id,
            archetype: Archetype::SOLDIER,
            position: Vec2::new(x, y),
            velocity: Vec2::ZERO,
            health,
            orientation: 0.0,
            flags: flags::ALIVE,
        }
    }

    fn snapshot(tick: Tick, entities: &[EntityState]) -> Snapshot {
        Snapshot::materialize(tick, 10_000 + tick as u64 * 50, entities)
    }

    #[test]
    fn diff_emits_changed_fields_and_spawned_entities() {
        let baseline = snapshot(1, &[entity(1, 0.0, 0.0, 100.0)]);
        let target = snapshot(2, &[entity(1, 5.0, 0.0, 80.0), entity(2, 1.0, 1.0, 50.0)]);

        let delta = encode(&baseline, &target);

        let entity_one: Vec<_> = delta
            .ops
            .iter()
            .filter(|op| matches!(op, DeltaOp::Set { entity: 1, .. }))
            .collect();
        assert_eq!(
            entity_one,
            vec![
                &DeltaOp::Set {
                    entity: 1,
                    field: FieldId::Position,
                    value: FieldValue::Vector(Vec2::new(5.0, 0.0)),
                },
                &DeltaOp::Set {
                    entity: 1,
                    field: FieldId::Health,
                    value: FieldValue::Scalar(80.0),
                },
            ]
        );

        let spawned = delta
            .ops
            .iter()
            .filter(|op| matches!(op, DeltaOp::Set { entity: 2, .. }))
            .count();
        assert_eq!(spawned, FieldId::ALL.len());
        assert!(delta.ops.contains(&DeltaOp::Set {
            entity: 2,
            field: FieldId::Health,
            value: FieldValue::Scalar(50.0),
        }));
    }

    #[test]
    fn removed_entity_gets_marker() {
        let baseline = snapshot(1, &[entity(1, 0.0, 0.0, 100.0), entity(2, 3.0, 3.0, 10.0)]);
        let target = snapshot(2, &[entity(1, 0.0, 0.0, 100.0)]);

        let delta = encode(&baseline, &target);
        assert_eq!(delta.ops, vec![DeltaOp::Remove { entity: 2 }]);
    }

    #[test]
    fn decode_reconstructs_target() {
        let baseline = snapshot(4, &[entity(1, 0.0, 0.0, 100.0), entity(3, 9.0, 9.0, 40.0)]);
        let mut moved = entity(1, 2.345, -7.5, 64.2);
        moved.orientation = 1.57;
        moved.velocity = Vec2::new(3.0, -1.0);
        let target = snapshot(9, &[moved, entity(5, 1.0, 1.0, 100.0)]);

        let delta = encode(&baseline, &target);
        assert_eq!(decode(&baseline, &delta).unwrap(), target);
    }

    #[test]
    fn decode_from_empty_baseline_is_full_state() {
        let baseline = Snapshot::empty(0, 0);
        let target = snapshot(1, &[entity(1, 1.0, 2.0, 3.0), entity(2, 4.0, 5.0, 6.0)]);
        let delta = encode(&baseline, &target);
        assert_eq!(decode(&baseline, &delta).unwrap(), target);
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let baseline = snapshot(1, &[entity(1, 0.0, 0.0, 100.0), entity(2, 1.0, 1.0, 20.0)]);
        let target = snapshot(2, &[entity(1, 5.0, 0.0, 80.0), entity(3, 1.0, 1.0, 50.0)]);
        let delta = encode(&baseline, &target);

        let mut once = baseline.clone();
        apply(&mut once, &delta).unwrap();
        let mut twice = once.clone();
        apply(&mut twice, &delta).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn decode_rejects_wrong_baseline() {
        let baseline = snapshot(1, &[]);
        let other = snapshot(2, &[]);
        let target = snapshot(3, &[]);
        let delta = encode(&baseline, &target);
        assert_eq!(
            decode(&other, &delta).unwrap_err(),
            DeltaError::BaselineMismatch {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn replicate_falls_back_to_full_when_baseline_evicted() {
        let mut store = SnapshotStore::new(2);
        for tick in 1..=5 {
            store.push(snapshot(tick, &[entity(1, tick as f32, 0.0, 100.0)])).unwrap();
        }
        let target = store.latest().unwrap();

        assert!(matches!(replicate(&store, None, &target), Replication::Full(_)));
        assert!(matches!(replicate(&store, Some(1), &target), Replication::Full(_)));
        match replicate(&store, Some(4), &target) {
            Replication::Delta(delta) => assert_eq!(delta.baseline_tick, 4),
            other => panic!("expected delta, got {other:?}"),
        }
    }
}
