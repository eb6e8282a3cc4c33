//! Snapshot materialization and the circular snapshot store

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Severity;
use crate::util::time::Tick;

use super::entity::{EntityId, EntityState};

/// Immutable world state at one tick
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: Tick,
    /// Wall-clock time the tick was materialized (unix millis)
    pub timestamp_ms: u64,
    pub entities: BTreeMap<EntityId, EntityState>,
}

impl Snapshot {
    pub fn empty(tick: Tick, timestamp_ms: u64) -> Self {
        Self {
            tick,
            timestamp_ms,
            entities: BTreeMap::new(),
        }
    }

    /// Materialize a snapshot from live entity state, quantizing float fields
    pub fn materialize<'a>(
        tick: Tick,
        timestamp_ms: u64,
        entities: impl IntoIterator<Item = &'a EntityState>,
    ) -> Self {
        Self {
            tick,
            timestamp_ms,
            entities: entities.into_iter().map(|e| (e.id, e.quantized())).collect(),
        }
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Snapshot store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("tick {0} has been evicted from the snapshot store")]
    Evicted(Tick),

    #[error("tick {0} has not been recorded yet")]
    NotRecorded(Tick),

    #[error("snapshot tick {pushed} does not follow latest tick {latest}")]
    NonMonotonic { latest: Tick, pushed: Tick },
}

impl SnapshotError {
    pub fn severity(&self) -> Severity {
        match self {
            SnapshotError::Evicted(_) | SnapshotError::NotRecorded(_) => Severity::Transient,
            SnapshotError::NonMonotonic { .. } => Severity::Fatal,
        }
    }
}

/// Fixed-capacity ring of the most recent snapshots, keyed by tick
pub struct SnapshotStore {
    slots: Vec<Option<Arc<Snapshot>>>,
    latest: Option<Tick>,
    len: usize,
}

impl SnapshotStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            latest: None,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.latest
    }

    /// Oldest tick still resident
    pub fn oldest_tick(&self) -> Option<Tick> {
        self.latest
            .map(|latest| latest.saturating_sub(self.len.saturating_sub(1) as Tick))
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.and_then(|tick| self.get(tick).ok())
    }

    pub fn oldest(&self) -> Option<Arc<Snapshot>> {
        self.oldest_tick().and_then(|tick| self.get(tick).ok())
    }

    /// Push the next snapshot, evicting the oldest when full. Ticks must strictly
    /// increase and be contiguous so the resident window stays gap-free.
    pub fn push(&mut self, snapshot: Snapshot) -> Result<Arc<Snapshot>, SnapshotError> {
        if let Some(latest) = self.latest {
            if latest.checked_add(1) != Some(snapshot.tick) {
                return Err(SnapshotError::NonMonotonic {
                    latest,
                    pushed: snapshot.tick,
                });
            }
        }

        let tick = snapshot.tick;
        let snapshot = Arc::new(snapshot);
        let idx = self.slot(tick);
        self.slots[idx] = Some(snapshot.clone());
        self.latest = Some(tick);
        self.len = (self.len + 1).min(self.slots.len());
        Ok(snapshot)
    }

    /// Exact-tick lookup. An aged-out tick is reported as evicted, never served stale.
    pub fn get(&self, tick: Tick) -> Result<Arc<Snapshot>, SnapshotError> {
        let (latest, oldest) = match (self.latest, self.oldest_tick()) {
            (Some(latest), Some(oldest)) => (latest, oldest),
            _ => return Err(SnapshotError::NotRecorded(tick)),
        };
        if tick > latest {
            return Err(SnapshotError::NotRecorded(tick));
        }
        if tick < oldest {
            return Err(SnapshotError::Evicted(tick));
        }

        match &self.slots[self.slot(tick)] {
            Some(snapshot) if snapshot.tick == tick => Ok(snapshot.clone()),
            _ => Err(SnapshotError::Evicted(tick)),
        }
    }

    fn slot(&self, tick: Tick) -> usize {
        tick as usize % self.slots.len()
    }
}

/// Replication statistics for the match summary
#[derive(Debug, Default, Clone)]
pub struct ReplicationStats {
    pub full_snapshots: u64,
    pub deltas: u64,
    pub total_bytes: u64,
    pub avg_entities_per_snapshot: f32,
    snapshots_seen: u64,
}

impl ReplicationStats {
    pub fn record_snapshot(&mut self, entity_count: usize) {
        self.snapshots_seen += 1;

        // Running average
        let n = self.snapshots_seen as f32;
        self.avg_entities_per_snapshot =
            self.avg_entities_per_snapshot * ((n - 1.0) / n) + (entity_count as f32 / n);
    }

    pub fn record_full(&mut self, bytes: usize) {
        self.full_snapshots += 1;
        self.total_bytes += bytes as u64;
    }

    pub fn record_delta(&mut self, bytes: usize) {
        self.deltas += 1;
        self.total_bytes += bytes as u64;
    }
}
