//! External collaborators the simulation calls out to
//!
//! Level geometry and entity content are supplied by systems outside this
//! crate. Both are called synchronously from the tick loop, may fail, and are
//! never retried.

use std::f32::consts::TAU;

use crate::error::Severity;

use super::entity::{flags, Archetype, EntityId, EntityState, Vec2};
use super::rules::TeamId;

/// Collaborator failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown archetype {0:?}")]
    UnknownArchetype(Archetype),

    #[error("no spawn point available for team {0}")]
    NoSpawnPoint(TeamId),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn severity(&self) -> Severity {
        Severity::Transient
    }
}

/// Static collision data loaded once per match
pub trait LevelGeometry: Send + Sync {
    /// Distance along `direction` (unit vector) to the first static obstacle
    /// within `max_distance`, if any.
    fn raycast(&self, origin: Vec2, direction: Vec2, max_distance: f32) -> Option<f32>;

    /// Keep a position inside the playable area
    fn clamp(&self, position: Vec2) -> Vec2;
}

/// Per-archetype values the simulation needs from content
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchetypeSpec {
    pub max_health: f32,
    /// Body hitbox radius
    pub hitbox_radius: f32,
    /// Rays passing within this distance of the centre count as headshots
    pub head_radius: f32,
}

/// Content provider for the entity schema and spawns
pub trait EntityFactory: Send + Sync {
    fn archetype(&self, archetype: Archetype) -> Result<ArchetypeSpec, ProviderError>;

    /// Build a freshly spawned entity. `index` distinguishes spawns within a team.
    fn spawn(
        &self,
        id: EntityId,
        archetype: Archetype,
        team: TeamId,
        index: usize,
    ) -> Result<EntityState, ProviderError>;
}

/// Wall segment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wall {
    pub a: Vec2,
    pub b: Vec2,
}

/// Square arena centred on the origin with optional interior walls
#[derive(Debug, Clone)]
pub struct WalledArena {
    half_extent: f32,
    walls: Vec<Wall>,
}

impl WalledArena {
    pub fn new(half_extent: f32, walls: Vec<Wall>) -> Self {
        Self { half_extent, walls }
    }

    pub fn open(half_extent: f32) -> Self {
        Self::new(half_extent, Vec::new())
    }

    pub fn half_extent(&self) -> f32 {
        self.half_extent
    }
}

impl Default for WalledArena {
    fn default() -> Self {
        Self::open(100.0)
    }
}

impl LevelGeometry for WalledArena {
    fn raycast(&self, origin: Vec2, direction: Vec2, max_distance: f32) -> Option<f32> {
        self.walls
            .iter()
            .filter_map(|wall| ray_segment(origin, direction, wall.a, wall.b))
            .filter(|&t| t <= max_distance)
            .fold(None, |nearest: Option<f32>, t| Some(nearest.map_or(t, |n| n.min(t))))
    }

    fn clamp(&self, position: Vec2) -> Vec2 {
        Vec2::new(
            position.x.clamp(-self.half_extent, self.half_extent),
            position.y.clamp(-self.half_extent, self.half_extent),
        )
    }
}

/// Ray/segment intersection distance along the ray
fn ray_segment(origin: Vec2, direction: Vec2, a: Vec2, b: Vec2) -> Option<f32> {
    let edge = b - a;
    let denom = direction.x * edge.y - direction.y * edge.x;
    if denom.abs() < 1e-9 {
        return None; // Parallel
    }
    let to_a = a - origin;
    let t = (to_a.x * edge.y - to_a.y * edge.x) / denom;
    let u = (to_a.x * direction.y - to_a.y * direction.x) / denom;
    if t >= 0.0 && (0.0..=1.0).contains(&u) {
        Some(t)
    } else {
        None
    }
}

/// Default content: one soldier archetype, spawns on a ring per team
#[derive(Debug, Clone)]
pub struct ArenaEntityFactory {
    spawn_radius: f32,
    soldier: ArchetypeSpec,
}

impl ArenaEntityFactory {
    pub fn new(spawn_radius: f32) -> Self {
        Self {
            spawn_radius,
            soldier: ArchetypeSpec {
                max_health: 100.0,
                hitbox_radius: 0.6,
                head_radius: 0.15,
            },
        }
    }
}

impl Default for ArenaEntityFactory {
    fn default() -> Self {
        Self::new(40.0)
    }
}

impl EntityFactory for ArenaEntityFactory {
    fn archetype(&self, archetype: Archetype) -> Result<ArchetypeSpec, ProviderError> {
        if archetype == Archetype::SOLDIER {
            Ok(self.soldier)
        } else {
            Err(ProviderError::UnknownArchetype(archetype))
        }
    }

    fn spawn(
        &self,
        id: EntityId,
        archetype: Archetype,
        team: TeamId,
        index: usize,
    ) -> Result<EntityState, ProviderError> {
        let spec = self.archetype(archetype)?;

        // Teams face each other across the arena; members fan out around their side
        let team_angle = team as f32 * std::f32::consts::PI;
        let angle = (team_angle + index as f32 * 0.35).rem_euclid(TAU);
        let position = Vec2::new(angle.cos(), angle.sin()) * self.spawn_radius;
        let orientation = (angle + std::f32::consts::PI).rem_euclid(TAU);

        Ok(EntityState {
            id,
            archetype,
            position,
            velocity: Vec2::ZERO,
            health: spec.max_health,
            orientation,
            flags: flags::ALIVE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raycast_reports_nearest_wall() {
        let arena = WalledArena::new(
            50.0,
            vec![
                Wall { a: Vec2::new(10.0, -5.0), b: Vec2::new(10.0, 5.0) },
                Wall { a: Vec2::new(4.0, -5.0), b: Vec2::new(4.0, 5.0) },
            ],
        );
        let hit = arena.raycast(Vec2::ZERO, Vec2::new(1.0, 0.0), 100.0).unwrap();
        assert!((hit - 4.0).abs() < 1e-5);
        assert_eq!(arena.raycast(Vec2::ZERO, Vec2::new(-1.0, 0.0), 100.0), None);
        assert_eq!(arena.raycast(Vec2::ZERO, Vec2::new(1.0, 0.0), 3.0), None);
    }

    #[test]
    fn clamp_keeps_positions_inside() {
        let arena = WalledArena::open(10.0);
        assert_eq!(arena.clamp(Vec2::new(12.0, -30.0)), Vec2::new(10.0, -10.0));
    }

    #[test]
    fn unknown_archetype_is_an_error() {
        let factory = ArenaEntityFactory::default();
        assert_eq!(
            factory.spawn(1, Archetype(9), 0, 0).unwrap_err(),
            ProviderError::UnknownArchetype(Archetype(9))
        );
        let soldier = factory.spawn(1, Archetype::SOLDIER, 1, 0).unwrap();
        assert!(soldier.is_alive());
        assert_eq!(soldier.health, 100.0);
    }
}
