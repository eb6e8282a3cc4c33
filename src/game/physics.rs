//! Entity movement and collision constraints

use super::entity::{EntityState, Vec2};
use super::providers::LevelGeometry;

/// Velocity retained per tick by an entity that received no movement input
pub const IDLE_VELOCITY_RETAIN: f32 = 0.5;

/// Physics system for moving entities inside the level
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Move an entity by an already-validated displacement.
    /// Velocity is derived from the displacement actually applied.
    pub fn apply_displacement(
        entity: &mut EntityState,
        displacement: Vec2,
        dt: f32,
        geometry: &dyn LevelGeometry,
    ) {
        let before = entity.position;
        entity.position = geometry.clamp(before + displacement);

        let moved = entity.position - before;
        entity.velocity = moved * (1.0 / dt);
        if let Some(dir) = moved.normalized() {
            entity.orientation = dir.y.atan2(dir.x).rem_euclid(std::f32::consts::TAU);
        }
    }

    /// Decay velocity of an entity that did not move this tick
    pub fn settle(entity: &mut EntityState) {
        entity.velocity = entity.velocity * IDLE_VELOCITY_RETAIN;
        if entity.velocity.length() < 0.01 {
            entity.velocity = Vec2::ZERO;
        }
    }

    /// Check collision between two circular bodies
    pub fn check_collision(a: Vec2, radius_a: f32, b: Vec2, radius_b: f32) -> bool {
        let combined = radius_a + radius_b;
        let d = b - a;
        d.dot(d) <= combined * combined
    }

    /// Resolve collision between two bodies (pushes them apart evenly).
    /// Returns the new positions.
    pub fn resolve_collision(a: Vec2, radius_a: f32, b: Vec2, radius_b: f32) -> (Vec2, Vec2) {
        let d = b - a;
        let dist = d.length();

        if dist < 0.001 {
            // Same position, push apart arbitrarily
            return (
                Vec2::new(a.x - radius_a, a.y),
                Vec2::new(b.x + radius_b, b.y),
            );
        }

        let overlap = radius_a + radius_b - dist;
        if overlap <= 0.0 {
            return (a, b);
        }

        let normal = d * (1.0 / dist);
        let push = overlap / 2.0;
        (a - normal * push, b + normal * push)
    }
}
