//! Combat system - weapons, damage, hit-scan geometry

use serde::{Deserialize, Serialize};

use super::entity::{EntityId, Vec2};

/// Hit-scan weapons a command can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WeaponKind {
    /// Balanced automatic
    Rifle = 0,
    /// Slow, high damage
    Marksman = 1,
    /// Fast, low damage
    Sidearm = 2,
}

impl WeaponKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Rifle),
            1 => Some(Self::Marksman),
            2 => Some(Self::Sidearm),
            _ => None,
        }
    }
}

/// Weapon stats per weapon kind
#[derive(Debug, Clone, Copy)]
pub struct WeaponStats {
    /// Damage per body hit
    pub damage: f32,
    /// Damage multiplier for a headshot
    pub headshot_multiplier: f32,
    /// Minimum interval between shots (milliseconds)
    pub min_interval_ms: u64,
    /// Maximum hit-scan range
    pub range: f32,
}

impl WeaponStats {
    pub fn for_kind(kind: WeaponKind) -> Self {
        match kind {
            WeaponKind::Rifle => Self {
                damage: 20.0,
                headshot_multiplier: 2.0,
                min_interval_ms: 100,
                range: 80.0,
            },
            WeaponKind::Marksman => Self {
                damage: 55.0,
                headshot_multiplier: 2.5,
                min_interval_ms: 900,
                range: 150.0,
            },
            WeaponKind::Sidearm => Self {
                damage: 12.0,
                headshot_multiplier: 1.5,
                min_interval_ms: 150,
                range: 40.0,
            },
        }
    }

    /// Largest damage one shot can legitimately deal
    pub fn max_damage_per_shot(&self) -> f32 {
        self.damage * self.headshot_multiplier
    }

    /// Damage for a confirmed hit
    pub fn damage_for(&self, headshot: bool) -> f32 {
        if headshot {
            self.damage * self.headshot_multiplier
        } else {
            self.damage
        }
    }
}

/// Combat helpers
pub struct CombatSystem;

impl CombatSystem {
    /// Apply damage to health, returns (new_health, is_dead)
    pub fn apply_damage(current_health: f32, damage: f32) -> (f32, bool) {
        let new_health = (current_health - damage).max(0.0);
        (new_health, new_health <= 0.0)
    }

    /// Distance along a ray to a circular hitbox, with the closest approach of
    /// the ray to the circle centre. `direction` must be a unit vector.
    pub fn ray_circle(origin: Vec2, direction: Vec2, center: Vec2, radius: f32) -> Option<(f32, f32)> {
        let to_center = center - origin;
        let along = to_center.dot(direction);
        if along < 0.0 {
            return None; // Behind the shooter
        }
        let closest_sq = to_center.dot(to_center) - along * along;
        let radius_sq = radius * radius;
        if closest_sq > radius_sq {
            return None;
        }
        let entry = along - (radius_sq - closest_sq).sqrt();
        Some((entry.max(0.0), closest_sq.max(0.0).sqrt()))
    }
}

/// Hit result from combat resolution
#[derive(Debug, Clone, PartialEq)]
pub struct HitResult {
    pub shooter: EntityId,
    pub target: EntityId,
    pub weapon: WeaponKind,
    pub damage: f32,
    pub headshot: bool,
    pub distance: f32,
    pub target_killed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn damage_never_goes_negative() {
        assert_eq!(CombatSystem::apply_damage(10.0, 25.0), (0.0, true));
        assert_eq!(CombatSystem::apply_damage(100.0, 20.0), (80.0, false));
    }

    #[test]
    fn ray_circle_reports_entry_and_offset() {
        let (entry, offset) =
            CombatSystem::ray_circle(Vec2::ZERO, Vec2::new(1.0, 0.0), Vec2::new(10.0, 0.3), 1.0)
                .unwrap();
        assert!((offset - 0.3).abs() < 1e-5);
        assert!(entry < 10.0 && entry > 9.0);

        assert!(CombatSystem::ray_circle(Vec2::ZERO, Vec2::new(1.0, 0.0), Vec2::new(10.0, 2.0), 1.0)
            .is_none());
        assert!(CombatSystem::ray_circle(Vec2::ZERO, Vec2::new(1.0, 0.0), Vec2::new(-10.0, 0.0), 1.0)
            .is_none());
    }

    #[test]
    fn headshot_is_the_per_shot_ceiling() {
        let stats = WeaponStats::for_kind(WeaponKind::Rifle);
        assert_eq!(stats.damage_for(true), stats.max_damage_per_shot());
        assert!(stats.damage_for(false) < stats.max_damage_per_shot());
    }
}
