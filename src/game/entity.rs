//! Replicated entity schema
//!
//! Every entity carries the same fixed set of fields. Each field has a
//! compile-time [`FieldId`] so the delta codec can address it without any
//! runtime schema lookup.

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// Stable entity identifier. Zero is reserved as "no entity" on the wire.
pub type EntityId = u32;

/// Replicated float fields are quantized to 1 / FLOAT_STEPS_PER_UNIT.
pub const FLOAT_STEPS_PER_UNIT: f32 = 100.0;

/// Entity flag bits
pub mod flags {
    /// Entity is alive and can act
    pub const ALIVE: u8 = 1 << 0;
    /// Entity is parked: non-colliding, non-damaging, ignored by hit detection
    pub const PARKED: u8 = 1 << 1;
}

/// 2D vector used for positions, velocities and aim directions
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn dot(self, other: Vec2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    pub fn distance(self, other: Vec2) -> f32 {
        (other - self).length()
    }

    /// Unit vector in the same direction, or `None` for a (near) zero vector
    pub fn normalized(self) -> Option<Vec2> {
        let len = self.length();
        if len < 1e-6 {
            None
        } else {
            Some(Vec2::new(self.x / len, self.y / len))
        }
    }

    /// Scale down so the length does not exceed `max`
    pub fn clamp_length(self, max: f32) -> Vec2 {
        let len = self.length();
        if len > max && len > 0.0 {
            self * (max / len)
        } else {
            self
        }
    }

    pub fn lerp(self, other: Vec2, t: f32) -> Vec2 {
        self + (other - self) * t
    }

    pub fn quantized(self) -> Vec2 {
        Vec2::new(quantize(self.x), quantize(self.y))
    }
}

impl Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;
    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// Round a float to the replication quantum
pub fn quantize(value: f32) -> f32 {
    quantum_key(value) as f32 / FLOAT_STEPS_PER_UNIT
}

/// Integer key of a float at replication precision. Two values with the same
/// key are the same value once replicated.
pub fn quantum_key(value: f32) -> i64 {
    (value * FLOAT_STEPS_PER_UNIT).round() as i64
}

/// Entity archetype, supplied by the content provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Archetype(pub u8);

impl Archetype {
    pub const SOLDIER: Archetype = Archetype(1);
}

/// Compile-time identifiers of the replicated fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FieldId {
    Archetype = 0,
    Position = 1,
    Velocity = 2,
    Health = 3,
    Orientation = 4,
    Flags = 5,
}

impl FieldId {
    pub const ALL: [FieldId; 6] = [
        FieldId::Archetype,
        FieldId::Position,
        FieldId::Velocity,
        FieldId::Health,
        FieldId::Orientation,
        FieldId::Flags,
    ];

    pub fn from_u8(raw: u8) -> Option<FieldId> {
        FieldId::ALL.get(raw as usize).copied()
    }
}

/// Typed value of one replicated field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Byte(u8),
    Scalar(f32),
    Vector(Vec2),
}

/// Authoritative state of one entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    pub id: EntityId,
    pub archetype: Archetype,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: f32,
    pub orientation: f32,
    pub flags: u8,
}

impl EntityState {
    /// An entity with every field at its zero value. Delta decoding starts
    /// from this when an entity appears that the baseline did not have.
    pub fn blank(id: EntityId) -> Self {
        Self {
            id,
            archetype: Archetype::default(),
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            health: 0.0,
            orientation: 0.0,
            flags: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.flags & flags::ALIVE != 0
    }

    pub fn is_parked(&self) -> bool {
        self.flags & flags::PARKED != 0
    }

    /// Alive and not parked: can collide, be hit and deal damage
    pub fn is_targetable(&self) -> bool {
        self.is_alive() && !self.is_parked()
    }

    pub fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn field(&self, field: FieldId) -> FieldValue {
        match field {
            FieldId::Archetype => FieldValue::Byte(self.archetype.0),
            FieldId::Position => FieldValue::Vector(self.position),
            FieldId::Velocity => FieldValue::Vector(self.velocity),
            FieldId::Health => FieldValue::Scalar(self.health),
            FieldId::Orientation => FieldValue::Scalar(self.orientation),
            FieldId::Flags => FieldValue::Byte(self.flags),
        }
    }

    /// Write a field. Returns false when the value type does not match the field.
    pub fn set_field(&mut self, field: FieldId, value: FieldValue) -> bool {
        match (field, value) {
            (FieldId::Archetype, FieldValue::Byte(b)) => self.archetype = Archetype(b),
            (FieldId::Position, FieldValue::Vector(v)) => self.position = v,
            (FieldId::Velocity, FieldValue::Vector(v)) => self.velocity = v,
            (FieldId::Health, FieldValue::Scalar(s)) => self.health = s,
            (FieldId::Orientation, FieldValue::Scalar(s)) => self.orientation = s,
            (FieldId::Flags, FieldValue::Byte(b)) => self.flags = b,
            _ => return false,
        }
        true
    }

    /// Copy with every float field rounded to replication precision
    pub fn quantized(&self) -> Self {
        Self {
            position: self.position.quantized(),
            velocity: self.velocity.quantized(),
            health: quantize(self.health),
            orientation: quantize(self.orientation),
            ..*self
        }
    }
}

/// Field equality at replication precision
pub fn field_changed(old: FieldValue, new: FieldValue) -> bool {
    match (old, new) {
        (FieldValue::Byte(a), FieldValue::Byte(b)) => a != b,
        (FieldValue::Scalar(a), FieldValue::Scalar(b)) => quantum_key(a) != quantum_key(b),
        (FieldValue::Vector(a), FieldValue::Vector(b)) => {
            quantum_key(a.x) != quantum_key(b.x) || quantum_key(a.y) != quantum_key(b.y)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_noise_below_quantum_is_not_a_change() {
        let a = FieldValue::Scalar(80.0);
        let b = FieldValue::Scalar(80.001);
        assert!(!field_changed(a, b));
        assert!(field_changed(a, FieldValue::Scalar(80.02)));
    }

    #[test]
    fn set_field_rejects_mismatched_type() {
        let mut e = EntityState::blank(1);
        assert!(!e.set_field(FieldId::Health, FieldValue::Byte(3)));
        assert!(e.set_field(FieldId::Health, FieldValue::Scalar(50.0)));
        assert_eq!(e.health, 50.0);
    }

    #[test]
    fn quantize_is_idempotent() {
        let v = quantize(3.14159);
        assert_eq!(quantize(v), v);
    }

    #[test]
    fn clamp_length_preserves_direction() {
        let v = Vec2::new(2.0, 0.0).clamp_length(1.2);
        assert!((v.x - 1.2).abs() < 1e-6);
        assert_eq!(v.y, 0.0);
    }
}
