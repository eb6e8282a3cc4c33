//! Binary wire protocol for client-server communication
//!
//! Every message is one WebSocket binary frame, big-endian:
//!
//! ```text
//! ┌────────────┬──────┬─────────────────────────────────────┐
//! │ type       │ u8   │ message type code                   │
//! ├────────────┼──────┼─────────────────────────────────────┤
//! │ number     │ u32  │ tick or sequence, per message type  │
//! ├────────────┼──────┼─────────────────────────────────────┤
//! │ payload    │ [u8] │ type-specific                       │
//! └────────────┴──────┴─────────────────────────────────────┘
//! ```
//!
//! Entity record: id u32, archetype u8, position 2×f32, velocity 2×f32,
//! health f32, orientation f32, flags u8.
//! Delta triple: entity u32, field u8, value typed by field; field `0xFF`
//! marks a removal and carries no value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::Severity;
use crate::game::combat::WeaponKind;
use crate::game::delta::{Delta, DeltaOp};
use crate::game::entity::{Archetype, EntityId, EntityState, FieldId, FieldValue, Vec2};
use crate::game::snapshot::Snapshot;
use crate::game::Action;
use crate::session::SessionId;
use crate::util::time::Tick;

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Type byte plus the u32 tick/sequence number
pub const HEADER_SIZE: usize = 5;

const ENTITY_RECORD_SIZE: usize = 4 + 1 + 8 + 8 + 4 + 4 + 1;
const REMOVE_FIELD: u8 = 0xFF;

const ACTION_MOVE: u8 = 0;
const ACTION_FIRE: u8 = 1;

/// Message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Welcome = 0x02,
    Command = 0x03,
    FullSnapshot = 0x04,
    Delta = 0x05,
    Ack = 0x06,
    Heartbeat = 0x07,
    Disconnect = 0x08,
}

impl MessageType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::Hello,
            0x02 => Self::Welcome,
            0x03 => Self::Command,
            0x04 => Self::FullSnapshot,
            0x05 => Self::Delta,
            0x06 => Self::Ack,
            0x07 => Self::Heartbeat,
            0x08 => Self::Disconnect,
            _ => return None,
        })
    }
}

/// Wire decoding failures. Any of these disconnects the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message truncated: need {need} more bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("unknown action tag {0}")]
    UnknownAction(u8),

    #[error("unknown weapon {0}")]
    UnknownWeapon(u8),

    #[error("unknown field id {0}")]
    UnknownField(u8),

    #[error("non-finite float in {0}")]
    NonFinite(&'static str),

    #[error("protocol version mismatch: server speaks {expected}, client sent {found}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("invalid UTF-8 in disconnect reason")]
    InvalidUtf8,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("unexpected {0:?} message")]
    Unexpected(MessageType),
}

impl ProtocolError {
    pub fn severity(&self) -> Severity {
        Severity::Protocol
    }
}

/// Handshake opener sent by the client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hello {
    pub version: u16,
    pub player_id: Uuid,
    pub interp_delay_ms: u16,
    /// Session to resume after a dropped connection
    pub resume_session: Option<SessionId>,
}

/// Handshake reply sent by the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Welcome {
    pub tick: Tick,
    pub session: SessionId,
    pub tick_rate: u16,
    pub interp_delay_ms: u16,
    pub entity: EntityId,
}

/// Every message of the protocol, in both directions
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Command {
        sequence: u32,
        client_tick: Tick,
        action: Action,
    },
    FullSnapshot {
        snapshot: Snapshot,
        last_command_seq: u32,
    },
    Delta {
        delta: Delta,
        last_command_seq: u32,
    },
    Ack {
        tick: Tick,
    },
    /// Sent by either side; the receiver echoes a non-echo heartbeat back
    Heartbeat {
        sequence: u32,
        origin_ms: u64,
        echo: bool,
    },
    Disconnect {
        reason: String,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Welcome(_) => MessageType::Welcome,
            Message::Command { .. } => MessageType::Command,
            Message::FullSnapshot { .. } => MessageType::FullSnapshot,
            Message::Delta { .. } => MessageType::Delta,
            Message::Ack { .. } => MessageType::Ack,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::Disconnect { .. } => MessageType::Disconnect,
        }
    }

    /// Serialize to one binary frame
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Hello(hello) => {
                let mut buf = header(MessageType::Hello, 0, 2 + 16 + 2 + 4);
                buf.put_u16(hello.version);
                buf.put_slice(hello.player_id.as_bytes());
                buf.put_u16(hello.interp_delay_ms);
                buf.put_u32(hello.resume_session.unwrap_or(0));
                buf.freeze()
            }
            Message::Welcome(welcome) => {
                let mut buf = header(MessageType::Welcome, welcome.tick, 4 + 2 + 2 + 4);
                buf.put_u32(welcome.session);
                buf.put_u16(welcome.tick_rate);
                buf.put_u16(welcome.interp_delay_ms);
                buf.put_u32(welcome.entity);
                buf.freeze()
            }
            Message::Command {
                sequence,
                client_tick,
                action,
            } => {
                let mut buf = header(MessageType::Command, *sequence, 4 + 1 + 21);
                buf.put_u32(*client_tick);
                put_action(&mut buf, action);
                buf.freeze()
            }
            Message::FullSnapshot {
                snapshot,
                last_command_seq,
            } => encode_full_snapshot(snapshot, *last_command_seq),
            Message::Delta {
                delta,
                last_command_seq,
            } => encode_delta(delta, *last_command_seq),
            Message::Ack { tick } => header(MessageType::Ack, *tick, 0).freeze(),
            Message::Heartbeat {
                sequence,
                origin_ms,
                echo,
            } => {
                let mut buf = header(MessageType::Heartbeat, *sequence, 9);
                buf.put_u64(*origin_ms);
                buf.put_u8(u8::from(*echo));
                buf.freeze()
            }
            Message::Disconnect { reason } => encode_disconnect(reason),
        }
    }

    /// Parse one binary frame
    pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
        let mut buf = frame;
        need(&buf, HEADER_SIZE)?;
        let raw_type = buf.get_u8();
        let message_type = MessageType::from_u8(raw_type).ok_or(ProtocolError::UnknownType(raw_type))?;
        let number = buf.get_u32();

        let message = match message_type {
            MessageType::Hello => {
                need(&buf, 2 + 16 + 2 + 4)?;
                let version = buf.get_u16();
                let mut raw_id = [0u8; 16];
                buf.copy_to_slice(&mut raw_id);
                let interp_delay_ms = buf.get_u16();
                let resume = buf.get_u32();
                Message::Hello(Hello {
                    version,
                    player_id: Uuid::from_bytes(raw_id),
                    interp_delay_ms,
                    resume_session: (resume != 0).then_some(resume),
                })
            }
            MessageType::Welcome => {
                need(&buf, 4 + 2 + 2 + 4)?;
                Message::Welcome(Welcome {
                    tick: number,
                    session: buf.get_u32(),
                    tick_rate: buf.get_u16(),
                    interp_delay_ms: buf.get_u16(),
                    entity: buf.get_u32(),
                })
            }
            MessageType::Command => {
                need(&buf, 4)?;
                let client_tick = buf.get_u32();
                let action = get_action(&mut buf)?;
                Message::Command {
                    sequence: number,
                    client_tick,
                    action,
                }
            }
            MessageType::FullSnapshot => {
                need(&buf, 8 + 4 + 4)?;
                let timestamp_ms = buf.get_u64();
                let last_command_seq = buf.get_u32();
                let count = buf.get_u32() as usize;
                need(&buf, count.saturating_mul(ENTITY_RECORD_SIZE))?;

                let mut snapshot = Snapshot::empty(number, timestamp_ms);
                for _ in 0..count {
                    let entity = get_entity(&mut buf)?;
                    snapshot.entities.insert(entity.id, entity);
                }
                Message::FullSnapshot {
                    snapshot,
                    last_command_seq,
                }
            }
            MessageType::Delta => {
                need(&buf, 4 + 8 + 4 + 4)?;
                let baseline_tick = buf.get_u32();
                let target_timestamp_ms = buf.get_u64();
                let last_command_seq = buf.get_u32();
                let count = buf.get_u32() as usize;
                // Every op is at least entity + field
                need(&buf, count.saturating_mul(5))?;

                let mut ops = Vec::with_capacity(count);
                for _ in 0..count {
                    ops.push(get_op(&mut buf)?);
                }
                Message::Delta {
                    delta: Delta {
                        baseline_tick,
                        target_tick: number,
                        target_timestamp_ms,
                        ops,
                    },
                    last_command_seq,
                }
            }
            MessageType::Ack => Message::Ack { tick: number },
            MessageType::Heartbeat => {
                need(&buf, 9)?;
                Message::Heartbeat {
                    sequence: number,
                    origin_ms: buf.get_u64(),
                    echo: buf.get_u8() != 0,
                }
            }
            MessageType::Disconnect => {
                need(&buf, 2)?;
                let len = buf.get_u16() as usize;
                need(&buf, len)?;
                let reason = std::str::from_utf8(&buf[..len])
                    .map_err(|_| ProtocolError::InvalidUtf8)?
                    .to_owned();
                buf.advance(len);
                Message::Disconnect { reason }
            }
        };

        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }
}

/// Encode a full snapshot without cloning it into a [`Message`]
pub fn encode_full_snapshot(snapshot: &Snapshot, last_command_seq: u32) -> Bytes {
    let mut buf = header(
        MessageType::FullSnapshot,
        snapshot.tick,
        8 + 4 + 4 + snapshot.len() * ENTITY_RECORD_SIZE,
    );
    buf.put_u64(snapshot.timestamp_ms);
    buf.put_u32(last_command_seq);
    buf.put_u32(snapshot.len() as u32);
    for entity in snapshot.entities.values() {
        put_entity(&mut buf, entity);
    }
    buf.freeze()
}

/// Encode a delta without cloning it into a [`Message`]
pub fn encode_delta(delta: &Delta, last_command_seq: u32) -> Bytes {
    let mut buf = header(MessageType::Delta, delta.target_tick, 4 + 8 + 4 + 4 + delta.ops.len() * 13);
    buf.put_u32(delta.baseline_tick);
    buf.put_u64(delta.target_timestamp_ms);
    buf.put_u32(last_command_seq);
    buf.put_u32(delta.ops.len() as u32);
    for op in &delta.ops {
        match *op {
            DeltaOp::Set { entity, field, value } => {
                buf.put_u32(entity);
                buf.put_u8(field as u8);
                put_value(&mut buf, value);
            }
            DeltaOp::Remove { entity } => {
                buf.put_u32(entity);
                buf.put_u8(REMOVE_FIELD);
            }
        }
    }
    buf.freeze()
}

pub fn encode_disconnect(reason: &str) -> Bytes {
    // Reasons are diagnostics; cut at a char boundary if absurdly long
    let mut end = reason.len().min(u16::MAX as usize);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let reason = &reason[..end];
    let mut buf = header(MessageType::Disconnect, 0, 2 + reason.len());
    buf.put_u16(reason.len() as u16);
    buf.put_slice(reason.as_bytes());
    buf.freeze()
}

fn header(message_type: MessageType, number: u32, payload_hint: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_hint);
    buf.put_u8(message_type as u8);
    buf.put_u32(number);
    buf
}

fn need(buf: &&[u8], n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated {
            need: n,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn put_vec2(buf: &mut BytesMut, v: Vec2) {
    buf.put_f32(v.x);
    buf.put_f32(v.y);
}

fn get_f32(buf: &mut &[u8], what: &'static str) -> Result<f32, ProtocolError> {
    need(buf, 4)?;
    let value = buf.get_f32();
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ProtocolError::NonFinite(what))
    }
}

fn get_vec2(buf: &mut &[u8], what: &'static str) -> Result<Vec2, ProtocolError> {
    Ok(Vec2::new(get_f32(buf, what)?, get_f32(buf, what)?))
}

fn put_action(buf: &mut BytesMut, action: &Action) {
    match *action {
        Action::Move { displacement } => {
            buf.put_u8(ACTION_MOVE);
            put_vec2(buf, displacement);
        }
        Action::Fire {
            weapon,
            direction,
            claimed_damage,
            target,
        } => {
            buf.put_u8(ACTION_FIRE);
            buf.put_u8(weapon as u8);
            put_vec2(buf, direction);
            buf.put_f32(claimed_damage);
            buf.put_u32(target.unwrap_or(0));
        }
    }
}

fn get_action(buf: &mut &[u8]) -> Result<Action, ProtocolError> {
    need(buf, 1)?;
    match buf.get_u8() {
        ACTION_MOVE => Ok(Action::Move {
            displacement: get_vec2(buf, "displacement")?,
        }),
        ACTION_FIRE => {
            need(buf, 1)?;
            let raw_weapon = buf.get_u8();
            let weapon = WeaponKind::from_u8(raw_weapon).ok_or(ProtocolError::UnknownWeapon(raw_weapon))?;
            let direction = get_vec2(buf, "aim direction")?;
            let claimed_damage = get_f32(buf, "claimed damage")?;
            need(buf, 4)?;
            let target = buf.get_u32();
            Ok(Action::Fire {
                weapon,
                direction,
                claimed_damage,
                target: (target != 0).then_some(target),
            })
        }
        other => Err(ProtocolError::UnknownAction(other)),
    }
}

fn put_entity(buf: &mut BytesMut, entity: &EntityState) {
    buf.put_u32(entity.id);
    buf.put_u8(entity.archetype.0);
    put_vec2(buf, entity.position);
    put_vec2(buf, entity.velocity);
    buf.put_f32(entity.health);
    buf.put_f32(entity.orientation);
    buf.put_u8(entity.flags);
}

fn get_entity(buf: &mut &[u8]) -> Result<EntityState, ProtocolError> {
    need(buf, 5)?;
    let id = buf.get_u32();
    let archetype = Archetype(buf.get_u8());
    let position = get_vec2(buf, "position")?;
    let velocity = get_vec2(buf, "velocity")?;
    let health = get_f32(buf, "health")?;
    let orientation = get_f32(buf, "orientation")?;
    need(buf, 1)?;
    Ok(EntityState {
        id,
        archetype,
        position,
        velocity,
        health,
        orientation,
        flags: buf.get_u8(),
    })
}

fn put_value(buf: &mut BytesMut, value: FieldValue) {
    match value {
        FieldValue::Byte(b) => buf.put_u8(b),
        FieldValue::Scalar(s) => buf.put_f32(s),
        FieldValue::Vector(v) => put_vec2(buf, v),
    }
}

fn get_op(buf: &mut &[u8]) -> Result<DeltaOp, ProtocolError> {
    need(buf, 5)?;
    let entity = buf.get_u32();
    let raw_field = buf.get_u8();
    if raw_field == REMOVE_FIELD {
        return Ok(DeltaOp::Remove { entity });
    }
    let field = FieldId::from_u8(raw_field).ok_or(ProtocolError::UnknownField(raw_field))?;
    let value = match field {
        FieldId::Archetype | FieldId::Flags => {
            need(buf, 1)?;
            FieldValue::Byte(buf.get_u8())
        }
        FieldId::Position | FieldId::Velocity => FieldValue::Vector(get_vec2(buf, "field value")?),
        FieldId::Health | FieldId::Orientation => FieldValue::Scalar(get_f32(buf, "field value")?),
    };
    Ok(DeltaOp::Set { entity, field, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::delta;
    use crate::game::entity::flags;

    fn soldier(id: EntityId, x: f32) -> EntityState {
        EntityState {
            id,
            archetype: Archetype::SOLDIER,
            position: Vec2::new(x, 2.5),
            velocity: Vec2::new(1.0, 0.0),
            health: 75.0,
            orientation: 1.25,
            flags: flags::ALIVE,
        }
    }

    #[test]
    fn hello_carries_resume_session() {
        let hello = Message::Hello(Hello {
            version: PROTOCOL_VERSION,
            player_id: Uuid::new_v4(),
            interp_delay_ms: 100,
            resume_session: Some(42),
        });
        let frame = hello.encode();
        assert_eq!(frame[0], MessageType::Hello as u8);
        assert_eq!(Message::decode(&frame).unwrap(), hello);
    }

    #[test]
    fn snapshot_and_delta_frames_decode_to_the_same_state() {
        let baseline = Snapshot::materialize(10, 5_000, &[soldier(1, 0.0), soldier(2, 3.0)]);
        let target = Snapshot::materialize(11, 5_050, &[soldier(1, 1.5), soldier(3, 9.0)]);

        let full = Message::decode(&encode_full_snapshot(&baseline, 4)).unwrap();
        let Message::FullSnapshot { snapshot, last_command_seq } = full else {
            panic!("expected full snapshot");
        };
        assert_eq!(snapshot, baseline);
        assert_eq!(last_command_seq, 4);

        let wire = encode_delta(&delta::encode(&baseline, &target), 5);
        let Message::Delta { delta: decoded, last_command_seq } = Message::decode(&wire).unwrap() else {
            panic!("expected delta");
        };
        assert_eq!(last_command_seq, 5);
        assert!(decoded.ops.contains(&DeltaOp::Remove { entity: 2 }));
        assert_eq!(delta::decode(&snapshot, &decoded).unwrap(), target);
    }

    #[test]
    fn truncated_and_unknown_frames_are_rejected() {
        assert!(matches!(Message::decode(&[0x06, 0, 0]), Err(ProtocolError::Truncated { .. })));
        assert_eq!(Message::decode(&[0x7F, 0, 0, 0, 1]), Err(ProtocolError::UnknownType(0x7F)));

        let mut frame = Message::Ack { tick: 9 }.encode().to_vec();
        frame.push(0);
        assert_eq!(Message::decode(&frame), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn non_finite_command_is_rejected() {
        let frame = Message::Command {
            sequence: 1,
            client_tick: 3,
            action: Action::Move {
                displacement: Vec2::new(f32::NAN, 0.0),
            },
        }
        .encode();
        assert_eq!(Message::decode(&frame), Err(ProtocolError::NonFinite("displacement")));
    }

    #[test]
    fn fire_command_survives_the_wire() {
        let command = Message::Command {
            sequence: 77,
            client_tick: 120,
            action: Action::Fire {
                weapon: WeaponKind::Marksman,
                direction: Vec2::new(0.0, -1.0),
                claimed_damage: 55.0,
                target: Some(4),
            },
        };
        assert_eq!(Message::decode(&command.encode()).unwrap(), command);
    }

    #[test]
    fn disconnect_reason_is_utf8() {
        let frame = encode_disconnect("protocol version mismatch");
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Disconnect {
                reason: "protocol version mismatch".into()
            }
        );
        let mut bad = frame.to_vec();
        bad[HEADER_SIZE + 2] = 0xFF;
        assert_eq!(Message::decode(&bad), Err(ProtocolError::InvalidUtf8));
    }
}
