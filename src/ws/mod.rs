//! WebSocket transport and binary wire protocol

pub mod handler;
pub mod protocol;
