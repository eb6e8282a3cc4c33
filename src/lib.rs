//! Arena Sync Server - authoritative network synchronization core
//!
//! Fixed-rate match simulation with snapshot history, per-client delta
//! replication, lag-compensated hit detection, command validation and a
//! skill-based matchmaker, served over binary WebSocket frames.

pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod game;
pub mod http;
pub mod matchmaking;
pub mod session;
pub mod util;
pub mod ws;
