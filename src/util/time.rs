//! Time utilities for the simulation clock

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Simulation tick number. Four bytes on the wire.
pub type Tick = u32;

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Fixed simulation rate shared by the tick loop, the validator and the client predictor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate {
    ticks_per_second: u32,
}

impl TickRate {
    pub fn new(ticks_per_second: u32) -> Self {
        Self {
            ticks_per_second: ticks_per_second.max(1),
        }
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    /// Wall-clock length of one tick
    pub fn interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.ticks_per_second as u64)
    }

    /// Length of one tick in milliseconds
    pub fn interval_ms(&self) -> u64 {
        1_000 / self.ticks_per_second as u64
    }

    /// Delta time for physics (in seconds)
    pub fn delta(&self) -> f32 {
        1.0 / self.ticks_per_second as f32
    }

    /// Number of whole ticks covering `duration`, rounded to nearest
    pub fn ticks_in(&self, duration: Duration) -> u32 {
        (duration.as_secs_f64() / self.interval().as_secs_f64()).round() as u32
    }

    /// Simulation time of a tick, in milliseconds since the match started
    pub fn tick_time_ms(&self, tick: Tick) -> u64 {
        tick as u64 * self.interval_ms()
    }
}

impl Default for TickRate {
    fn default() -> Self {
        Self::new(20)
    }
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
