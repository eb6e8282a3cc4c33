//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified messages per second
pub fn create_limiter(messages_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(messages_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Inbound frames allowed per session per second, across all message types.
/// Three frames per tick at the reference rate leaves room for command, ack and heartbeat.
pub const INBOUND_FRAMES_PER_TICK: u32 = 3;

/// Per-session inbound rate limiter held by the session's reader task
#[derive(Clone)]
pub struct SessionRateLimiter {
    inbound: Arc<Limiter>,
}

impl SessionRateLimiter {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            inbound: create_limiter(tick_rate.saturating_mul(INBOUND_FRAMES_PER_TICK)),
        }
    }

    /// Check if an inbound frame is allowed (returns true if allowed)
    pub fn check_inbound(&self) -> bool {
        self.inbound.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_beyond_quota_is_refused() {
        let limiter = SessionRateLimiter::new(1);
        let allowed = (0..10).filter(|_| limiter.check_inbound()).count();
        assert_eq!(allowed, INBOUND_FRAMES_PER_TICK as usize);
    }
}
