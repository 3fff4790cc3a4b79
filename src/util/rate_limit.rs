//! Per-connection message rate limits

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Any client message, per second
pub const MESSAGE_RATE_LIMIT: u32 = 30;

/// Join requests per second; each one runs a pairing scan
pub const JOIN_RATE_LIMIT: u32 = 2;

pub fn create_limiter(per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Limits for one player's socket
#[derive(Clone)]
pub struct PlayerRateLimiter {
    messages: Arc<Limiter>,
    joins: Arc<Limiter>,
}

impl PlayerRateLimiter {
    pub fn new() -> Self {
        Self {
            messages: create_limiter(MESSAGE_RATE_LIMIT),
            joins: create_limiter(JOIN_RATE_LIMIT),
        }
    }

    pub fn check_message(&self) -> bool {
        self.messages.check().is_ok()
    }

    pub fn check_join(&self) -> bool {
        self.joins.check().is_ok()
    }
}

impl Default for PlayerRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
