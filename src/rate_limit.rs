//! Shared token bucket bounding aggregate take rate across all workers.
//!
//! Kept as a theoretical arrival time: every `acquire` pushes it forward by one
//! `interval` and waits until it is within `burst` intervals of now. Callers
//! are granted in reservation order and spaced at least `interval` apart once
//! the burst is spent; idle time banks at most `burst` tokens.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimit;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    slack: Duration,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            interval: limit.interval,
            slack: limit.interval * limit.burst.max(1).saturating_sub(1),
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Wait until one token is available.
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token now and return how long until it is actually covered.
    fn reserve(&self) -> Duration {
        let mut next_free = self.next_free.lock();
        let now = Instant::now();
        if *next_free < now {
            *next_free = now;
        }
        let wait = next_free.duration_since(now).saturating_sub(self.slack);
        *next_free += self.interval;
        wait
    }
}
