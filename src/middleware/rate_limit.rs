//! Token-bucket rate limiting per client IP.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::dynamic::types::RateLimitConfig;

/// Buckets idle this long are dropped during pruning.
const IDLE_EVICTION: Duration = Duration::from_secs(300);
/// Pruning starts once this many clients are tracked.
const PRUNE_THRESHOLD: usize = 10_000;

/// A simple token bucket rate limiter.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Buckets of one rate-limit middleware instance.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, TokenBucket>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            rate: f64::from(config.average.max(1)),
            burst: f64::from(config.burst.max(1)),
        }
    }

    /// Take one token for `client`.
    pub fn check(&self, client: IpAddr) -> bool {
        if self.buckets.len() >= PRUNE_THRESHOLD {
            self.prune();
        }
        let mut bucket = self
            .buckets
            .entry(client)
            .or_insert_with(|| TokenBucket::new(self.burst));
        bucket.try_acquire(self.burst, self.rate)
    }

    fn prune(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, b| now.duration_since(b.last_update) < IDLE_EVICTION);
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
