//! Token-bucket rate limiting per (endpoint, client) pair.
//!
//! Buckets refill continuously at `per_minute / 60` tokens per second up to
//! a burst capacity. `try_acquire` never blocks: an empty bucket fails the
//! call immediately with the time until one token is available.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::config::RateLimitSettings;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill = now;
    }

    fn consume_at(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        let wait_secs = if self.refill_per_sec > 0.0 {
            missing / self.refill_per_sec
        } else {
            1.0
        };
        Err(Duration::from_secs_f64(wait_secs))
    }
}

pub struct RateLimiter {
    enabled: bool,
    per_minute: u32,
    burst: u32,
    buckets: Mutex<HashMap<(String, String), TokenBucket>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            enabled: settings.enabled,
            per_minute: settings.per_minute,
            burst: settings.burst,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from the (endpoint, client) bucket, or report how long
    /// until one would be available.
    pub fn try_acquire(&self, endpoint: &str, client_id: &str) -> Result<(), Duration> {
        if !self.enabled {
            return Ok(());
        }
        self.try_acquire_at(endpoint, client_id, Instant::now())
    }

    fn try_acquire_at(
        &self,
        endpoint: &str,
        client_id: &str,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry((endpoint.to_string(), client_id.to_string()))
            .or_insert_with(|| {
                TokenBucket::new(self.burst, f64::from(self.per_minute) / 60.0, now)
            });
        bucket.consume_at(now)
    }

    /// Remaining whole tokens for monitoring.
    pub fn remaining(&self, endpoint: &str, client_id: &str) -> u32 {
        let mut buckets = self.buckets.lock().unwrap();
        match buckets.get_mut(&(endpoint.to_string(), client_id.to_string())) {
            Some(bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens as u32
            }
            None => self.burst,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitSettings {
            enabled: true,
            per_minute,
            burst,
        })
    }

    #[test]
    fn burst_is_honored_then_exhausted() {
        // 60 rpm, burst 10: ten immediate acquisitions pass, the eleventh
        // fails, and one refilled token is back after a bit over a second.
        let limiter = limiter(60, 10);
        let now = Instant::now();
        for _ in 0..10 {
            limiter
                .try_acquire_at("llm.generate", "local", now)
                .expect("burst token");
        }
        let retry_after = limiter
            .try_acquire_at("llm.generate", "local", now)
            .expect_err("bucket must be empty");
        assert!(retry_after > Duration::from_millis(900));

        limiter
            .try_acquire_at("llm.generate", "local", now + Duration::from_millis(1100))
            .expect("one refilled token");
    }

    #[test]
    fn buckets_are_isolated_per_endpoint_and_client() {
        let limiter = limiter(60, 1);
        let now = Instant::now();
        limiter.try_acquire_at("a", "x", now).expect("a/x");
        limiter.try_acquire_at("a", "y", now).expect("a/y");
        limiter.try_acquire_at("b", "x", now).expect("b/x");
        assert!(limiter.try_acquire_at("a", "x", now).is_err());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let limiter = limiter(6000, 5);
        let now = Instant::now();
        for _ in 0..5 {
            limiter.try_acquire_at("e", "c", now).expect("initial burst");
        }
        // A long idle period refills to capacity, not beyond.
        let later = now + Duration::from_secs(60);
        for _ in 0..5 {
            limiter.try_acquire_at("e", "c", later).expect("refilled");
        }
        assert!(limiter.try_acquire_at("e", "c", later).is_err());
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let limiter = RateLimiter::new(&RateLimitSettings {
            enabled: false,
            per_minute: 1,
            burst: 1,
        });
        for _ in 0..100 {
            limiter.try_acquire("e", "c").expect("disabled");
        }
    }
}
