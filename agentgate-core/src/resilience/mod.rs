//! Resilience primitives composed by the gateway pipeline: the circuit
//! breaker state machine and the jittered exponential retry policy. The
//! bulkhead is a plain `tokio::sync::Semaphore` owned by the gateway, and
//! caching/rate limiting live in their own modules.

mod circuit;

pub use circuit::CircuitBreaker;
pub use circuit::CircuitConfig;
pub use circuit::CircuitState;

use std::time::Duration;

use rand::random;

use crate::error::GatewayError;

/// Exponential backoff between retry attempts. Only errors whose kind is in
/// `retry_on` are retried; everything else is rethrown immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    pub retry_on: Vec<&'static str>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            retry_on: GatewayError::DEFAULT_RETRYABLE_KINDS.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for callers that must not re-run a
    /// side-effectful operation.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            retry_on: Vec::new(),
            ..Self::default()
        }
    }

    pub fn should_retry(&self, err: &GatewayError) -> bool {
        self.retry_on.contains(&err.kind())
    }

    /// Delay before retrying after the given 1-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = (base * jitter_factor).max(0.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}
