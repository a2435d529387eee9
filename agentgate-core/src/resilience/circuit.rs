//! Per-endpoint circuit breaker.
//!
//! State machine: `Closed -> Open` after `failure_threshold` consecutive
//! failures, `Open -> HalfOpen` once `recovery_timeout` has elapsed, and
//! `HalfOpen` admits exactly one probe whose outcome decides between
//! `Closed` and another full `Open` window. Transitions happen under a
//! plain mutex that is never held across an await point.

use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may proceed right now. While `Open`, reports the time
    /// remaining until a probe will be admitted. `HalfOpen` admits exactly
    /// one in-flight probe; concurrent callers are rejected until the probe
    /// resolves.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.config.recovery_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let circuit = breaker(5, Duration::from_secs(60));
        for _ in 0..4 {
            circuit.try_acquire().expect("closed");
            circuit.record_failure();
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
        circuit.try_acquire().expect("still closed");
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(circuit.try_acquire().is_err());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let circuit = breaker(3, Duration::from_secs(60));
        circuit.record_failure();
        circuit.record_failure();
        circuit.record_success();
        circuit.record_failure();
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let circuit = breaker(1, Duration::ZERO);
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);

        // Recovery window of zero: the next acquire becomes the probe.
        circuit.try_acquire().expect("probe admitted");
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert!(circuit.try_acquire().is_err(), "second probe must wait");

        circuit.record_success();
        assert_eq!(circuit.state(), CircuitState::Closed);
        circuit.try_acquire().expect("closed again");
    }

    #[test]
    fn failed_probe_reopens_the_circuit() {
        let circuit = breaker(1, Duration::ZERO);
        circuit.record_failure();
        circuit.try_acquire().expect("probe admitted");
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn open_circuit_reports_remaining_recovery_time() {
        let circuit = breaker(1, Duration::from_secs(60));
        circuit.record_failure();
        let remaining = circuit.try_acquire().expect_err("open");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }
}
