//! Per-agent circuit breaker
//!
//! Protects a destination that keeps failing from being hammered with sends.
//!
//! # States
//!
//! - **Closed**: Normal operation, every batch is transmitted
//! - **Open**: Tripped after consecutive failures. The agent is *latched*:
//!   batches are reported as latched instead of sent, and a
//!   [`crate::watcher::CircuitWatcher`] pings the destination until it answers
//!
//! ```text
//! ┌─────────┐  N consecutive failures  ┌──────┐
//! │ Closed  │ ───────────────────────> │ Open │
//! └─────────┘                          └──────┘
//!     ^                                    │
//!     │            ping succeeds           │
//!     └────────────────────────────────────┘
//! ```
//!
//! A success while closed resets the failure count.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that latch the agent
    #[serde(default = "default_failures_before_circuit_breaks")]
    pub failures_before_circuit_breaks: u32,

    /// How often a latched agent pings its destination (milliseconds)
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failures_before_circuit_breaks: default_failures_before_circuit_breaks(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

const fn default_failures_before_circuit_breaks() -> u32 {
    3
}

const fn default_ping_interval_ms() -> u64 {
    1000
}

impl CircuitBreakerConfig {
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - batches are transmitted
    Closed,
    /// Circuit tripped - batches are held back until a ping succeeds
    Open,
}

#[derive(Debug)]
struct CircuitBreakerData {
    state: CircuitState,
    /// Number of consecutive failures
    failure_count: u32,
    /// Times this circuit has opened
    trips: u64,
}

/// Failure counter and latch for one sending agent
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: Url,
    config: CircuitBreakerConfig,
    data: Mutex<CircuitBreakerData>,
    /// Mirror of `state == Open` read by the transmit stage on every batch
    latched: AtomicBool,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(destination: Url, config: CircuitBreakerConfig) -> Self {
        Self {
            destination,
            config,
            data: Mutex::new(CircuitBreakerData {
                state: CircuitState::Closed,
                failure_count: 0,
                trips: 0,
            }),
            latched: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Record a failed batch
    ///
    /// Returns `true` if this failure opened the circuit. The caller is then
    /// responsible for starting the resume watcher.
    pub fn record_failure(&self) -> bool {
        let mut data = self.data.lock();
        match data.state {
            CircuitState::Closed => {
                data.failure_count += 1;

                if data.failure_count >= self.config.failures_before_circuit_breaks {
                    data.state = CircuitState::Open;
                    data.trips += 1;
                    self.latched.store(true, Ordering::Release);
                    warn!(
                        destination = %self.destination,
                        failure_count = data.failure_count,
                        threshold = self.config.failures_before_circuit_breaks,
                        "Circuit breaker OPENED - latching sending agent"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Record a successful batch
    ///
    /// Returns `true` if the circuit was open and is now closed.
    pub fn record_success(&self) -> bool {
        let mut data = self.data.lock();
        data.failure_count = 0;
        match data.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                data.state = CircuitState::Closed;
                self.latched.store(false, Ordering::Release);
                info!(
                    destination = %self.destination,
                    "Circuit breaker CLOSED - normal operation resumed"
                );
                true
            }
        }
    }

    /// Close the circuit after the destination answered a ping
    pub fn resume(&self) -> bool {
        self.record_success()
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Get statistics (for monitoring/debugging)
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let data = self.data.lock();
        CircuitBreakerStats {
            state: data.state,
            failure_count: data.failure_count,
            trips: data.trips,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Number of consecutive failures
    pub failure_count: u32,
    /// Number of times the circuit has opened
    pub trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            Url::parse("queue://x").expect("valid url"),
            CircuitBreakerConfig {
                failures_before_circuit_breaks: threshold,
                ping_interval_ms: 10,
            },
        )
    }

    #[test]
    fn test_circuit_breaker_closed_to_open() {
        let breaker = breaker(3);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.is_latched());

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Trips on the third failure, and only once
        assert!(breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_latched());
    }

    #[test]
    fn test_circuit_breaker_resume() {
        let breaker = breaker(1);

        assert!(breaker.record_failure());
        assert!(breaker.resume());
        assert!(!breaker.is_latched());
        assert_eq!(breaker.stats().failure_count, 0);

        // Resuming a closed circuit is a no-op
        assert!(!breaker.resume());
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let breaker = breaker(3);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_stats() {
        let breaker = breaker(2);

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);

        breaker.record_failure();
        breaker.record_failure();

        let stats = breaker.stats();
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.trips, 1);
    }
}
