use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::{CircuitBreakerConfig, EndpointMode, RetryPolicy, pipeline::BatchSettings};

/// Settings shared by every sending agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,

    /// Most envelopes in one transmitted batch
    ///
    /// Default: 200
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// How long a partial batch waits for more envelopes (milliseconds)
    ///
    /// Default: 250
    #[serde(default = "defaults::batch_window_ms")]
    pub batch_window_ms: u64,

    /// Failed envelopes a buffered agent keeps for replay. Oldest are dropped
    /// first once full.
    ///
    /// Default: 100
    #[serde(default = "defaults::retry_buffer_capacity")]
    pub retry_buffer_capacity: usize,

    /// Send attempts before a durable agent discards an envelope
    ///
    /// Default: 10
    #[serde(default = "defaults::maximum_delivery_attempts")]
    pub maximum_delivery_attempts: u32,

    /// Timeout for a single transport send (milliseconds)
    ///
    /// Default: 30000
    #[serde(default = "defaults::send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            circuit: CircuitBreakerConfig::default(),
            batch_size: defaults::batch_size(),
            batch_window_ms: defaults::batch_window_ms(),
            retry_buffer_capacity: defaults::retry_buffer_capacity(),
            maximum_delivery_attempts: defaults::maximum_delivery_attempts(),
            send_timeout_ms: defaults::send_timeout_ms(),
        }
    }
}

impl AgentSettings {
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub const fn batching(&self) -> BatchSettings {
        BatchSettings {
            size: self.batch_size,
            window: Duration::from_millis(self.batch_window_ms),
        }
    }
}

/// Mode override for one destination
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub uri: Url,
    pub mode: EndpointMode,
}

/// Delivery configuration
///
/// ```ron
/// delivery: (
///     default_mode: Durable,
///     agent: (batch_size: 50, circuit: (failures_before_circuit_breaks: 5)),
///     endpoints: [(uri: "queue://audit", mode: Inline)],
///     retry: (max_attempts: 3),
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub default_mode: EndpointMode,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Retry policy for the durable receiver
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl DeliveryConfig {
    /// Configured mode for `destination`, falling back to `default_mode`
    #[must_use]
    pub fn mode_for(&self, destination: &Url) -> EndpointMode {
        self.endpoints
            .iter()
            .find(|endpoint| &endpoint.uri == destination)
            .map_or(self.default_mode, |endpoint| endpoint.mode)
    }
}

mod defaults {
    pub const fn batch_size() -> usize {
        200
    }

    pub const fn batch_window_ms() -> u64 {
        250
    }

    pub const fn retry_buffer_capacity() -> usize {
        100
    }

    pub const fn maximum_delivery_attempts() -> u32 {
        10
    }

    pub const fn send_timeout_ms() -> u64 {
        30_000
    }
}
