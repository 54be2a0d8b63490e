//! Health check configuration

use std::time::Duration;

use serde::Deserialize;

mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub fn listen_address() -> String {
        "[::]:8080".to_string()
    }

    pub const fn max_backlog() -> u64 {
        10_000
    }

    pub const fn refresh_interval_ms() -> u64 {
        1_000
    }
}

/// Configuration for health check endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable or disable health check server
    ///
    /// When disabled, the health server will not start.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Address to bind the health check server
    ///
    /// Common values:
    /// - `[::]:8080` (IPv6 any address, port 8080)
    /// - `0.0.0.0:8080` (IPv4 any address, port 8080)
    /// - `127.0.0.1:8080` (localhost only, port 8080)
    #[serde(default = "defaults::listen_address")]
    pub listen_address: String,

    /// Readiness fails once the outbox plus the in-memory pipeline backlog
    /// reaches this many envelopes
    #[serde(default = "defaults::max_backlog", alias = "max_queue_size")]
    pub max_backlog: u64,

    /// How often the controller refreshes the checker's counters
    #[serde(default = "defaults::refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl HealthConfig {
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            listen_address: defaults::listen_address(),
            max_backlog: defaults::max_backlog(),
            refresh_interval_ms: defaults::refresh_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_queue_size_alias() {
        let config: HealthConfig =
            serde_json::from_str(r#"{ "max_queue_size": 50 }"#).expect("valid config");
        assert_eq!(config.max_backlog, 50);
        assert!(config.enabled);
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
    }
}
