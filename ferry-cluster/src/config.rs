use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Node coordination settings
///
/// ```ron
/// cluster: (
///     service_name: "orders",
///     heartbeat_interval_ms: 2000,
///     stale_node_threshold_secs: 10,
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Scopes the leadership lock and the node event log
    #[serde(default = "defaults::service_name")]
    pub service_name: String,

    /// Where other nodes can reach this one
    #[serde(default)]
    pub control_uri: Option<Url>,

    /// Endpoints this node is able to run
    #[serde(default)]
    pub capabilities: Vec<Url>,

    /// How often the node refreshes its health check time
    ///
    /// Default: 5000
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Nodes whose last health check is older than this are ejected
    ///
    /// Default: 30
    #[serde(default = "defaults::stale_node_threshold_secs")]
    pub stale_node_threshold_secs: u64,

    /// How often the leadership lock is attempted, and leader duties run
    ///
    /// Default: 5000
    #[serde(default = "defaults::leadership_poll_interval_ms")]
    pub leadership_poll_interval_ms: u64,

    /// Lifetime of the leadership lease. Must outlast the poll interval or
    /// leadership flaps between renewals.
    ///
    /// Default: 15
    #[serde(default = "defaults::leader_lease_secs")]
    pub leader_lease_secs: u64,

    /// How often globally owned envelopes are claimed
    ///
    /// Default: 5000
    #[serde(default = "defaults::recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    /// Envelopes claimed per address and per pass
    ///
    /// Default: 100
    #[serde(default = "defaults::recovery_page_size")]
    pub recovery_page_size: usize,

    /// Scheduled envelopes promoted per leader pass
    ///
    /// Default: 500
    #[serde(default = "defaults::scheduled_page_size")]
    pub scheduled_page_size: usize,

    /// Node events older than this are pruned by the leader
    ///
    /// Default: 604800 (7 days)
    #[serde(default = "defaults::node_record_retention_secs")]
    pub node_record_retention_secs: u64,

    /// Upper bound of the random delay before each loop's first tick
    ///
    /// Default: 1000
    #[serde(default = "defaults::first_poll_jitter_ms")]
    pub first_poll_jitter_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            service_name: defaults::service_name(),
            control_uri: None,
            capabilities: Vec::new(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            stale_node_threshold_secs: defaults::stale_node_threshold_secs(),
            leadership_poll_interval_ms: defaults::leadership_poll_interval_ms(),
            leader_lease_secs: defaults::leader_lease_secs(),
            recovery_interval_ms: defaults::recovery_interval_ms(),
            recovery_page_size: defaults::recovery_page_size(),
            scheduled_page_size: defaults::scheduled_page_size(),
            node_record_retention_secs: defaults::node_record_retention_secs(),
            first_poll_jitter_ms: defaults::first_poll_jitter_ms(),
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn leadership_poll_interval(&self) -> Duration {
        Duration::from_millis(self.leadership_poll_interval_ms)
    }

    #[must_use]
    pub const fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    #[must_use]
    pub const fn first_poll_jitter(&self) -> Duration {
        Duration::from_millis(self.first_poll_jitter_ms)
    }

    #[must_use]
    pub fn stale_node_threshold(&self) -> chrono::Duration {
        seconds(self.stale_node_threshold_secs)
    }

    #[must_use]
    pub fn leader_lease(&self) -> chrono::Duration {
        seconds(self.leader_lease_secs)
    }

    #[must_use]
    pub fn node_record_retention(&self) -> chrono::Duration {
        seconds(self.node_record_retention_secs)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

mod defaults {
    pub fn service_name() -> String {
        String::from("ferry")
    }

    pub const fn heartbeat_interval_ms() -> u64 {
        5000
    }

    pub const fn stale_node_threshold_secs() -> u64 {
        30
    }

    pub const fn leadership_poll_interval_ms() -> u64 {
        5000
    }

    pub const fn leader_lease_secs() -> u64 {
        15
    }

    pub const fn recovery_interval_ms() -> u64 {
        5000
    }

    pub const fn recovery_page_size() -> usize {
        100
    }

    pub const fn scheduled_page_size() -> usize {
        500
    }

    pub const fn node_record_retention_secs() -> u64 {
        7 * 24 * 60 * 60
    }

    pub const fn first_poll_jitter_ms() -> u64 {
        1000
    }
}
