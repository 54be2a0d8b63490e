//! Health state shared between the controller and the HTTP handlers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ferry_common::PersistedCounts;
use parking_lot::Mutex;
use serde::Serialize;

/// Thread-safe view of a node's health
///
/// The controller pushes observations in, the probes read them out. Nothing
/// here talks to the store or the agents directly.
#[derive(Debug)]
pub struct HealthChecker {
    /// The message store opened (and its snapshot, if any, loaded)
    store_ready: AtomicBool,

    /// The sending agent registry is accepting envelopes
    agents_ready: AtomicBool,

    /// This node is registered in the node table
    node_registered: AtomicBool,

    leader: AtomicBool,
    latched_agents: AtomicU64,

    /// Envelopes posted to pipelines but not yet settled
    queued: AtomicU64,

    counts: Mutex<PersistedCounts>,

    max_backlog: u64,
}

impl HealthChecker {
    #[must_use]
    pub fn new(max_backlog: u64) -> Self {
        Self {
            store_ready: AtomicBool::new(false),
            agents_ready: AtomicBool::new(false),
            node_registered: AtomicBool::new(false),
            leader: AtomicBool::new(false),
            latched_agents: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            counts: Mutex::new(PersistedCounts::default()),
            max_backlog,
        }
    }

    pub fn set_store_ready(&self, ready: bool) {
        self.store_ready.store(ready, Ordering::Relaxed);
        tracing::debug!(ready, "Store readiness updated");
    }

    pub fn set_agents_ready(&self, ready: bool) {
        self.agents_ready.store(ready, Ordering::Relaxed);
        tracing::debug!(ready, "Agent readiness updated");
    }

    pub fn set_node_registered(&self, registered: bool) {
        self.node_registered.store(registered, Ordering::Relaxed);
        tracing::debug!(registered, "Node registration updated");
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }

    pub fn set_latched_agents(&self, latched: usize) {
        self.latched_agents
            .store(u64::try_from(latched).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn set_queued(&self, queued: usize) {
        self.queued
            .store(u64::try_from(queued).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn set_counts(&self, counts: PersistedCounts) {
        *self.counts.lock() = counts;
    }

    /// Outbox rows plus envelopes still moving through the pipelines
    #[must_use]
    pub fn backlog(&self) -> u64 {
        self.counts
            .lock()
            .outgoing
            .saturating_add(self.queued.load(Ordering::Relaxed))
    }

    /// Liveness only needs the server to answer; a dead process times out.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        true
    }

    /// Ready when every component is up and the backlog is under the threshold
    ///
    /// A latched agent only affects its own destination, so it does not take
    /// the node out of rotation.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let store_ok = self.store_ready.load(Ordering::Relaxed);
        let agents_ok = self.agents_ready.load(Ordering::Relaxed);
        let node_ok = self.node_registered.load(Ordering::Relaxed);
        let backlog = self.backlog();
        let backlog_ok = backlog < self.max_backlog;

        let ready = store_ok && agents_ok && node_ok && backlog_ok;

        if !ready {
            tracing::debug!(
                store_ready = store_ok,
                agents_ready = agents_ok,
                node_registered = node_ok,
                backlog,
                max_backlog = self.max_backlog,
                "Readiness check failed"
            );
        }

        ready
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        HealthStatus {
            alive: self.is_alive(),
            ready: self.is_ready(),
            store_ready: self.store_ready.load(Ordering::Relaxed),
            agents_ready: self.agents_ready.load(Ordering::Relaxed),
            node_registered: self.node_registered.load(Ordering::Relaxed),
            leader: self.leader.load(Ordering::Relaxed),
            latched_agents: self.latched_agents.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            backlog: self.backlog(),
            max_backlog: self.max_backlog,
            counts: *self.counts.lock(),
        }
    }
}

/// Snapshot served by `/health/status`
#[derive(Debug, Clone, Serialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Each flag is reported separately to the probes"
)]
pub struct HealthStatus {
    pub alive: bool,
    pub ready: bool,
    pub store_ready: bool,
    pub agents_ready: bool,
    pub node_registered: bool,
    pub leader: bool,
    pub latched_agents: u64,
    pub queued: u64,
    pub backlog: u64,
    pub max_backlog: u64,
    pub counts: PersistedCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_checker(max_backlog: u64) -> HealthChecker {
        let checker = HealthChecker::new(max_backlog);
        checker.set_store_ready(true);
        checker.set_agents_ready(true);
        checker.set_node_registered(true);
        checker
    }

    #[test]
    fn test_not_ready_until_every_component_reports() {
        let checker = HealthChecker::new(100);
        assert!(checker.is_alive());
        assert!(!checker.is_ready());

        checker.set_store_ready(true);
        checker.set_agents_ready(true);
        assert!(!checker.is_ready());

        checker.set_node_registered(true);
        assert!(checker.is_ready());
    }

    #[test]
    fn test_backlog_counts_outbox_and_pipelines() {
        let checker = ready_checker(100);
        checker.set_counts(PersistedCounts {
            outgoing: 60,
            ..PersistedCounts::default()
        });
        checker.set_queued(39);
        assert_eq!(checker.backlog(), 99);
        assert!(checker.is_ready());

        checker.set_queued(40);
        assert!(!checker.is_ready());
    }

    #[test]
    fn test_latched_agents_do_not_affect_readiness() {
        let checker = ready_checker(100);
        checker.set_latched_agents(3);
        checker.set_leader(true);

        let status = checker.status();
        assert!(status.ready);
        assert!(status.leader);
        assert_eq!(status.latched_agents, 3);
    }
}
