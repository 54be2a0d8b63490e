//! Cluster membership records kept by the message store.

use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{NodeId, OwnerId};

/// A running process participating in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Short number assigned by the store on registration, used as the owner
    /// id of the envelopes this node holds
    pub assigned_number: u32,
    pub control_uri: Option<Url>,
    /// Endpoints this node is able to run
    pub capabilities: BTreeSet<Url>,
    pub started_at: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
    /// Agents the leader has assigned to this node
    pub active_agents: BTreeSet<Url>,
}

impl Node {
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id,
            assigned_number: 0,
            control_uri: None,
            capabilities: BTreeSet::new(),
            started_at: now,
            last_health_check: now,
            active_agents: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_capability(mut self, uri: Url) -> Self {
        self.capabilities.insert(uri);
        self
    }

    #[must_use]
    pub fn with_control_uri(mut self, uri: Url) -> Self {
        self.control_uri = Some(uri);
        self
    }

    /// Owner id of the envelopes this node holds
    #[must_use]
    pub const fn owner_id(&self) -> OwnerId {
        OwnerId(self.assigned_number)
    }

    /// Whether the node has missed its heartbeat for longer than `stale_after`
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.last_health_check > stale_after
    }
}

/// Kinds of entries in the node event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeEventType {
    NodeStarted,
    NodeStopped,
    LeadershipAssumed,
    LeadershipLost,
    AgentsAssigned,
    DormantNodeEjected,
}

impl fmt::Display for NodeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NodeStarted => "node-started",
            Self::NodeStopped => "node-stopped",
            Self::LeadershipAssumed => "leadership-assumed",
            Self::LeadershipLost => "leadership-lost",
            Self::AgentsAssigned => "agents-assigned",
            Self::DormantNodeEjected => "dormant-node-ejected",
        };
        f.write_str(name)
    }
}

/// One entry in the node event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_number: u32,
    pub event: NodeEventType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub service_name: String,
}

impl NodeRecord {
    pub fn new(
        node_number: u32,
        event: NodeEventType,
        description: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            node_number,
            event,
            description: description.into(),
            timestamp: Utc::now(),
            service_name: service_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn staleness() {
        let mut node = Node::new(NodeId::from(1u128));
        let now = Utc::now();
        node.last_health_check = now - Duration::seconds(30);

        assert!(node.is_stale(now, Duration::seconds(10)));
        assert!(!node.is_stale(now, Duration::seconds(60)));
    }

    #[test]
    fn owner_follows_assigned_number() {
        let mut node = Node::new(NodeId::from(1u128));
        node.assigned_number = 4;
        assert_eq!(node.owner_id(), OwnerId(4));
    }
}
