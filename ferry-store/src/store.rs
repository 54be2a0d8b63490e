//! The durable storage contract.
//!
//! A backend implements the four table traits ([`Inbox`], [`Outbox`],
//! [`DeadLetters`], [`NodeStore`]) and the umbrella [`MessageStore`]. Every
//! mutating call either fully succeeds or leaves state unchanged.

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_common::{
    DeadLetterEnvelope, Envelope, FailureInfo, IdentityKey, MessageIdentity, Node, NodeId,
    NodeRecord, OwnerId, PersistedCounts,
};
use url::Url;

use crate::Result;

/// Result of inserting an envelope into the inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// An envelope with the same identity already exists; nothing changed
    Duplicate,
}

impl StoreOutcome {
    #[must_use]
    pub const fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

#[async_trait]
pub trait Inbox: Send + Sync + Debug {
    /// Persist a received envelope as `Incoming`
    ///
    /// A second envelope with the same identity is reported as
    /// [`StoreOutcome::Duplicate`] and does not overwrite the first.
    async fn store_incoming(&self, envelope: &Envelope) -> Result<StoreOutcome>;

    /// Persist many envelopes, skipping duplicates. Returns how many were new.
    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<usize>;

    /// Insert or overwrite the envelope as `Scheduled` for its `scheduled_time`
    async fn schedule_job(&self, envelope: &Envelope) -> Result<()>;

    /// Move an already stored incoming envelope to `Scheduled`
    async fn schedule_execution(&self, envelope: &Envelope) -> Result<()>;

    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> Result<()>;

    /// Mark as `Handled` and retain until the store's retention elapses
    async fn mark_incoming_as_handled(&self, envelope: &Envelope) -> Result<()>;

    async fn move_to_dead_letter(&self, envelope: &Envelope, failure: &FailureInfo) -> Result<()>;

    /// Dead-letter many envelopes in one atomic step
    async fn move_to_dead_letters(&self, failed: &[(Envelope, FailureInfo)]) -> Result<()>;

    /// Unowned `Incoming` envelopes received at `address`, oldest first
    async fn load_page_of_globally_owned_incoming(
        &self,
        address: &Url,
        limit: usize,
    ) -> Result<Vec<Envelope>>;

    /// `Scheduled` envelopes whose time has come, oldest first
    async fn load_scheduled_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>>;

    /// Give every envelope to `owner`. Fails without changes if any is missing.
    async fn reassign_incoming(&self, owner: OwnerId, envelopes: &[Envelope]) -> Result<()>;

    /// Remove envelopes from the inbox. Missing envelopes are ignored.
    async fn delete_incoming(&self, envelopes: &[Envelope]) -> Result<()>;
}

#[async_trait]
pub trait Outbox: Send + Sync + Debug {
    /// Insert or overwrite the envelope as `Outgoing` owned by `owner`
    async fn store_outgoing(&self, envelope: &Envelope, owner: OwnerId) -> Result<()>;

    async fn load_outgoing(&self, destination: &Url) -> Result<Vec<Envelope>>;

    /// Unowned outgoing envelopes, oldest first
    async fn load_globally_owned_outgoing(&self, limit: usize) -> Result<Vec<Envelope>>;

    /// Remove envelopes from the outbox. Missing envelopes are ignored.
    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<()>;

    /// Give every envelope to `owner`, carrying over their attempt counts.
    /// Fails without changes if any is missing.
    async fn reassign_outgoing(&self, owner: OwnerId, envelopes: &[Envelope]) -> Result<()>;

    /// Delete `discards` and reassign `reassigns` to `owner` in one atomic step
    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigns: &[Envelope],
        owner: OwnerId,
    ) -> Result<()>;
}

#[async_trait]
pub trait DeadLetters: Send + Sync + Debug {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEnvelope>>;

    /// Dead letters are keyed like the inbox, see [`DeadLetterEnvelope::identity`]
    async fn load_dead_letter(&self, key: &IdentityKey) -> Result<Option<DeadLetterEnvelope>>;

    /// Flag dead letters for replay. Returns how many were found.
    async fn mark_dead_letters_replayable(&self, keys: &[IdentityKey]) -> Result<usize>;

    /// Move every replayable dead letter back into the inbox as unowned
    /// `Incoming`. Returns how many were moved.
    async fn replay_dead_letters(&self) -> Result<usize>;

    async fn delete_dead_letters(&self, keys: &[IdentityKey]) -> Result<()>;
}

#[async_trait]
pub trait NodeStore: Send + Sync + Debug {
    /// Register or update a node, returning its assigned number
    ///
    /// A node registering again with the non-zero number it held before gets
    /// that number back unless another node has taken it.
    async fn persist_node(&self, node: &Node) -> Result<u32>;

    /// Remove a node, its agent assignments and its leadership if held
    async fn delete_node(&self, id: NodeId) -> Result<()>;

    async fn load_all_nodes(&self) -> Result<Vec<Node>>;

    async fn load_node(&self, id: NodeId) -> Result<Option<Node>>;

    /// Nodes whose last health check is older than `stale_before`
    async fn load_all_stale_nodes(&self, stale_before: DateTime<Utc>) -> Result<Vec<Node>>;

    async fn overwrite_health_check_time(&self, id: NodeId, at: DateTime<Utc>) -> Result<()>;

    /// Replace the node's agents. Each agent is removed from any other node.
    async fn assign_agents(&self, id: NodeId, agents: &[Url]) -> Result<()>;

    async fn remove_assignment(&self, id: NodeId, agent: &Url) -> Result<()>;

    async fn add_assignment(&self, id: NodeId, agent: &Url) -> Result<()>;

    /// Compare-and-swap the cluster leader
    ///
    /// The leader becomes `candidate` only if it currently equals `original`.
    /// Returns the leader after the call, so a caller that lost the race sees
    /// the winner.
    async fn mark_node_as_leader(
        &self,
        original: Option<NodeId>,
        candidate: NodeId,
    ) -> Result<Option<NodeId>>;

    async fn find_leader_control_uri(&self) -> Result<Option<Url>>;

    async fn log_record(&self, record: NodeRecord) -> Result<()>;

    /// Most recent records, newest first
    async fn fetch_recent_records(&self, count: usize) -> Result<Vec<NodeRecord>>;

    async fn delete_old_node_records(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// A complete durable store
#[async_trait]
pub trait MessageStore: Inbox + Outbox + DeadLetters + NodeStore {
    /// How this store scopes envelope uniqueness
    fn identity(&self) -> MessageIdentity;

    /// Turn due `Scheduled` envelopes into unowned `Incoming` ones
    async fn promote_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<usize>;

    /// Remove handled envelopes past their retention and any envelope whose
    /// deliver-by has passed
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Return every envelope owned by `owner` to [`OwnerId::ANY`]
    async fn release_ownership(&self, owner: OwnerId) -> Result<usize>;

    async fn fetch_counts(&self) -> Result<PersistedCounts>;
}
