use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_common::{
    DeadLetterEnvelope, Envelope, EnvelopeStatus, FailureInfo, IdentityKey,
    MessageIdentity, Node, NodeId, NodeRecord, OwnerId, PersistedCounts, internal,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    DeadLetters, Inbox, MessageStore, NodeStore, Outbox, Result, StoreError, StoreOutcome,
    StoreSettings,
    backends::Snapshot,
    lock::{LockTable, MemoryLeadershipLock},
};

/// Everything the store persists
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    /// `Incoming`, `Scheduled` and `Handled` envelopes
    incoming: BTreeMap<IdentityKey, Envelope>,
    outgoing: BTreeMap<IdentityKey, Envelope>,
    dead_letters: BTreeMap<IdentityKey, DeadLetterEnvelope>,
    nodes: BTreeMap<NodeId, Node>,
    leader: Option<NodeId>,
    last_node_number: u32,
    records: Vec<NodeRecord>,
}

impl Tables {
    fn rows(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }

    fn ensure_room(&self, capacity: Option<usize>, additional: usize) -> Result<()> {
        match capacity {
            Some(capacity) if additional > 0 && self.rows() + additional > capacity => {
                Err(StoreError::CapacityExceeded {
                    len: self.rows(),
                    capacity,
                })
            }
            _ => Ok(()),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))
    }

    fn unassign_everywhere(&mut self, agent: &Url) {
        for node in self.nodes.values_mut() {
            node.active_agents.remove(agent);
        }
    }
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    /// Bumped on every mutation; orders snapshot writes
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<State>,
    snapshot: Option<Snapshot>,
    /// Held across a persisted mutation, from staging until commit
    writer: tokio::sync::Mutex<()>,
    locks: LockTable,
    settings: StoreSettings,
}

/// In-memory message store with optional snapshot persistence
///
/// All tables live behind one `RwLock`, so each trait call is a single atomic
/// step. Multiple nodes in one process share a store by cloning it, which is
/// how the cluster tests exercise leader election and orphan recovery.
///
/// When opened with a [`Snapshot`], the full table state is written to disk
/// after every mutation and reloaded by [`MemoryMessageStore::restore`].
///
/// # Capacity Management
/// A capacity limit bounds the number of inbox and outbox rows. Inserts past
/// the limit fail with [`StoreError::CapacityExceeded`].
#[derive(Debug, Clone)]
pub struct MemoryMessageStore {
    inner: Arc<Inner>,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn as_row(envelope: &Envelope, status: EnvelopeStatus) -> Envelope {
    let mut row = envelope.clone();
    row.status = status;
    row.message = None;
    row.serializer = None;
    row
}

/// Outbox rows are always unique per destination
fn outgoing_key(envelope: &Envelope) -> IdentityKey {
    IdentityKey {
        id: envelope.id,
        destination: envelope.destination.as_ref().map(ToString::to_string),
    }
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(StoreSettings::default())
    }

    #[must_use]
    pub fn with_settings(settings: StoreSettings) -> Self {
        Self::build(Tables::default(), None, settings)
    }

    /// Create a store persisted through `snapshot`, loading its last state
    ///
    /// # Errors
    ///
    /// Returns an error if an existing snapshot cannot be read or decoded.
    pub async fn restore(snapshot: Snapshot, settings: StoreSettings) -> Result<Self> {
        let tables: Tables = snapshot.load().await?.unwrap_or_default();
        internal!(
            level = INFO,
            "Restored store from {} ({} incoming, {} outgoing, {} nodes)",
            snapshot.path().display(),
            tables.incoming.len(),
            tables.outgoing.len(),
            tables.nodes.len()
        );
        Ok(Self::build(tables, Some(snapshot), settings))
    }

    fn build(tables: Tables, snapshot: Option<Snapshot>, settings: StoreSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    tables,
                    generation: 0,
                }),
                snapshot,
                writer: tokio::sync::Mutex::new(()),
                locks: LockTable::default(),
                settings,
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> StoreSettings {
        self.inner.settings
    }

    /// Number of inbox and outbox rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.read().tables.rows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A leadership lock for `service_name` held on behalf of `node`
    ///
    /// Locks obtained from clones of the same store contend with each other.
    #[must_use]
    pub fn leadership_lock(
        &self,
        service_name: &str,
        node: NodeId,
        lease: chrono::Duration,
    ) -> MemoryLeadershipLock {
        MemoryLeadershipLock::new(
            self.inner.locks.clone(),
            format!("{service_name}:leader"),
            node,
            lease,
        )
    }

    fn key(&self, envelope: &Envelope) -> IdentityKey {
        envelope.identity(self.inner.settings.identity)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.inner.state.read().tables)
    }

    /// Apply `f` atomically and persist the result
    ///
    /// `f` must validate before it changes anything so a failed call leaves
    /// the tables untouched. With a snapshot, `f` runs against a staged copy
    /// that replaces the tables only once it is on disk, so a failed write
    /// leaves them untouched too.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let Some(snapshot) = &self.inner.snapshot else {
            return f(&mut self.inner.state.write().tables);
        };

        let _writer = self.inner.writer.lock().await;
        let (value, staged, generation, bytes) = {
            let state = self.inner.state.read();
            let mut staged = state.tables.clone();
            let value = f(&mut staged)?;
            let bytes = Snapshot::encode(&staged)?;
            (value, staged, state.generation + 1, bytes)
        };

        snapshot.write(generation, bytes).await?;

        let mut state = self.inner.state.write();
        state.tables = staged;
        state.generation = generation;
        Ok(value)
    }
}

#[async_trait]
impl Inbox for MemoryMessageStore {
    async fn store_incoming(&self, envelope: &Envelope) -> Result<StoreOutcome> {
        let key = self.key(envelope);
        let capacity = self.inner.settings.capacity;
        let row = as_row(envelope, EnvelopeStatus::Incoming);

        self.mutate(move |tables| {
            if tables.incoming.contains_key(&key) {
                return Ok(StoreOutcome::Duplicate);
            }
            tables.ensure_room(capacity, 1)?;
            tables.incoming.insert(key, row);
            Ok(StoreOutcome::Stored)
        })
        .await
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<usize> {
        let capacity = self.inner.settings.capacity;
        let rows: Vec<_> = envelopes
            .iter()
            .map(|e| (self.key(e), as_row(e, EnvelopeStatus::Incoming)))
            .collect();

        self.mutate(move |tables| {
            let mut fresh: BTreeMap<IdentityKey, Envelope> = BTreeMap::new();
            for (key, row) in rows {
                if !tables.incoming.contains_key(&key) {
                    fresh.entry(key).or_insert(row);
                }
            }

            tables.ensure_room(capacity, fresh.len())?;
            let stored = fresh.len();
            tables.incoming.extend(fresh);
            Ok(stored)
        })
        .await
    }

    async fn schedule_job(&self, envelope: &Envelope) -> Result<()> {
        let key = self.key(envelope);
        let capacity = self.inner.settings.capacity;
        let row = as_row(envelope, EnvelopeStatus::Scheduled);

        self.mutate(move |tables| {
            if !tables.incoming.contains_key(&key) {
                tables.ensure_room(capacity, 1)?;
            }
            tables.incoming.insert(key, row);
            Ok(())
        })
        .await
    }

    async fn schedule_execution(&self, envelope: &Envelope) -> Result<()> {
        let key = self.key(envelope);
        let scheduled_time = envelope.scheduled_time;
        let attempts = envelope.attempts;

        self.mutate(move |tables| {
            let row = tables
                .incoming
                .get_mut(&key)
                .ok_or(StoreError::NotFound(key.id))?;
            row.status = EnvelopeStatus::Scheduled;
            row.scheduled_time = scheduled_time;
            row.attempts = attempts;
            Ok(())
        })
        .await
    }

    /// Persist the envelope's attempt count after the caller bumped it
    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> Result<()> {
        let key = self.key(envelope);
        let attempts = envelope.attempts;

        self.mutate(move |tables| {
            let row = tables
                .incoming
                .get_mut(&key)
                .ok_or(StoreError::NotFound(key.id))?;
            row.attempts = attempts.max(row.attempts + 1);
            Ok(())
        })
        .await
    }

    async fn mark_incoming_as_handled(&self, envelope: &Envelope) -> Result<()> {
        let key = self.key(envelope);
        let keep_until = Utc::now()
            .checked_add_signed(self.inner.settings.handled_retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.mutate(move |tables| {
            let row = tables
                .incoming
                .get_mut(&key)
                .ok_or(StoreError::NotFound(key.id))?;
            row.status = EnvelopeStatus::Handled;
            row.keep_until = Some(keep_until);
            Ok(())
        })
        .await
    }

    async fn move_to_dead_letter(&self, envelope: &Envelope, failure: &FailureInfo) -> Result<()> {
        self.move_to_dead_letters(&[(envelope.clone(), failure.clone())])
            .await
    }

    async fn move_to_dead_letters(&self, failed: &[(Envelope, FailureInfo)]) -> Result<()> {
        let mut moves = Vec::with_capacity(failed.len());
        for (envelope, failure) in failed {
            moves.push((
                self.key(envelope),
                DeadLetterEnvelope::capture(envelope, failure)?,
            ));
        }

        self.mutate(move |tables| {
            for (key, dead) in moves {
                tables.incoming.remove(&key);
                tables.dead_letters.insert(key, dead);
            }
            Ok(())
        })
        .await
    }

    async fn load_page_of_globally_owned_incoming(
        &self,
        address: &Url,
        limit: usize,
    ) -> Result<Vec<Envelope>> {
        Ok(self.read(|tables| {
            tables
                .incoming
                .values()
                .filter(|e| {
                    e.status == EnvelopeStatus::Incoming
                        && e.owner_id.is_any()
                        && e.received_at.as_ref() == Some(address)
                })
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn load_scheduled_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>> {
        Ok(self.read(|tables| due_scheduled(tables, now, limit)))
    }

    async fn reassign_incoming(&self, owner: OwnerId, envelopes: &[Envelope]) -> Result<()> {
        let keys: Vec<_> = envelopes.iter().map(|e| self.key(e)).collect();

        self.mutate(move |tables| {
            if let Some(missing) = keys.iter().find(|k| !tables.incoming.contains_key(k)) {
                return Err(StoreError::NotFound(missing.id));
            }
            for key in &keys {
                if let Some(row) = tables.incoming.get_mut(key) {
                    row.owner_id = owner;
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete_incoming(&self, envelopes: &[Envelope]) -> Result<()> {
        let keys: Vec<_> = envelopes.iter().map(|e| self.key(e)).collect();

        self.mutate(move |tables| {
            for key in &keys {
                tables.incoming.remove(key);
            }
            Ok(())
        })
        .await
    }
}

/// Due scheduled envelopes ordered by scheduled time, then id
fn due_scheduled(tables: &Tables, now: DateTime<Utc>, limit: usize) -> Vec<Envelope> {
    let mut due: Vec<_> = tables
        .incoming
        .values()
        .filter(|e| e.status == EnvelopeStatus::Scheduled && !e.is_scheduled_for_later(now))
        .cloned()
        .collect();
    due.sort_by_key(|e| (e.scheduled_time, e.id));
    due.truncate(limit);
    due
}

#[async_trait]
impl Outbox for MemoryMessageStore {
    async fn store_outgoing(&self, envelope: &Envelope, owner: OwnerId) -> Result<()> {
        let key = outgoing_key(envelope);
        let capacity = self.inner.settings.capacity;
        let mut row = as_row(envelope, EnvelopeStatus::Outgoing);
        row.owner_id = owner;

        self.mutate(move |tables| {
            if !tables.outgoing.contains_key(&key) {
                tables.ensure_room(capacity, 1)?;
            }
            tables.outgoing.insert(key, row);
            Ok(())
        })
        .await
    }

    async fn load_outgoing(&self, destination: &Url) -> Result<Vec<Envelope>> {
        Ok(self.read(|tables| {
            tables
                .outgoing
                .values()
                .filter(|e| e.destination.as_ref() == Some(destination))
                .cloned()
                .collect()
        }))
    }

    async fn load_globally_owned_outgoing(&self, limit: usize) -> Result<Vec<Envelope>> {
        Ok(self.read(|tables| {
            tables
                .outgoing
                .values()
                .filter(|e| e.owner_id.is_any())
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<()> {
        self.discard_and_reassign_outgoing(envelopes, &[], OwnerId::ANY)
            .await
    }

    async fn reassign_outgoing(&self, owner: OwnerId, envelopes: &[Envelope]) -> Result<()> {
        self.discard_and_reassign_outgoing(&[], envelopes, owner)
            .await
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigns: &[Envelope],
        owner: OwnerId,
    ) -> Result<()> {
        let discards: Vec<_> = discards.iter().map(outgoing_key).collect();
        let reassigns: Vec<_> = reassigns
            .iter()
            .map(|e| (outgoing_key(e), e.attempts))
            .collect();

        self.mutate(move |tables| {
            if let Some((missing, _)) = reassigns
                .iter()
                .find(|(k, _)| !tables.outgoing.contains_key(k))
            {
                return Err(StoreError::NotFound(missing.id));
            }

            for key in &discards {
                tables.outgoing.remove(key);
            }
            for (key, attempts) in &reassigns {
                if let Some(row) = tables.outgoing.get_mut(key) {
                    row.owner_id = owner;
                    row.attempts = *attempts;
                }
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DeadLetters for MemoryMessageStore {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEnvelope>> {
        Ok(self.read(|tables| tables.dead_letters.values().take(limit).cloned().collect()))
    }

    async fn load_dead_letter(&self, key: &IdentityKey) -> Result<Option<DeadLetterEnvelope>> {
        Ok(self.read(|tables| tables.dead_letters.get(key).cloned()))
    }

    async fn mark_dead_letters_replayable(&self, keys: &[IdentityKey]) -> Result<usize> {
        let keys = keys.to_vec();

        self.mutate(move |tables| {
            let mut marked = 0;
            for key in &keys {
                if let Some(dead) = tables.dead_letters.get_mut(key) {
                    dead.replayable = true;
                    marked += 1;
                }
            }
            Ok(marked)
        })
        .await
    }

    async fn replay_dead_letters(&self) -> Result<usize> {
        let identity = self.inner.settings.identity;

        self.mutate(move |tables| {
            let mut replays = Vec::new();
            for (key, dead) in tables.dead_letters.iter().filter(|(_, d)| d.replayable) {
                let mut envelope = dead.envelope()?;
                envelope.status = EnvelopeStatus::Incoming;
                envelope.owner_id = OwnerId::ANY;
                envelope.attempts = 0;
                envelope.scheduled_time = None;
                replays.push((key.clone(), envelope));
            }

            let replayed = replays.len();
            for (key, envelope) in replays {
                tables.dead_letters.remove(&key);
                tables
                    .incoming
                    .insert(envelope.identity(identity), envelope);
            }
            Ok(replayed)
        })
        .await
    }

    async fn delete_dead_letters(&self, keys: &[IdentityKey]) -> Result<()> {
        let keys = keys.to_vec();

        self.mutate(move |tables| {
            for key in &keys {
                tables.dead_letters.remove(key);
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl NodeStore for MemoryMessageStore {
    async fn persist_node(&self, node: &Node) -> Result<u32> {
        let node = node.clone();

        self.mutate(move |tables| {
            if let Some(existing) = tables.nodes.get_mut(&node.id) {
                existing.control_uri = node.control_uri;
                existing.capabilities = node.capabilities;
                existing.last_health_check = node.last_health_check;
                return Ok(existing.assigned_number);
            }

            // A node coming back after ejection keeps its number so the rows
            // it already stamped stay reachable
            let previous = node.assigned_number;
            let number = if previous != 0
                && previous <= tables.last_node_number
                && !tables.nodes.values().any(|n| n.assigned_number == previous)
            {
                previous
            } else {
                tables.last_node_number += 1;
                tables.last_node_number
            };
            tables.nodes.insert(
                node.id,
                Node {
                    assigned_number: number,
                    ..node
                },
            );
            Ok(number)
        })
        .await
    }

    async fn delete_node(&self, id: NodeId) -> Result<()> {
        self.mutate(move |tables| {
            tables.nodes.remove(&id);
            if tables.leader == Some(id) {
                tables.leader = None;
            }
            Ok(())
        })
        .await
    }

    async fn load_all_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.read(|tables| {
            let mut nodes: Vec<_> = tables.nodes.values().cloned().collect();
            nodes.sort_by_key(|n| n.assigned_number);
            nodes
        }))
    }

    async fn load_node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.read(|tables| tables.nodes.get(&id).cloned()))
    }

    async fn load_all_stale_nodes(&self, stale_before: DateTime<Utc>) -> Result<Vec<Node>> {
        Ok(self.read(|tables| {
            tables
                .nodes
                .values()
                .filter(|n| n.last_health_check < stale_before)
                .cloned()
                .collect()
        }))
    }

    async fn overwrite_health_check_time(&self, id: NodeId, at: DateTime<Utc>) -> Result<()> {
        self.mutate(move |tables| {
            tables.node_mut(id)?.last_health_check = at;
            Ok(())
        })
        .await
    }

    async fn assign_agents(&self, id: NodeId, agents: &[Url]) -> Result<()> {
        let agents: BTreeSet<Url> = agents.iter().cloned().collect();

        self.mutate(move |tables| {
            tables.node_mut(id)?;
            for agent in &agents {
                tables.unassign_everywhere(agent);
            }
            tables.node_mut(id)?.active_agents = agents;
            Ok(())
        })
        .await
    }

    async fn remove_assignment(&self, id: NodeId, agent: &Url) -> Result<()> {
        let agent = agent.clone();

        self.mutate(move |tables| {
            tables.node_mut(id)?.active_agents.remove(&agent);
            Ok(())
        })
        .await
    }

    async fn add_assignment(&self, id: NodeId, agent: &Url) -> Result<()> {
        let agent = agent.clone();

        self.mutate(move |tables| {
            tables.node_mut(id)?;
            tables.unassign_everywhere(&agent);
            tables.node_mut(id)?.active_agents.insert(agent);
            Ok(())
        })
        .await
    }

    async fn mark_node_as_leader(
        &self,
        original: Option<NodeId>,
        candidate: NodeId,
    ) -> Result<Option<NodeId>> {
        self.mutate(move |tables| {
            if !tables.nodes.contains_key(&candidate) {
                return Err(StoreError::NodeNotFound(candidate));
            }
            if tables.leader == original {
                tables.leader = Some(candidate);
            }
            Ok(tables.leader)
        })
        .await
    }

    async fn find_leader_control_uri(&self) -> Result<Option<Url>> {
        Ok(self.read(|tables| {
            tables
                .leader
                .and_then(|leader| tables.nodes.get(&leader))
                .and_then(|node| node.control_uri.clone())
        }))
    }

    async fn log_record(&self, record: NodeRecord) -> Result<()> {
        self.mutate(move |tables| {
            tables.records.push(record);
            Ok(())
        })
        .await
    }

    async fn fetch_recent_records(&self, count: usize) -> Result<Vec<NodeRecord>> {
        Ok(self.read(|tables| {
            let mut records = tables.records.clone();
            records.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
            records.truncate(count);
            records
        }))
    }

    async fn delete_old_node_records(&self, before: DateTime<Utc>) -> Result<usize> {
        self.mutate(move |tables| {
            let previous = tables.records.len();
            tables.records.retain(|r| r.timestamp >= before);
            Ok(previous - tables.records.len())
        })
        .await
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    fn identity(&self) -> MessageIdentity {
        self.inner.settings.identity
    }

    async fn promote_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let identity = self.inner.settings.identity;

        self.mutate(move |tables| {
            let due = due_scheduled(tables, now, limit);
            for envelope in &due {
                if let Some(row) = tables.incoming.get_mut(&envelope.identity(identity)) {
                    row.status = EnvelopeStatus::Incoming;
                    row.owner_id = OwnerId::ANY;
                }
            }
            Ok(due.len())
        })
        .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.mutate(move |tables| {
            let previous = tables.rows();
            tables.incoming.retain(|_, e| {
                let retained = e.status != EnvelopeStatus::Handled
                    || e.keep_until.is_none_or(|until| until > now);
                retained && !e.is_expired(now)
            });
            tables.outgoing.retain(|_, e| !e.is_expired(now));
            Ok(previous - tables.rows())
        })
        .await
    }

    async fn release_ownership(&self, owner: OwnerId) -> Result<usize> {
        if owner.is_any() {
            return Ok(0);
        }

        self.mutate(move |tables| {
            let mut released = 0;
            for row in tables
                .incoming
                .values_mut()
                .chain(tables.outgoing.values_mut())
                .filter(|e| e.owner_id == owner)
            {
                row.owner_id = OwnerId::ANY;
                released += 1;
            }
            Ok(released)
        })
        .await
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts> {
        Ok(self.read(|tables| {
            let mut counts = PersistedCounts {
                outgoing: tables.outgoing.len() as u64,
                dead_letter: tables.dead_letters.len() as u64,
                ..PersistedCounts::default()
            };
            for envelope in tables.incoming.values() {
                match envelope.status {
                    EnvelopeStatus::Incoming => counts.incoming += 1,
                    EnvelopeStatus::Scheduled => counts.scheduled += 1,
                    EnvelopeStatus::Handled => counts.handled += 1,
                    EnvelopeStatus::Outgoing => {}
                }
            }
            counts
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn address() -> Url {
        Url::parse("queue://incoming").expect("valid url")
    }

    #[tokio::test]
    async fn duplicate_store_is_not_an_error() {
        let store = MemoryMessageStore::new();
        let envelope = Envelope::incoming(address()).with_id(1u128);

        assert_eq!(
            store.store_incoming(&envelope).await.expect("stores"),
            StoreOutcome::Stored
        );
        assert_eq!(
            store.store_incoming(&envelope).await.expect("stores"),
            StoreOutcome::Duplicate
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn capacity_limit_rejects_new_rows() {
        let store = MemoryMessageStore::with_settings(StoreSettings {
            capacity: Some(2),
            ..StoreSettings::default()
        });

        for id in 0..2u128 {
            store
                .store_incoming(&Envelope::incoming(address()).with_id(id))
                .await
                .expect("stores");
        }

        let err = store
            .store_incoming(&Envelope::incoming(address()).with_id(3u128))
            .await
            .expect_err("over capacity");
        assert!(err.to_string().contains("capacity exceeded"));

        // Duplicates never count against the limit
        assert!(
            store
                .store_incoming(&Envelope::incoming(address()).with_id(0u128))
                .await
                .expect("duplicate")
                .is_duplicate()
        );
    }

    #[tokio::test]
    async fn batch_skips_duplicates() {
        let store = MemoryMessageStore::new();
        let first = Envelope::incoming(address()).with_id(1u128);
        store.store_incoming(&first).await.expect("stores");

        let stored = store
            .store_incoming_batch(&[
                first.clone(),
                Envelope::incoming(address()).with_id(2u128),
                Envelope::incoming(address()).with_id(2u128),
            ])
            .await
            .expect("stores batch");

        assert_eq!(stored, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn reassign_is_all_or_nothing() {
        let store = MemoryMessageStore::new();
        let stored = Envelope::incoming(address()).with_id(1u128);
        let missing = Envelope::incoming(address()).with_id(2u128);
        store.store_incoming(&stored).await.expect("stores");

        let result = store
            .reassign_incoming(OwnerId(5), &[stored.clone(), missing])
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        let page = store
            .load_page_of_globally_owned_incoming(&address(), 10)
            .await
            .expect("loads");
        assert_eq!(page.len(), 1, "owner must be unchanged after a failed reassign");
    }

    #[tokio::test]
    async fn delete_expired_respects_retention() {
        let store = MemoryMessageStore::with_settings(StoreSettings {
            handled_retention: Duration::seconds(60),
            ..StoreSettings::default()
        });
        let envelope = Envelope::incoming(address()).with_id(1u128);
        store.store_incoming(&envelope).await.expect("stores");
        store
            .mark_incoming_as_handled(&envelope)
            .await
            .expect("handled");

        assert_eq!(store.delete_expired(Utc::now()).await.expect("deletes"), 0);
        assert_eq!(
            store
                .delete_expired(Utc::now() + Duration::seconds(120))
                .await
                .expect("deletes"),
            1
        );
    }

    #[tokio::test]
    async fn unbounded_retention_keeps_handled_rows() {
        let settings = crate::StoreConfig {
            handled_retention_secs: u64::MAX,
            ..crate::StoreConfig::default()
        }
        .settings();
        let store = MemoryMessageStore::with_settings(settings);
        let envelope = Envelope::incoming(address()).with_id(1u128);
        store.store_incoming(&envelope).await.expect("stores");
        store
            .mark_incoming_as_handled(&envelope)
            .await
            .expect("handled");

        assert_eq!(
            store
                .delete_expired(Utc::now() + Duration::days(365 * 100))
                .await
                .expect("deletes"),
            0
        );
        assert_eq!(store.fetch_counts().await.expect("counts").handled, 1);
    }

    #[tokio::test]
    async fn ejected_node_gets_its_number_back() {
        let store = MemoryMessageStore::new();
        let mut node = Node::new(NodeId::from(1u128));
        node.assigned_number = store.persist_node(&node).await.expect("persists");
        store.delete_node(node.id).await.expect("deletes");

        assert_eq!(
            store.persist_node(&node).await.expect("persists"),
            node.assigned_number
        );

        // A number held by someone else is never shared
        let mut imposter = Node::new(NodeId::from(2u128));
        imposter.assigned_number = node.assigned_number;
        let number = store.persist_node(&imposter).await.expect("persists");
        assert_ne!(number, node.assigned_number);

        // Nor is one the store never handed out
        let mut unknown = Node::new(NodeId::from(3u128));
        unknown.assigned_number = 40;
        assert_eq!(store.persist_node(&unknown).await.expect("persists"), number + 1);
    }

    #[tokio::test]
    async fn release_ownership_returns_rows_to_any() {
        let store = MemoryMessageStore::new();
        let destination = Url::parse("queue://x").expect("valid url");
        store
            .store_outgoing(&Envelope::outgoing(destination), OwnerId(2))
            .await
            .expect("stores");

        assert_eq!(store.release_ownership(OwnerId(2)).await.expect("releases"), 1);
        assert_eq!(
            store
                .load_globally_owned_outgoing(10)
                .await
                .expect("loads")
                .len(),
            1
        );
        assert_eq!(store.release_ownership(OwnerId::ANY).await.expect("noop"), 0);
    }
}
