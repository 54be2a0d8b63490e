//! Cluster-wide exclusive leadership lock.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use ferry_common::NodeId;
use tracing::info;

use crate::Result;

/// Exclusive lock deciding which node performs the leader-only duties
///
/// At most one holder exists at any instant. Losing a race is not an error:
/// [`LeadershipLock::try_attain_leadership_lock`] simply returns `false`.
#[async_trait]
pub trait LeadershipLock: Send + Sync + Debug {
    /// Acquire or renew the lock without blocking
    async fn try_attain_leadership_lock(&self) -> Result<bool>;

    /// Whether this instance believed it held the lock at its last attempt
    fn has_leadership_lock(&self) -> bool;

    /// Give the lock up. Safe to call when not held.
    async fn release_leadership_lock(&self) -> Result<()>;
}

/// Current holder of a lock row
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    holder: NodeId,
    expires_at: DateTime<Utc>,
}

/// Lock rows shared by every lock handed out by one store
pub type LockTable = Arc<DashMap<String, Lease>>;

/// Leadership lock backed by the memory store's lock table
///
/// Every acquisition grants a lease. A holder that stops renewing (because it
/// crashed) loses the lock once the lease runs out.
#[derive(Debug)]
pub struct MemoryLeadershipLock {
    table: LockTable,
    lock_id: String,
    node: NodeId,
    lease: chrono::Duration,
    held: AtomicBool,
}

impl MemoryLeadershipLock {
    pub(crate) fn new(
        table: LockTable,
        lock_id: String,
        node: NodeId,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            table,
            lock_id,
            node,
            lease,
            held: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }
}

#[async_trait]
impl LeadershipLock for MemoryLeadershipLock {
    async fn try_attain_leadership_lock(&self) -> Result<bool> {
        let now = Utc::now();
        let lease = Lease {
            holder: self.node,
            expires_at: now + self.lease,
        };

        let attained = match self.table.entry(self.lock_id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current.holder == self.node || current.expires_at <= now {
                    if current.holder != self.node {
                        info!(
                            lock = %self.lock_id,
                            previous = %current.holder,
                            "Taking over lapsed leadership lock"
                        );
                    }
                    entry.insert(lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(lease);
                true
            }
        };

        self.held.store(attained, Ordering::Release);
        Ok(attained)
    }

    fn has_leadership_lock(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    async fn release_leadership_lock(&self) -> Result<()> {
        self.table
            .remove_if(&self.lock_id, |_, lease| lease.holder == self.node);
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(table: &LockTable, node: u128, lease: chrono::Duration) -> MemoryLeadershipLock {
        MemoryLeadershipLock::new(
            table.clone(),
            "orders:leader".to_string(),
            NodeId::from(node),
            lease,
        )
    }

    #[tokio::test]
    async fn only_one_holder() {
        let table = LockTable::default();
        let first = lock(&table, 1, chrono::Duration::seconds(30));
        let second = lock(&table, 2, chrono::Duration::seconds(30));

        assert!(first.try_attain_leadership_lock().await.expect("attempt"));
        assert!(!second.try_attain_leadership_lock().await.expect("attempt"));
        assert!(first.has_leadership_lock());
        assert!(!second.has_leadership_lock());

        // Renewal by the holder succeeds
        assert!(first.try_attain_leadership_lock().await.expect("renew"));
    }

    #[tokio::test]
    async fn release_frees_the_lock() {
        let table = LockTable::default();
        let first = lock(&table, 1, chrono::Duration::seconds(30));
        let second = lock(&table, 2, chrono::Duration::seconds(30));

        // Releasing an unheld lock is harmless
        second.release_leadership_lock().await.expect("release");

        assert!(first.try_attain_leadership_lock().await.expect("attempt"));
        first.release_leadership_lock().await.expect("release");
        assert!(!first.has_leadership_lock());
        assert!(second.try_attain_leadership_lock().await.expect("attempt"));
    }

    #[tokio::test]
    async fn lapsed_lease_can_be_taken() {
        let table = LockTable::default();
        let crashed = lock(&table, 1, chrono::Duration::zero());
        let survivor = lock(&table, 2, chrono::Duration::seconds(30));

        assert!(crashed.try_attain_leadership_lock().await.expect("attempt"));
        assert!(survivor.try_attain_leadership_lock().await.expect("attempt"));
    }
}
