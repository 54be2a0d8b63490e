//! Node lifecycle: registration, background loops, graceful shutdown.
//!
//! ```text
//! new ─> start (persist node, owner id) ─> run (heartbeat, leadership, recovery)
//!                                              │
//!                                  stop ─> shutdown (release lock, envelopes, node row)
//! ```

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ferry_common::{Node, NodeEventType, NodeId, NodeRecord, OwnerId, cluster};
use ferry_store::{LeadershipLock, MessageStore};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ClusterConfig, ClusterError, Result, heartbeat,
    leader::{self, DutyReport},
    recovery::Recovery,
};

/// Coordinates this process with the other nodes sharing the store
#[derive(Debug)]
pub struct NodeCoordinator {
    store: Arc<dyn MessageStore>,
    lock: Arc<dyn LeadershipLock>,
    config: ClusterConfig,
    node: Mutex<Node>,
    started: AtomicBool,
    leader: AtomicBool,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeCoordinator {
    pub fn new(
        id: NodeId,
        store: Arc<dyn MessageStore>,
        lock: Arc<dyn LeadershipLock>,
        config: ClusterConfig,
    ) -> Self {
        let mut node = Node::new(id);
        node.control_uri.clone_from(&config.control_uri);
        node.capabilities = config.capabilities.iter().cloned().collect();

        Self {
            store,
            lock,
            config,
            node: Mutex::new(node),
            started: AtomicBool::new(false),
            leader: AtomicBool::new(false),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node.lock().id
    }

    /// Owner id stamped on the envelopes this node holds
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.node.lock().owner_id()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Register the node with the store
    ///
    /// # Errors
    ///
    /// Fails if the node is already registered or the store is unavailable.
    pub async fn start(&self) -> Result<OwnerId> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ClusterError::AlreadyRunning);
        }

        let node = self.node.lock().clone();
        let number = match self.store.persist_node(&node).await {
            Ok(number) => number,
            Err(err) => {
                self.started.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        self.node.lock().assigned_number = number;

        self.store
            .log_record(NodeRecord::new(
                number,
                NodeEventType::NodeStarted,
                format!("node {} started", node.id),
                &self.config.service_name,
            ))
            .await?;

        info!(node = %node.id, number, service = %self.config.service_name, "Node registered");
        Ok(OwnerId(number))
    }

    /// Spawn the heartbeat, leadership and recovery loops
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotStarted`] if [`Self::start`] has not run.
    pub fn run(self: &Arc<Self>, recovery: Arc<Recovery>) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(ClusterError::NotStarted);
        }

        let this = self.clone();
        let heartbeat = self.spawn_loop("heartbeat", self.config.heartbeat_interval(), move || {
            let this = this.clone();
            async move { this.heartbeat().await }
        });

        let this = self.clone();
        let leadership = self.spawn_loop(
            "leadership",
            self.config.leadership_poll_interval(),
            move || {
                let this = this.clone();
                async move { this.leadership_tick().await.map(|_| ()) }
            },
        );

        let recover = self.spawn_loop("recovery", self.config.recovery_interval(), move || {
            let recovery = recovery.clone();
            async move { recovery.recover_once().await.map(|_| ()) }
        });

        self.tasks.lock().extend([heartbeat, leadership, recover]);
        Ok(())
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, interval: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.token.child_token();
        let jitter = random_delay(self.config.first_poll_jitter());

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(jitter) => {}
            }

            loop {
                if let Err(err) = tick().await {
                    warn!(task = name, %err, transient = err.is_transient(), "Coordination tick failed");
                }

                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }

            debug!(task = name, "Coordination loop stopped");
        })
    }

    /// Refresh this node's health check time
    pub async fn heartbeat(&self) -> Result<()> {
        let node = self.node.lock().clone();
        let number = heartbeat::beat(self.store.as_ref(), &node).await?;

        if number != node.assigned_number {
            error!(
                node = %node.id,
                previous = node.assigned_number,
                number,
                "Node was ejected and re-registered under a new number"
            );
            self.node.lock().assigned_number = number;

            // Rows stamped with the old number would have no owner left
            let released = self.store.release_ownership(node.owner_id()).await?;
            warn!(node = %node.id, released, "Released envelopes held under the previous number");
        }
        Ok(())
    }

    /// Try to take or renew leadership and, while leader, run the duties
    ///
    /// Returns the duties' report when this node is the leader.
    pub async fn leadership_tick(&self) -> Result<Option<DutyReport>> {
        let acquired = self.lock.try_attain_leadership_lock().await?;
        let was_leader = self.leader.load(Ordering::Acquire);
        let node = self.node.lock().clone();

        if !acquired {
            self.leader.store(false, Ordering::Release);
            if was_leader {
                warn!(node = %node.id, "Leadership lost");
                self.record(&node, NodeEventType::LeadershipLost, "lease was taken over")
                    .await?;
            }
            return Ok(None);
        }

        if !was_leader {
            // Only a claimed leader row makes this node the leader, a failed
            // claim is retried on the next tick
            self.claim_leader_row(node.id).await?;
            self.leader.store(true, Ordering::Release);
            info!(node = %node.id, number = node.assigned_number, "Leadership assumed");
            self.record(&node, NodeEventType::LeadershipAssumed, "acquired leadership lock")
                .await?;
        }

        leader::perform(self.store.as_ref(), &self.config, node.id)
            .await
            .map(Some)
    }

    /// Point the store's leader row at this node
    async fn claim_leader_row(&self, id: NodeId) -> Result<()> {
        let current = self.store.mark_node_as_leader(None, id).await?;
        if current == Some(id) {
            return Ok(());
        }

        let replaced = self.store.mark_node_as_leader(current, id).await?;
        if replaced != Some(id) {
            warn!(node = %id, leader = ?replaced, "Leader row changed while taking over");
        }
        Ok(())
    }

    async fn record(&self, node: &Node, event: NodeEventType, description: &str) -> Result<()> {
        self.store
            .log_record(NodeRecord::new(
                node.assigned_number,
                event,
                description,
                &self.config.service_name,
            ))
            .await?;
        Ok(())
    }

    /// Stop the background loops and wait for them
    pub async fn stop(&self) {
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(%err, "Coordination loop panicked");
            }
        }
    }

    /// Leave the cluster
    ///
    /// Stops the loops, gives up leadership, hands this node's envelopes back
    /// to the cluster and removes the node row. Sending agents should be
    /// drained before this runs.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await;

        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if self.lock.has_leadership_lock() {
            self.lock.release_leadership_lock().await?;
        }
        self.leader.store(false, Ordering::Release);

        let node = self.node.lock().clone();
        let released = self.store.release_ownership(node.owner_id()).await?;

        self.record(
            &node,
            NodeEventType::NodeStopped,
            &format!("released {released} envelope(s)"),
        )
        .await?;
        self.store.delete_node(node.id).await?;

        cluster!(level = INFO, "Node {} left the cluster, released {released} envelope(s)", node.id);
        Ok(())
    }
}

fn random_delay(max: Duration) -> Duration {
    let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=millis))
}
