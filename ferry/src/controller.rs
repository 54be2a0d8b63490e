use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, LazyLock},
};

use ferry_cluster::{ClusterConfig, NodeCoordinator, Recovery};
use ferry_common::{
    Envelope, NodeId, OwnerId, Signal, internal,
    logging::{self, LoggingConfig},
};
use ferry_delivery::{
    DeliveryConfig, DeliveryError, DurableReceiver, MessageHandler, ReceiveOutcome, SenderFactory,
    SendingAgents, scheduled_send_address,
};
use ferry_health::{HealthChecker, HealthConfig, HealthServer};
use ferry_store::{MessageStore, StoreConfig};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::local::{self, LocalFactory, LocalTransport, LoggingHandler};

/// Top level configuration of a ferry node
///
/// ```ron
/// Ferry (
///     store: (backend: File(path: "/var/lib/ferry")),
///     delivery: (default_mode: Durable),
///     cluster: (service_name: "orders"),
///     health: (listen_address: "127.0.0.1:8080"),
///     local_queues: ["local://orders"],
/// )
/// ```
#[derive(Default, Deserialize)]
pub struct Ferry {
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    delivery: DeliveryConfig,
    #[serde(default)]
    cluster: ClusterConfig,
    #[serde(default)]
    health: HealthConfig,

    /// In-process queues this node listens on
    #[serde(default, alias = "local_queue")]
    local_queues: Vec<Url>,

    #[serde(skip)]
    handlers: HashMap<Url, Arc<dyn MessageHandler>>,
    #[serde(skip)]
    factories: Vec<Arc<dyn SenderFactory>>,
}

impl fmt::Debug for Ferry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ferry")
            .field("store", &self.store)
            .field("delivery", &self.delivery)
            .field("cluster", &self.cluster)
            .field("health", &self.health)
            .field("local_queues", &self.local_queues)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("factories", &self.factories.len())
            .finish_non_exhaustive()
    }
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown_requested() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    // Nobody listening is fine, the node still shuts down
    let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
    Ok(())
}

impl Ferry {
    /// Handle envelopes arriving at the local queue `address`
    #[must_use]
    pub fn with_handler(mut self, address: Url, handler: Arc<dyn MessageHandler>) -> Self {
        if !self.local_queues.contains(&address) {
            self.local_queues.push(address.clone());
        }
        self.handlers.insert(address, handler);
        self
    }

    /// Make destinations of another URI scheme reachable
    #[must_use]
    pub fn with_sender_factory(mut self, factory: Arc<dyn SenderFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    #[must_use]
    pub const fn health_config(&self) -> &HealthConfig {
        &self.health
    }

    /// Open the store, join the cluster and start delivering
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened or the node cannot register.
    pub async fn start(self) -> anyhow::Result<FerryNode> {
        let store = self.store.into_store().await?;
        let node_id = NodeId::generate();
        let lock = Arc::new(store.leadership_lock(
            &self.cluster.service_name,
            node_id,
            self.cluster.leader_lease(),
        ));
        let store: Arc<dyn MessageStore> = Arc::new(store);

        let coordinator = Arc::new(NodeCoordinator::new(
            node_id,
            store.clone(),
            lock,
            self.cluster.clone(),
        ));

        let mut handlers = self.handlers;
        let receivers = self
            .local_queues
            .into_iter()
            .map(|address| {
                let handler = handlers
                    .remove(&address)
                    .unwrap_or_else(|| Arc::new(LoggingHandler) as Arc<dyn MessageHandler>);
                (address, handler)
            })
            .collect();

        FerryNode::start(
            store,
            coordinator,
            Parts {
                delivery: self.delivery,
                health: self.health,
                receivers,
                factories: self.factories,
                recovery_page_size: self.cluster.recovery_page_size,
            },
        )
        .await
    }

    /// Run until CTRL+C or SIGTERM, then leave the cluster
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails or the health server cannot bind.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init_with(&self.logging);
        internal!(level = INFO, "Controller running");

        let health_config = self.health.clone();
        let node = self.start().await?;

        let health = if health_config.enabled {
            let server = HealthServer::new(&health_config, node.health()).await?;
            Some(tokio::spawn(server.serve(SHUTDOWN_BROADCAST.subscribe())))
        } else {
            None
        };

        let ret = shutdown_requested().await;

        internal!(level = INFO, "Shutting down...");
        node.shutdown().await?;

        if let Some(health) = health {
            health.await??;
        }
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        ret
    }
}

struct Parts {
    delivery: DeliveryConfig,
    health: HealthConfig,
    receivers: Vec<(Url, Arc<dyn MessageHandler>)>,
    factories: Vec<Arc<dyn SenderFactory>>,
    recovery_page_size: usize,
}

/// A running node: store, coordinator, sending agents and local receivers
#[derive(Debug)]
pub struct FerryNode {
    store: Arc<dyn MessageStore>,
    coordinator: Arc<NodeCoordinator>,
    agents: Arc<SendingAgents>,
    local: Arc<LocalTransport>,
    health: Arc<HealthChecker>,
    token: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl FerryNode {
    async fn start(
        store: Arc<dyn MessageStore>,
        coordinator: Arc<NodeCoordinator>,
        parts: Parts,
    ) -> anyhow::Result<Self> {
        let health = Arc::new(HealthChecker::new(parts.health.max_backlog));
        health.set_store_ready(true);

        let owner = coordinator.start().await?;
        health.set_node_registered(true);

        let token = CancellationToken::new();
        let retry = parts.delivery.retry.clone();
        let agents = Arc::new(SendingAgents::new(
            store.clone(),
            owner,
            parts.delivery,
            token.child_token(),
        ));

        let local = Arc::new(LocalTransport::default());
        agents.register(Arc::new(LocalFactory::new(local.clone())));
        for factory in parts.factories {
            agents.register(factory);
        }

        let mut receivers = Vec::with_capacity(parts.receivers.len());
        for (address, handler) in parts.receivers {
            if address.scheme() != local::SCHEME {
                warn!(%address, "Only local queues can be listened on, ignoring");
                continue;
            }
            if scheduled_send_address().is_ok_and(|reserved| reserved == address) {
                warn!(%address, "Address is reserved for scheduled sends, ignoring");
                continue;
            }
            let receiver = Arc::new(
                DurableReceiver::new(address, store.clone(), handler, retry.clone())
                    .with_owner(owner),
            );
            local.listen(receiver.clone());
            receivers.push(receiver);
        }

        let recovery = Arc::new(Recovery::new(
            store.clone(),
            agents.clone(),
            receivers,
            parts.recovery_page_size,
        ));
        coordinator.run(recovery)?;
        health.set_agents_ready(true);

        let node = Self {
            store,
            coordinator,
            agents,
            local,
            health,
            token,
            refresher: Mutex::new(None),
        };
        node.spawn_refresher(parts.health.refresh_interval());

        internal!(
            level = INFO,
            "Node {} started as owner {owner}, listening on {:?}",
            node.coordinator.node_id(),
            node.local.addresses()
        );
        Ok(node)
    }

    fn spawn_refresher(&self, interval: std::time::Duration) {
        let token = self.token.child_token();
        let store = self.store.clone();
        let coordinator = self.coordinator.clone();
        let agents = self.agents.clone();
        let health = self.health.clone();

        let task = tokio::spawn(async move {
            loop {
                match store.fetch_counts().await {
                    Ok(counts) => health.set_counts(counts),
                    Err(err) => warn!(%err, "Unable to fetch store counts"),
                }
                health.set_leader(coordinator.is_leader());
                health.set_latched_agents(agents.latched_count());
                health.set_queued(agents.queued_count());

                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Health refresher stopped");
        });

        *self.refresher.lock() = Some(task);
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.coordinator.owner()
    }

    #[must_use]
    pub fn health(&self) -> Arc<HealthChecker> {
        self.health.clone()
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    #[must_use]
    pub const fn agents(&self) -> &Arc<SendingAgents> {
        &self.agents
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Arc<NodeCoordinator> {
        &self.coordinator
    }

    /// Hand an outgoing envelope to the sending agent of its destination
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope has no destination, no sender can
    /// reach it, or (for durable agents) it cannot be stored.
    pub async fn send(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.agents.route(envelope).await
    }

    /// Deliver an envelope received by an external transport to the local
    /// queue it was addressed to
    ///
    /// # Errors
    ///
    /// Returns an error if no local queue listens at the envelope's
    /// destination or the store fails.
    pub async fn receive(&self, envelope: Envelope) -> Result<ReceiveOutcome, DeliveryError> {
        let receiver = envelope
            .destination
            .as_ref()
            .and_then(|address| self.local.receiver(address))
            .ok_or(DeliveryError::NoDestination(envelope.id))?;
        receiver.receive(envelope).await
    }

    /// Leave the cluster
    ///
    /// Polling stops first, then every pipeline drains, then the node releases
    /// its lock and envelopes and removes itself from the node table.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while releasing the node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.health.set_agents_ready(false);

        let refresher = self.refresher.lock().take();
        self.coordinator.stop().await;
        self.agents.drain_all().await;
        self.token.cancel();
        if let Some(refresher) = refresher {
            refresher.await?;
        }

        self.coordinator.shutdown().await?;
        self.health.set_node_registered(false);
        self.health.set_leader(false);

        internal!(level = INFO, "Node {} stopped", self.coordinator.node_id());
        Ok(())
    }
}
