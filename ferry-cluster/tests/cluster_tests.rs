//! Leadership, ejection and recovery across nodes sharing one store

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use ferry_cluster::{ClusterConfig, NodeCoordinator, Recovery};
use ferry_common::{Envelope, EnvelopeId, Node, NodeEventType, NodeId, OwnerId};
use ferry_delivery::{
    AgentSettings, DeliveryConfig, DeliveryError, DurableReceiver, EndpointMode, HandlerError,
    MessageHandler, RetryPolicy, SendError, Sender, SenderFactory, SendingAgents,
    scheduled_send_address,
};
use ferry_store::{
    BackendConfig, Inbox, MemoryMessageStore, MessageStore, NodeStore, Outbox, StoreConfig,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

fn queue(name: &str) -> Url {
    Url::parse(&format!("queue://{name}")).expect("valid url")
}

fn config() -> ClusterConfig {
    ClusterConfig {
        service_name: "orders".into(),
        heartbeat_interval_ms: 10,
        leadership_poll_interval_ms: 10,
        recovery_interval_ms: 10,
        first_poll_jitter_ms: 0,
        ..ClusterConfig::default()
    }
}

fn coordinator(store: &Arc<MemoryMessageStore>, id: u128, lease: chrono::Duration) -> Arc<NodeCoordinator> {
    let id = NodeId::from(id);
    let lock = Arc::new(store.leadership_lock("orders", id, lease));
    Arc::new(NodeCoordinator::new(id, store.clone(), lock, config()))
}

#[derive(Debug, Default)]
struct Recording {
    delivered: Mutex<Vec<EnvelopeId>>,
}

#[derive(Debug)]
struct RecordingSender {
    destination: Url,
    log: Arc<Recording>,
}

#[async_trait]
impl Sender for RecordingSender {
    fn destination(&self) -> &Url {
        &self.destination
    }

    async fn ping(&self) -> Result<bool, SendError> {
        Ok(true)
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        self.log.delivered.lock().push(envelope.id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordingFactory {
    log: Arc<Recording>,
}

impl SenderFactory for RecordingFactory {
    fn scheme(&self) -> &str {
        "queue"
    }

    fn create(&self, destination: &Url) -> Result<Arc<dyn Sender>, DeliveryError> {
        Ok(Arc::new(RecordingSender {
            destination: destination.clone(),
            log: self.log.clone(),
        }))
    }
}

#[derive(Debug, Default)]
struct Counting {
    handled: Mutex<Vec<EnvelopeId>>,
}

#[async_trait]
impl MessageHandler for Counting {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self.handled.lock().push(envelope.id);
        Ok(())
    }
}

fn agents(store: &Arc<MemoryMessageStore>, owner: OwnerId) -> (Arc<SendingAgents>, Arc<Recording>) {
    let factory = RecordingFactory::default();
    let log = factory.log.clone();
    let agents = Arc::new(SendingAgents::new(
        store.clone(),
        owner,
        DeliveryConfig {
            default_mode: EndpointMode::Durable,
            agent: AgentSettings {
                batch_window_ms: 5,
                ..AgentSettings::default()
            },
            ..DeliveryConfig::default()
        },
        CancellationToken::new(),
    ));
    agents.register(Arc::new(factory));
    (agents, log)
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn leadership_fails_over_when_the_lease_lapses() {
    let store = Arc::new(MemoryMessageStore::new());
    let lease = chrono::Duration::milliseconds(100);
    let first = coordinator(&store, 1, lease);
    let second = coordinator(&store, 2, lease);
    first.start().await.expect("starts");
    second.start().await.expect("starts");

    assert!(first.leadership_tick().await.expect("ticks").is_some());
    assert!(second.leadership_tick().await.expect("ticks").is_none());
    assert!(first.is_leader());
    assert!(!second.is_leader());

    // The first node stops renewing
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(second.leadership_tick().await.expect("ticks").is_some());
    assert!(first.leadership_tick().await.expect("ticks").is_none());
    assert!(second.is_leader());
    assert!(!first.is_leader());

    let events: Vec<NodeEventType> = store
        .fetch_recent_records(10)
        .await
        .expect("records")
        .into_iter()
        .map(|record| record.event)
        .collect();
    assert_eq!(
        events
            .iter()
            .filter(|event| **event == NodeEventType::LeadershipAssumed)
            .count(),
        2
    );
    assert!(events.contains(&NodeEventType::LeadershipLost));
}

#[tokio::test]
async fn leader_ejects_stale_nodes_and_reassigns_their_work() {
    let store = Arc::new(MemoryMessageStore::new());
    let leader = coordinator(&store, 1, chrono::Duration::seconds(15));
    leader.start().await.expect("starts");

    let mut dormant = Node::new(NodeId::from(2u128)).with_capability(queue("x"));
    dormant.last_health_check = Utc::now() - chrono::Duration::hours(1);
    let number = store.persist_node(&dormant).await.expect("persists");
    store
        .assign_agents(dormant.id, &[queue("x")])
        .await
        .expect("assigns");

    let envelope = Envelope::outgoing(queue("x"))
        .with_id(5u128)
        .with_data("Ping", b"payload".as_slice());
    store
        .store_outgoing(&envelope, OwnerId(number))
        .await
        .expect("stores");

    let report = leader
        .leadership_tick()
        .await
        .expect("ticks")
        .expect("is leader");
    assert_eq!(report.ejected, 1);

    assert!(store.load_node(dormant.id).await.expect("loads").is_none());
    let orphaned = store
        .load_globally_owned_outgoing(10)
        .await
        .expect("loads");
    assert_eq!(orphaned.len(), 1);

    let survivor = store
        .load_node(leader.node_id())
        .await
        .expect("loads")
        .expect("exists");
    assert!(survivor.active_agents.contains(&queue("x")));
}

#[tokio::test]
async fn recovery_claims_orphaned_envelopes() {
    let store = Arc::new(MemoryMessageStore::new());
    let node = coordinator(&store, 1, chrono::Duration::seconds(15));
    let owner = node.start().await.expect("starts");
    let (agents, log) = agents(&store, owner);

    let handler = Arc::new(Counting::default());
    let receiver = Arc::new(DurableReceiver::new(
        queue("inbox"),
        store.clone(),
        handler.clone(),
        RetryPolicy::default(),
    ));

    // An outbox row from a node that is gone
    store
        .store_outgoing(
            &Envelope::outgoing(queue("x"))
                .with_id(1u128)
                .with_data("Ping", b"payload".as_slice()),
            OwnerId::ANY,
        )
        .await
        .expect("stores");

    // An incoming envelope nobody handled
    store
        .store_incoming(
            &Envelope::incoming(queue("inbox"))
                .with_id(2u128)
                .with_data("PlaceOrder", b"{}".as_slice()),
        )
        .await
        .expect("stores");

    // A scheduled send that has come due
    let mut job = Envelope::outgoing(queue("x"))
        .with_id(3u128)
        .with_data("Ping", b"later".as_slice())
        .scheduled_at(Utc::now() - chrono::Duration::seconds(1));
    job.received_at = Some(scheduled_send_address().expect("valid address"));
    store.schedule_job(&job).await.expect("schedules");
    store
        .promote_scheduled(Utc::now(), 10)
        .await
        .expect("promotes");

    let recovery = Recovery::new(store.clone(), agents.clone(), vec![receiver], 10);
    let report = recovery.recover_once().await.expect("recovers");
    assert_eq!(report.incoming, 1);
    assert_eq!(report.scheduled_sends, 1);
    assert_eq!(report.outgoing, 1);

    assert_eq!(*handler.handled.lock(), vec![EnvelopeId::from(2u128)]);
    eventually("both sends", || log.delivered.lock().len() == 2).await;
    agents.drain_all().await;

    let mut delivered = log.delivered.lock().clone();
    delivered.sort();
    assert_eq!(delivered, vec![EnvelopeId::from(1u128), EnvelopeId::from(3u128)]);

    let counts = store.fetch_counts().await.expect("counts");
    assert_eq!(counts.outgoing, 0);
    assert_eq!(counts.scheduled, 0);
    assert_eq!(counts.handled, 1);
}

#[tokio::test]
async fn graceful_shutdown_releases_everything() {
    let store = Arc::new(MemoryMessageStore::new());
    let node = coordinator(&store, 1, chrono::Duration::seconds(15));
    let owner = node.start().await.expect("starts");
    let (agents, _log) = agents(&store, owner);

    let recovery = Arc::new(Recovery::new(store.clone(), agents.clone(), Vec::new(), 10));
    node.run(recovery).expect("runs");
    eventually("leadership", || node.is_leader()).await;

    store
        .store_outgoing(
            &Envelope::outgoing(queue("held")).with_id(9u128),
            owner,
        )
        .await
        .expect("stores");

    node.shutdown().await.expect("shuts down");

    assert!(!node.is_leader());
    assert!(store.load_node(node.node_id()).await.expect("loads").is_none());
    assert_eq!(
        store
            .load_globally_owned_outgoing(10)
            .await
            .expect("loads")
            .len(),
        1
    );

    let events: Vec<NodeEventType> = store
        .fetch_recent_records(10)
        .await
        .expect("records")
        .into_iter()
        .map(|record| record.event)
        .collect();
    assert!(events.contains(&NodeEventType::NodeStarted));
    assert!(events.contains(&NodeEventType::NodeStopped));

    // A second shutdown is a no-op
    node.shutdown().await.expect("idempotent");
}

#[tokio::test]
async fn rejoining_after_ejection_keeps_the_owner() {
    let store = Arc::new(MemoryMessageStore::new());
    let node = coordinator(&store, 1, chrono::Duration::seconds(15));
    let owner = node.start().await.expect("starts");
    let (agents, _log) = agents(&store, owner);

    store
        .store_outgoing(&Envelope::outgoing(queue("held")).with_id(1u128), owner)
        .await
        .expect("stores");

    // The leader ejected this node while it was unresponsive
    store.delete_node(node.node_id()).await.expect("ejects");
    node.heartbeat().await.expect("rejoins");

    assert_eq!(node.owner(), owner);
    assert_eq!(agents.owner(), node.owner());
    assert!(store.load_node(node.node_id()).await.expect("loads").is_some());

    store
        .store_outgoing(
            &Envelope::outgoing(queue("held")).with_id(2u128),
            agents.owner(),
        )
        .await
        .expect("stores");

    node.shutdown().await.expect("shuts down");

    assert!(store.load_all_nodes().await.expect("loads").is_empty());
    let released = store
        .load_globally_owned_outgoing(10)
        .await
        .expect("loads");
    assert_eq!(released.len(), 2);
    assert!(released.iter().all(|e| e.owner_id == OwnerId::ANY));
}

#[tokio::test]
async fn leadership_waits_for_the_leader_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store");
    let store = Arc::new(
        StoreConfig {
            backend: BackendConfig::File { path: path.clone() },
            ..StoreConfig::default()
        }
        .into_store()
        .await
        .expect("opens"),
    );
    let node = coordinator(&store, 1, chrono::Duration::seconds(15));
    node.start().await.expect("starts");

    // The lock is won but the leader row cannot be written
    std::fs::remove_dir_all(&path).expect("removes store directory");
    assert!(node.leadership_tick().await.is_err());
    assert!(!node.is_leader());

    std::fs::create_dir_all(&path).expect("restores store directory");
    assert!(node.leadership_tick().await.expect("ticks").is_some());
    assert!(node.is_leader());
    assert_eq!(
        store
            .mark_node_as_leader(Some(node.node_id()), node.node_id())
            .await
            .expect("reads leader"),
        Some(node.node_id())
    );
}
