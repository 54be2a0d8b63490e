//! Duties performed only by the node holding the leadership lock.

use chrono::{DateTime, Utc};
use ferry_common::{Node, NodeEventType, NodeId, NodeRecord};
use ferry_store::MessageStore;
use tracing::{info, warn};

use crate::{ClusterConfig, Result};

/// What one pass of leader duties did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DutyReport {
    /// Scheduled envelopes made available for handling
    pub promoted: usize,
    /// Expired or retention-elapsed rows removed
    pub expired: usize,
    /// Stale nodes removed from the cluster
    pub ejected: usize,
    /// Node events pruned from the log
    pub pruned: usize,
}

/// Run every leader duty once
///
/// `leader` is never treated as stale, even when its own heartbeat is late.
pub async fn perform(
    store: &dyn MessageStore,
    config: &ClusterConfig,
    leader: NodeId,
) -> Result<DutyReport> {
    let now = Utc::now();

    let promoted = store.promote_scheduled(now, config.scheduled_page_size).await?;
    let expired = store.delete_expired(now).await?;
    let ejected = eject_stale_nodes(store, config, leader).await?;
    let pruned = store
        .delete_old_node_records(before(now, config.node_record_retention()))
        .await?;

    let report = DutyReport {
        promoted,
        expired,
        ejected,
        pruned,
    };
    if report != DutyReport::default() {
        info!(?report, "Leader duties completed");
    }
    Ok(report)
}

fn before(now: DateTime<Utc>, window: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Release the envelopes and agents of every node that stopped heartbeating
async fn eject_stale_nodes(
    store: &dyn MessageStore,
    config: &ClusterConfig,
    leader: NodeId,
) -> Result<usize> {
    let stale_before = before(Utc::now(), config.stale_node_threshold());
    let stale: Vec<Node> = store
        .load_all_stale_nodes(stale_before)
        .await?
        .into_iter()
        .filter(|node| node.id != leader)
        .collect();

    if stale.is_empty() {
        return Ok(0);
    }

    let live: Vec<Node> = store
        .load_all_nodes()
        .await?
        .into_iter()
        .filter(|node| !stale.iter().any(|s| s.id == node.id))
        .collect();

    let mut next = 0usize;
    for node in &stale {
        let released = store.release_ownership(node.owner_id()).await?;

        let mut reassigned = Vec::new();
        for agent in &node.active_agents {
            let Some(target) = live.get(next % live.len().max(1)) else {
                warn!(node = %node.id, %agent, "No live node to take over agent");
                continue;
            };
            next += 1;
            store.add_assignment(target.id, agent).await?;
            reassigned.push((agent.clone(), target.assigned_number));
        }

        store.delete_node(node.id).await?;

        warn!(
            node = %node.id,
            number = node.assigned_number,
            released,
            agents = reassigned.len(),
            last_health_check = %node.last_health_check,
            "Ejected dormant node"
        );
        store
            .log_record(NodeRecord::new(
                node.assigned_number,
                NodeEventType::DormantNodeEjected,
                format!("released {released} envelope(s)"),
                &config.service_name,
            ))
            .await?;

        for (agent, number) in reassigned {
            store
                .log_record(NodeRecord::new(
                    number,
                    NodeEventType::AgentsAssigned,
                    format!("took over {agent} from node {}", node.assigned_number),
                    &config.service_name,
                ))
                .await?;
        }
    }

    Ok(stale.len())
}
