use chrono::Utc;
use ferry_common::Node;
use ferry_store::{MessageStore, StoreError};
use tracing::{trace, warn};

use crate::Result;

/// Refresh the node's health check time
///
/// A node whose row has disappeared (because the leader ejected it as stale)
/// registers itself again. Returns the node number the store now holds for it.
pub async fn beat(store: &dyn MessageStore, node: &Node) -> Result<u32> {
    let now = Utc::now();

    match store.overwrite_health_check_time(node.id, now).await {
        Ok(()) => {
            trace!(node = %node.id, "Heartbeat");
            Ok(node.assigned_number)
        }
        Err(StoreError::NodeNotFound(_)) => {
            let mut node = node.clone();
            node.last_health_check = now;
            let number = store.persist_node(&node).await?;
            warn!(
                node = %node.id,
                previous = node.assigned_number,
                number,
                "Node row was missing, registered again"
            );
            Ok(number)
        }
        Err(err) => Err(err.into()),
    }
}
