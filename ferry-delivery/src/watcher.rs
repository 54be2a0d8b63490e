use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Sender;

/// Something that can be resumed once its destination answers again
#[async_trait]
pub trait Resumable: Send + Sync {
    /// Unlatch and replay whatever was held back
    async fn resume(&self);
}

/// Pings a latched agent's destination until it recovers
///
/// Ping errors are swallowed and retried on the next interval. The first
/// successful ping resumes the agent and ends the watcher. Cancelling the
/// token, or dropping the agent, also ends it.
#[derive(Debug)]
pub struct CircuitWatcher;

impl CircuitWatcher {
    pub fn spawn(
        sender: Arc<dyn Sender>,
        interval: Duration,
        cancel: CancellationToken,
        target: Weak<dyn Resumable>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let destination = sender.destination().clone();

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(%destination, "Circuit watcher cancelled");
                        return;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                match sender.ping().await {
                    Ok(true) => break,
                    Ok(false) => debug!(%destination, "Destination still unavailable"),
                    Err(error) => debug!(%destination, %error, "Ping failed"),
                }
            }

            let Some(target) = target.upgrade() else {
                return;
            };

            info!(%destination, "Destination answered ping, resuming sending agent");
            target.resume().await;
        })
    }
}
