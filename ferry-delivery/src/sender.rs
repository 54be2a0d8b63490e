//! Transport contracts.
//!
//! A transport implements [`Sender`] (one envelope at a time) and optionally
//! [`SenderProtocol`] when it can ship a whole batch natively. The pipeline
//! reports every batch back through exactly one [`SenderCallback`] method.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use ferry_common::{Envelope, SerializationError};
use tracing::{debug, warn};
use url::Url;

use crate::{DeliveryError, OutgoingMessageBatch, SendError};

#[async_trait]
pub trait Sender: Send + Sync + Debug {
    fn destination(&self) -> &Url;

    /// Whether the transport can hold an envelope until its scheduled time
    fn supports_native_scheduled_send(&self) -> bool {
        false
    }

    /// Probe the destination. `Ok(true)` means it is accepting messages again.
    async fn ping(&self) -> Result<bool, SendError>;

    async fn send(&self, envelope: &Envelope) -> Result<(), SendError>;

    fn supports_native_scheduled_cancellation(&self) -> bool {
        false
    }

    /// Cancel a natively scheduled message by its transport token
    async fn cancel_scheduled_message(&self, token: &str) -> Result<(), SendError> {
        debug!(token, "Scheduled cancellation requested from a sender without support");
        Err(SendError::Unsupported(self.destination().clone()))
    }
}

/// Builds senders for every destination of one URI scheme
pub trait SenderFactory: Send + Sync + Debug {
    fn scheme(&self) -> &str;

    fn create(&self, destination: &Url) -> Result<Arc<dyn Sender>, DeliveryError>;
}

/// Terminal outcomes of a batch
#[async_trait]
pub trait SenderCallback: Send + Sync {
    async fn mark_successful(&self, batch: OutgoingMessageBatch);

    async fn mark_processing_failure(&self, batch: OutgoingMessageBatch, error: SendError);

    async fn mark_timed_out(&self, batch: OutgoingMessageBatch);

    async fn mark_serialization_failure(
        &self,
        batch: OutgoingMessageBatch,
        error: SerializationError,
    );

    async fn mark_queue_does_not_exist(&self, batch: OutgoingMessageBatch);

    /// The batch was not attempted because the agent's circuit is open
    async fn mark_sender_is_latched(&self, batch: OutgoingMessageBatch);
}

#[async_trait]
pub trait SenderProtocol: Send + Sync + Debug {
    /// Ship `batch` and report the outcome through exactly one `callback` method
    async fn send_batch(&self, callback: &dyn SenderCallback, batch: OutgoingMessageBatch);
}

/// Adapts any [`Sender`] into a [`SenderProtocol`]
///
/// Envelopes go out one by one in batch order. The first failure ends the
/// batch and the whole batch is reported with that failure.
#[derive(Debug)]
pub struct PerEnvelopeProtocol {
    sender: Arc<dyn Sender>,
    timeout: Duration,
}

impl PerEnvelopeProtocol {
    #[must_use]
    pub fn new(sender: Arc<dyn Sender>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }

    async fn send_all(&self, batch: &OutgoingMessageBatch) -> Result<(), SendError> {
        for envelope in &batch.envelopes {
            tokio::time::timeout(self.timeout, self.sender.send(envelope))
                .await
                .map_err(|_| SendError::Timeout(self.timeout))??;
        }
        Ok(())
    }
}

#[async_trait]
impl SenderProtocol for PerEnvelopeProtocol {
    async fn send_batch(&self, callback: &dyn SenderCallback, batch: OutgoingMessageBatch) {
        match self.send_all(&batch).await {
            Ok(()) => callback.mark_successful(batch).await,
            Err(SendError::Timeout(after)) => {
                warn!(destination = %batch.destination, ?after, "Batch send timed out");
                callback.mark_timed_out(batch).await;
            }
            Err(SendError::QueueDoesNotExist(queue)) => {
                warn!(destination = %queue, "Destination queue does not exist");
                callback.mark_queue_does_not_exist(batch).await;
            }
            Err(SendError::Serialization(error)) => {
                callback.mark_serialization_failure(batch, error).await;
            }
            Err(error) => callback.mark_processing_failure(batch, error).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug)]
    struct FailsAfter {
        destination: Url,
        successes: usize,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Sender for FailsAfter {
        fn destination(&self) -> &Url {
            &self.destination
        }

        async fn ping(&self) -> Result<bool, SendError> {
            Ok(true)
        }

        async fn send(&self, _envelope: &Envelope) -> Result<(), SendError> {
            if self.sent.fetch_add(1, Ordering::SeqCst) < self.successes {
                Ok(())
            } else {
                Err(SendError::QueueDoesNotExist(self.destination.clone()))
            }
        }
    }

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl SenderCallback for Outcomes {
        async fn mark_successful(&self, _: OutgoingMessageBatch) {
            self.0.lock().push("successful");
        }
        async fn mark_processing_failure(&self, _: OutgoingMessageBatch, _: SendError) {
            self.0.lock().push("failure");
        }
        async fn mark_timed_out(&self, _: OutgoingMessageBatch) {
            self.0.lock().push("timed-out");
        }
        async fn mark_serialization_failure(&self, _: OutgoingMessageBatch, _: SerializationError) {
            self.0.lock().push("serialization");
        }
        async fn mark_queue_does_not_exist(&self, _: OutgoingMessageBatch) {
            self.0.lock().push("no-queue");
        }
        async fn mark_sender_is_latched(&self, _: OutgoingMessageBatch) {
            self.0.lock().push("latched");
        }
    }

    fn batch(destination: &Url, count: usize) -> OutgoingMessageBatch {
        OutgoingMessageBatch::new(
            destination.clone(),
            (0..count)
                .map(|_| Envelope::outgoing(destination.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn stops_at_first_failure_and_reports_once() {
        let destination = Url::parse("queue://x").expect("valid url");
        let sender = Arc::new(FailsAfter {
            destination: destination.clone(),
            successes: 1,
            sent: AtomicUsize::new(0),
        });
        let protocol = PerEnvelopeProtocol::new(sender.clone(), Duration::from_secs(1));
        let outcomes = Outcomes::default();

        protocol.send_batch(&outcomes, batch(&destination, 3)).await;

        assert_eq!(sender.sent.load(Ordering::SeqCst), 2);
        assert_eq!(*outcomes.0.lock(), vec!["no-queue"]);
    }

    #[tokio::test]
    async fn reports_success_for_complete_batch() {
        let destination = Url::parse("queue://x").expect("valid url");
        let sender = Arc::new(FailsAfter {
            destination: destination.clone(),
            successes: 10,
            sent: AtomicUsize::new(0),
        });
        let protocol = PerEnvelopeProtocol::new(sender, Duration::from_secs(1));
        let outcomes = Outcomes::default();

        protocol.send_batch(&outcomes, batch(&destination, 3)).await;

        assert_eq!(*outcomes.0.lock(), vec!["successful"]);
    }
}
