//! In-process transport for `local://` queues.
//!
//! Sending to `local://orders` hands the envelope to the durable receiver
//! listening at that address on this node. The receiver persists it before
//! handling, so a send only succeeds once the envelope is in the inbox.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ferry_common::{Envelope, EnvelopeStatus, incoming};
use ferry_delivery::{
    DeliveryError, DurableReceiver, HandlerError, MessageHandler, SendError, Sender, SenderFactory,
};
use tracing::info;
use url::Url;

pub const SCHEME: &str = "local";

/// Receivers for the local queues of this node, keyed by address
#[derive(Debug, Default)]
pub struct LocalTransport {
    receivers: DashMap<Url, Arc<DurableReceiver>>,
}

impl LocalTransport {
    pub fn listen(&self, receiver: Arc<DurableReceiver>) {
        self.receivers.insert(receiver.address().clone(), receiver);
    }

    #[must_use]
    pub fn receiver(&self, address: &Url) -> Option<Arc<DurableReceiver>> {
        self.receivers.get(address).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn addresses(&self) -> Vec<Url> {
        let mut addresses: Vec<Url> = self.receivers.iter().map(|e| e.key().clone()).collect();
        addresses.sort();
        addresses
    }
}

/// Builds [`LocalSender`]s sharing one [`LocalTransport`]
#[derive(Debug, Clone)]
pub struct LocalFactory {
    transport: Arc<LocalTransport>,
}

impl LocalFactory {
    #[must_use]
    pub const fn new(transport: Arc<LocalTransport>) -> Self {
        Self { transport }
    }
}

impl SenderFactory for LocalFactory {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn create(&self, destination: &Url) -> Result<Arc<dyn Sender>, DeliveryError> {
        Ok(Arc::new(LocalSender {
            destination: destination.clone(),
            transport: self.transport.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct LocalSender {
    destination: Url,
    transport: Arc<LocalTransport>,
}

#[async_trait]
impl Sender for LocalSender {
    fn destination(&self) -> &Url {
        &self.destination
    }

    async fn ping(&self) -> Result<bool, SendError> {
        Ok(self.transport.receiver(&self.destination).is_some())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let receiver = self
            .transport
            .receiver(&self.destination)
            .ok_or_else(|| SendError::QueueDoesNotExist(self.destination.clone()))?;

        let mut incoming = envelope.clone();
        incoming.status = EnvelopeStatus::Incoming;
        incoming.attempts = 0;
        incoming.scheduled_time = None;

        receiver
            .receive(incoming)
            .await
            .map(|outcome| incoming!("{} -> {}: {outcome:?}", envelope.id, self.destination))
            .map_err(|err| SendError::Transient(err.to_string()))
    }
}

/// Handler for local queues with no application handler: logs and acknowledges
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        info!(
            envelope = %envelope.id,
            message_type = envelope.message_type.as_deref().unwrap_or("<none>"),
            bytes = envelope.data.as_ref().map_or(0, |data| data.len()),
            "Envelope received"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ferry_delivery::{ReceiveOutcome, RetryPolicy};
    use ferry_store::{MemoryMessageStore, MessageStore};

    use super::*;

    fn queue(name: &str) -> Url {
        Url::parse(&format!("local://{name}")).expect("valid url")
    }

    #[tokio::test]
    async fn test_send_lands_in_the_receivers_inbox() {
        let store = Arc::new(MemoryMessageStore::new());
        let transport = Arc::new(LocalTransport::default());
        transport.listen(Arc::new(DurableReceiver::new(
            queue("orders"),
            store.clone(),
            Arc::new(LoggingHandler),
            RetryPolicy::default(),
        )));

        let sender = LocalFactory::new(transport.clone())
            .create(&queue("orders"))
            .expect("created");
        assert!(sender.ping().await.expect("pinged"));

        let envelope = Envelope::outgoing(queue("orders"))
            .with_id(7u128)
            .with_data("PlaceOrder", b"{}".as_slice());
        sender.send(&envelope).await.expect("sent");

        let counts = store.fetch_counts().await.expect("counts");
        assert_eq!(counts.handled, 1);

        // The same envelope again is a duplicate, not a second delivery
        let receiver = transport.receiver(&queue("orders")).expect("listening");
        let mut again = envelope.clone();
        again.status = EnvelopeStatus::Incoming;
        assert_eq!(
            receiver.receive(again).await.expect("received"),
            ReceiveOutcome::Duplicate
        );
        assert_eq!(store.fetch_counts().await.expect("counts").handled, 1);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_reported() {
        let transport = Arc::new(LocalTransport::default());
        let sender = LocalFactory::new(transport)
            .create(&queue("missing"))
            .expect("created");

        assert!(!sender.ping().await.expect("pinged"));
        let err = sender
            .send(&Envelope::outgoing(queue("missing")))
            .await
            .expect_err("no receiver");
        assert!(matches!(err, SendError::QueueDoesNotExist(_)));
    }
}
