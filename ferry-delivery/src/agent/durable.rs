use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use ferry_common::{Envelope, OwnerId, SerializationError};
use ferry_store::MessageStore;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{AgentContext, AgentCore, EndpointMode, SendingAgent, schedule_for_later};
use crate::{
    DeliveryError, OutgoingMessageBatch, SendError, SenderCallback,
    pipeline::{Pipeline, PipelineInput},
    watcher::Resumable,
};

/// Sends through the persistent outbox
///
/// An envelope is written to the outbox, owned by this node, before it is
/// queued, and only leaves the outbox once the transport accepted it, it
/// expired, or it ran out of attempts. Rows left behind by a crashed node are
/// released to the cluster and picked up by recovery.
#[derive(Debug)]
pub struct DurableSendingAgent {
    inner: Arc<DurableInner>,
    pipeline: Pipeline,
}

#[derive(Debug)]
struct DurableInner {
    core: AgentCore,
    input: Arc<PipelineInput>,
    store: Arc<dyn MessageStore>,
    owner: OwnerId,
    maximum_delivery_attempts: u32,
    me: Weak<Self>,
}

impl DurableSendingAgent {
    pub fn new(context: AgentContext) -> Self {
        let core = AgentCore::new(context.sender, &context.settings, context.token);
        let pending = Pipeline::prepare(core.destination.clone());
        let input = pending.input().clone();

        let inner = Arc::new_cyclic(|me| DurableInner {
            core,
            input,
            store: context.store,
            owner: context.owner,
            maximum_delivery_attempts: context.settings.maximum_delivery_attempts,
            me: me.clone(),
        });

        let pipeline = pending.start(
            context.settings.batching(),
            context.protocol,
            inner.clone(),
            inner.core.breaker.clone(),
        );

        Self { inner, pipeline }
    }
}

impl DurableInner {
    fn post(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        if self.core.is_latched() {
            // Stays in the outbox until the agent resumes
            return Ok(());
        }
        self.input.post(envelope)
    }

    async fn failed(&self, batch: OutgoingMessageBatch) {
        let target: Weak<dyn Resumable> = self.me.clone();
        self.core.record_failure(target);

        let now = Utc::now();
        let (discards, reassigns): (Vec<_>, Vec<_>) = batch
            .envelopes
            .into_iter()
            .map(|mut envelope| {
                envelope.attempts += 1;
                envelope
            })
            .partition(|envelope| {
                envelope.is_expired(now) || envelope.attempts >= self.maximum_delivery_attempts
            });

        for envelope in &discards {
            warn!(
                destination = %self.core.destination,
                envelope = %envelope.id,
                attempts = envelope.attempts,
                "Discarding envelope that expired or ran out of delivery attempts"
            );
        }

        if let Err(err) = self
            .store
            .discard_and_reassign_outgoing(&discards, &reassigns, self.owner)
            .await
        {
            error!(destination = %self.core.destination, %err, "Unable to update outbox after failed batch");
            return;
        }

        for envelope in reassigns {
            if let Err(err) = self.post(envelope) {
                debug!(destination = %self.core.destination, %err, "Envelope left in the outbox");
            }
        }
    }
}

#[async_trait]
impl SenderCallback for DurableInner {
    async fn mark_successful(&self, batch: OutgoingMessageBatch) {
        self.core.record_success();
        if let Err(err) = self.store.delete_outgoing(&batch.envelopes).await {
            error!(destination = %batch.destination, %err, "Unable to delete sent envelopes from the outbox");
        }
    }

    async fn mark_processing_failure(&self, batch: OutgoingMessageBatch, error: SendError) {
        warn!(destination = %batch.destination, %error, size = batch.len(), "Batch failed");
        self.failed(batch).await;
    }

    async fn mark_timed_out(&self, batch: OutgoingMessageBatch) {
        self.failed(batch).await;
    }

    async fn mark_serialization_failure(
        &self,
        batch: OutgoingMessageBatch,
        error: SerializationError,
    ) {
        error!(
            destination = %batch.destination,
            %error,
            envelopes = ?batch.ids().collect::<Vec<_>>(),
            "Removing envelopes that cannot be serialized from the outbox"
        );
        if let Err(err) = self.store.delete_outgoing(&batch.envelopes).await {
            error!(destination = %batch.destination, %err, "Unable to delete envelopes from the outbox");
        }
    }

    async fn mark_queue_does_not_exist(&self, batch: OutgoingMessageBatch) {
        self.failed(batch).await;
    }

    async fn mark_sender_is_latched(&self, batch: OutgoingMessageBatch) {
        debug!(destination = %batch.destination, size = batch.len(), "Agent latched, envelopes stay in the outbox");
    }
}

#[async_trait]
impl Resumable for DurableInner {
    async fn resume(&self) {
        self.core.resume();

        let envelopes = match self.store.load_outgoing(&self.core.destination).await {
            Ok(envelopes) => envelopes,
            Err(err) => {
                error!(destination = %self.core.destination, %err, "Unable to reload the outbox");
                return;
            }
        };

        let owned: Vec<_> = envelopes
            .into_iter()
            .filter(|envelope| envelope.owner_id == self.owner)
            .collect();
        info!(
            destination = %self.core.destination,
            count = owned.len(),
            "Resending envelopes held in the outbox"
        );

        for envelope in owned {
            if let Err(err) = self.post(envelope) {
                warn!(destination = %self.core.destination, %err, "Unable to resend envelope");
            }
        }
    }
}

#[async_trait]
impl SendingAgent for DurableSendingAgent {
    fn destination(&self) -> &Url {
        &self.inner.core.destination
    }

    fn mode(&self) -> EndpointMode {
        EndpointMode::Durable
    }

    fn is_latched(&self) -> bool {
        self.inner.core.is_latched()
    }

    fn queued_count(&self) -> usize {
        self.inner.input.queued()
    }

    fn supports_native_scheduled_send(&self) -> bool {
        self.inner.core.sender.supports_native_scheduled_send()
    }

    /// Queue an envelope that is already in the outbox
    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.inner.post(envelope)
    }

    async fn store_and_forward(&self, mut envelope: Envelope) -> Result<(), DeliveryError> {
        if envelope.is_expired(Utc::now()) {
            debug!(envelope = %envelope.id, destination = %self.destination(), "Discarding expired envelope");
            return Ok(());
        }

        if schedule_for_later(
            self.inner.store.as_ref(),
            self.inner.core.sender.as_ref(),
            &envelope,
        )
        .await?
        {
            return Ok(());
        }

        envelope.ensure_data()?;
        envelope.owner_id = self.inner.owner;
        self.inner
            .store
            .store_outgoing(&envelope, self.inner.owner)
            .await?;

        self.inner.post(envelope)
    }

    async fn drain(&self) {
        self.pipeline.drain().await;
        self.inner.core.shutdown();
    }
}

impl Drop for DurableSendingAgent {
    fn drop(&mut self) {
        self.inner.input.close();
        self.inner.core.shutdown();
    }
}
