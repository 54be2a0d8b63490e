use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use ferry_common::{Envelope, SerializationError};
use ferry_store::MessageStore;
use tracing::{debug, error, warn};
use url::Url;

use super::{AgentContext, AgentCore, EndpointMode, RetryBuffer, SendingAgent, schedule_for_later};
use crate::{
    DeliveryError, OutgoingMessageBatch, SendError, SenderCallback,
    pipeline::{Pipeline, PipelineInput},
    watcher::Resumable,
};

/// Batches envelopes in memory and replays failures from a ring buffer
///
/// Nothing is persisted, so whatever is queued or buffered is lost if the
/// process dies.
#[derive(Debug)]
pub struct BufferedSendingAgent {
    inner: Arc<BufferedInner>,
    pipeline: Pipeline,
}

#[derive(Debug)]
struct BufferedInner {
    core: AgentCore,
    input: Arc<PipelineInput>,
    buffer: RetryBuffer,
    store: Arc<dyn MessageStore>,
    me: Weak<Self>,
}

impl BufferedSendingAgent {
    pub fn new(context: AgentContext) -> Self {
        let core = AgentCore::new(context.sender, &context.settings, context.token);
        let pending = Pipeline::prepare(core.destination.clone());
        let buffer = RetryBuffer::new(
            core.destination.clone(),
            context.settings.retry_buffer_capacity,
        );
        let input = pending.input().clone();

        let inner = Arc::new_cyclic(|me| BufferedInner {
            core,
            input,
            buffer,
            store: context.store,
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

    /// Envelopes held for replay
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.inner.buffer.len()
    }
}

impl BufferedInner {
    fn replay(&self) {
        let envelopes = self.buffer.take();
        if envelopes.is_empty() {
            return;
        }

        debug!(
            destination = %self.core.destination,
            count = envelopes.len(),
            "Replaying buffered envelopes"
        );
        for envelope in envelopes {
            if let Err(err) = self.input.post(envelope) {
                warn!(destination = %self.core.destination, %err, "Unable to replay buffered envelope");
            }
        }
    }

    fn failed(&self, batch: OutgoingMessageBatch) {
        self.buffer.extend(batch.envelopes);
        let target: Weak<dyn Resumable> = self.me.clone();
        self.core.record_failure(target);
    }
}

#[async_trait]
impl SenderCallback for BufferedInner {
    async fn mark_successful(&self, _batch: OutgoingMessageBatch) {
        self.core.record_success();
        self.replay();
    }

    async fn mark_processing_failure(&self, batch: OutgoingMessageBatch, error: SendError) {
        warn!(destination = %batch.destination, %error, size = batch.len(), "Batch failed");
        self.failed(batch);
    }

    async fn mark_timed_out(&self, batch: OutgoingMessageBatch) {
        self.failed(batch);
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
            "Dropping envelopes that cannot be serialized"
        );
    }

    async fn mark_queue_does_not_exist(&self, batch: OutgoingMessageBatch) {
        self.failed(batch);
    }

    async fn mark_sender_is_latched(&self, batch: OutgoingMessageBatch) {
        self.buffer.extend(batch.envelopes);
    }
}

#[async_trait]
impl Resumable for BufferedInner {
    async fn resume(&self) {
        self.core.resume();
        self.replay();
    }
}

#[async_trait]
impl SendingAgent for BufferedSendingAgent {
    fn destination(&self) -> &Url {
        &self.inner.core.destination
    }

    fn mode(&self) -> EndpointMode {
        EndpointMode::Buffered
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

    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<(), DeliveryError> {
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

        self.inner.input.post(envelope)
    }

    async fn store_and_forward(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.enqueue_outgoing(envelope).await
    }

    async fn drain(&self) {
        self.pipeline.drain().await;
        self.inner.core.shutdown();
    }
}

impl Drop for BufferedSendingAgent {
    fn drop(&mut self) {
        self.inner.input.close();
        self.inner.core.shutdown();
    }
}
