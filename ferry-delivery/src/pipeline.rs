//! Staged transmission pipeline for one destination.
//!
//! ```text
//! post ─> [serialize] ─> [batch] ─> [build] ─> [transmit] ─> SenderCallback
//! ```
//!
//! Every stage is its own task and stages are joined by unbounded channels.
//! Transmission is a single task, so batches for one destination go out one
//! at a time and in the order their envelopes were posted.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ferry_common::{Envelope, outgoing};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tracing::{error, trace};
use url::Url;

use crate::{
    CircuitBreaker, DeliveryError, OutgoingMessageBatch, SenderCallback, SenderProtocol,
};

/// Batching limits
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    /// Most envelopes per batch
    pub size: usize,
    /// Longest a partial batch waits for more envelopes
    pub window: Duration,
}

/// Entry point of a pipeline, shared by the agent and its callbacks
///
/// Closing the input lets every stage finish what is queued and exit.
#[derive(Debug)]
pub struct PipelineInput {
    destination: Url,
    sender: Mutex<Option<UnboundedSender<Envelope>>>,
    queued: AtomicUsize,
}

impl PipelineInput {
    fn new(destination: Url) -> (Arc<Self>, UnboundedReceiver<Envelope>) {
        let (sender, receiver) = unbounded_channel();
        let input = Arc::new(Self {
            destination,
            sender: Mutex::new(Some(sender)),
            queued: AtomicUsize::new(0),
        });
        (input, receiver)
    }

    /// Queue an envelope for transmission
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Closed`] once the pipeline has been drained.
    pub fn post(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| DeliveryError::Closed(self.destination.clone()))?;

        self.queued.fetch_add(1, Ordering::AcqRel);
        sender.send(envelope).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            DeliveryError::Closed(self.destination.clone())
        })
    }

    /// Envelopes posted but not yet reported through a callback
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn close(&self) {
        self.sender.lock().take();
    }

    fn settle(&self, count: usize) {
        // Saturating: never wrap below zero
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                Some(queued.saturating_sub(count))
            });
    }
}

/// The running stages of one destination's pipeline
#[derive(Debug)]
pub struct Pipeline {
    input: Arc<PipelineInput>,
    stages: Mutex<Vec<JoinHandle<()>>>,
}

/// A pipeline whose input exists but whose stages are not running yet
///
/// Lets an agent hand the input to its callback before the stages, which own
/// that callback, are spawned.
#[derive(Debug)]
pub struct PendingPipeline {
    input: Arc<PipelineInput>,
    receiver: UnboundedReceiver<Envelope>,
}

impl Pipeline {
    #[must_use]
    pub fn prepare(destination: Url) -> PendingPipeline {
        let (input, receiver) = PipelineInput::new(destination);
        PendingPipeline { input, receiver }
    }

    #[must_use]
    pub const fn input(&self) -> &Arc<PipelineInput> {
        &self.input
    }

    /// Stop accepting envelopes and wait for everything queued to be reported
    pub async fn drain(&self) {
        self.input.close();
        let stages = std::mem::take(&mut *self.stages.lock());
        for stage in stages {
            if let Err(err) = stage.await {
                error!(destination = %self.input.destination, %err, "Pipeline stage panicked");
            }
        }
    }
}

impl PendingPipeline {
    #[must_use]
    pub const fn input(&self) -> &Arc<PipelineInput> {
        &self.input
    }

    pub fn start(
        self,
        settings: BatchSettings,
        protocol: Arc<dyn SenderProtocol>,
        callback: Arc<dyn SenderCallback>,
        breaker: Arc<CircuitBreaker>,
    ) -> Pipeline {
        let Self { input, receiver } = self;
        let (serialized_tx, serialized_rx) = unbounded_channel();
        let (grouped_tx, grouped_rx) = unbounded_channel();
        let (built_tx, built_rx) = unbounded_channel();

        let stages = vec![
            tokio::spawn(serialize(
                receiver,
                serialized_tx,
                input.clone(),
                callback.clone(),
            )),
            tokio::spawn(batch(serialized_rx, grouped_tx, settings)),
            tokio::spawn(build(grouped_rx, built_tx, input.destination.clone())),
            tokio::spawn(transmit(built_rx, input.clone(), protocol, callback, breaker)),
        ];

        Pipeline {
            input,
            stages: Mutex::new(stages),
        }
    }
}

async fn serialize(
    mut receiver: UnboundedReceiver<Envelope>,
    next: UnboundedSender<Envelope>,
    input: Arc<PipelineInput>,
    callback: Arc<dyn SenderCallback>,
) {
    while let Some(mut envelope) = receiver.recv().await {
        match envelope.ensure_data() {
            Ok(()) => {
                if next.send(envelope).is_err() {
                    break;
                }
            }
            Err(err) => {
                error!(
                    destination = %input.destination,
                    envelope = %envelope.id,
                    %err,
                    "Unable to serialize envelope, dropping it from this attempt"
                );
                input.settle(1);
                callback
                    .mark_serialization_failure(
                        OutgoingMessageBatch::single(input.destination.clone(), envelope),
                        err,
                    )
                    .await;
            }
        }
    }
}

async fn batch(
    mut receiver: UnboundedReceiver<Envelope>,
    next: UnboundedSender<Vec<Envelope>>,
    settings: BatchSettings,
) {
    let size = settings.size.max(1);

    while let Some(first) = receiver.recv().await {
        let mut group = Vec::with_capacity(size);
        group.push(first);

        let window = tokio::time::sleep(settings.window);
        tokio::pin!(window);

        while group.len() < size {
            tokio::select! {
                biased;
                received = receiver.recv() => match received {
                    Some(envelope) => group.push(envelope),
                    None => break,
                },
                () = &mut window => break,
            }
        }

        trace!(size = group.len(), "Batch formed");
        if next.send(group).is_err() {
            break;
        }
    }
}

async fn build(
    mut receiver: UnboundedReceiver<Vec<Envelope>>,
    next: UnboundedSender<OutgoingMessageBatch>,
    destination: Url,
) {
    while let Some(envelopes) = receiver.recv().await {
        if next
            .send(OutgoingMessageBatch::new(destination.clone(), envelopes))
            .is_err()
        {
            break;
        }
    }
}

async fn transmit(
    mut receiver: UnboundedReceiver<OutgoingMessageBatch>,
    input: Arc<PipelineInput>,
    protocol: Arc<dyn SenderProtocol>,
    callback: Arc<dyn SenderCallback>,
    breaker: Arc<CircuitBreaker>,
) {
    while let Some(batch) = receiver.recv().await {
        let count = batch.len();

        if breaker.is_latched() {
            callback.mark_sender_is_latched(batch).await;
        } else {
            protocol.send_batch(callback.as_ref(), batch).await;
        }

        input.settle(count);
    }

    outgoing!("Pipeline for {} drained", input.destination);
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ferry_common::{EnvelopeId, SerializationError};

    use super::*;
    use crate::{CircuitBreakerConfig, SendError};

    #[derive(Debug, Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<EnvelopeId>>>,
    }

    #[async_trait]
    impl SenderProtocol for Recorder {
        async fn send_batch(&self, callback: &dyn SenderCallback, batch: OutgoingMessageBatch) {
            self.batches.lock().push(batch.ids().collect());
            callback.mark_successful(batch).await;
        }
    }

    #[derive(Default)]
    struct Outcomes {
        successful: Mutex<Vec<EnvelopeId>>,
        latched: Mutex<Vec<EnvelopeId>>,
        unserializable: Mutex<Vec<EnvelopeId>>,
    }

    #[async_trait]
    impl SenderCallback for Outcomes {
        async fn mark_successful(&self, batch: OutgoingMessageBatch) {
            self.successful.lock().extend(batch.ids());
        }
        async fn mark_processing_failure(&self, _: OutgoingMessageBatch, _: SendError) {}
        async fn mark_timed_out(&self, _: OutgoingMessageBatch) {}
        async fn mark_serialization_failure(&self, batch: OutgoingMessageBatch, _: SerializationError) {
            self.unserializable.lock().extend(batch.ids());
        }
        async fn mark_queue_does_not_exist(&self, _: OutgoingMessageBatch) {}
        async fn mark_sender_is_latched(&self, batch: OutgoingMessageBatch) {
            self.latched.lock().extend(batch.ids());
        }
    }

    fn destination() -> Url {
        Url::parse("queue://x").expect("valid url")
    }

    fn envelope(id: u128) -> Envelope {
        Envelope::outgoing(destination())
            .with_id(id)
            .with_data("Test", b"body".as_slice())
    }

    fn start(
        size: usize,
        protocol: Arc<Recorder>,
        outcomes: Arc<Outcomes>,
        breaker: Arc<CircuitBreaker>,
    ) -> Pipeline {
        Pipeline::prepare(destination()).start(
            BatchSettings {
                size,
                window: Duration::from_millis(20),
            },
            protocol,
            outcomes,
            breaker,
        )
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            destination(),
            CircuitBreakerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn batches_preserve_order() {
        let protocol = Arc::new(Recorder::default());
        let outcomes = Arc::new(Outcomes::default());
        let pipeline = start(2, protocol.clone(), outcomes.clone(), breaker());

        for id in 1..=5u128 {
            pipeline.input().post(envelope(id)).expect("posts");
        }
        pipeline.drain().await;

        let sent: Vec<EnvelopeId> = protocol.batches.lock().iter().flatten().copied().collect();
        let expected: Vec<EnvelopeId> = (1..=5u128).map(EnvelopeId::from).collect();
        assert_eq!(sent, expected);
        assert!(protocol.batches.lock().iter().all(|b| b.len() <= 2));
        assert_eq!(*outcomes.successful.lock(), expected);
        assert_eq!(pipeline.input().queued(), 0);
    }

    #[tokio::test]
    async fn latched_batches_are_not_transmitted() {
        let protocol = Arc::new(Recorder::default());
        let outcomes = Arc::new(Outcomes::default());
        let breaker = Arc::new(CircuitBreaker::new(
            destination(),
            CircuitBreakerConfig {
                failures_before_circuit_breaks: 1,
                ping_interval_ms: 10,
            },
        ));
        breaker.record_failure();

        let pipeline = start(10, protocol.clone(), outcomes.clone(), breaker);
        pipeline.input().post(envelope(1)).expect("posts");
        pipeline.drain().await;

        assert!(protocol.batches.lock().is_empty());
        assert_eq!(*outcomes.latched.lock(), vec![EnvelopeId::from(1u128)]);
    }

    #[tokio::test]
    async fn unserializable_envelopes_are_reported() {
        let protocol = Arc::new(Recorder::default());
        let outcomes = Arc::new(Outcomes::default());
        let pipeline = start(10, protocol.clone(), outcomes.clone(), breaker());

        pipeline
            .input()
            .post(Envelope::outgoing(destination()).with_id(9u128))
            .expect("posts");
        pipeline.input().post(envelope(10)).expect("posts");
        pipeline.drain().await;

        assert_eq!(*outcomes.unserializable.lock(), vec![EnvelopeId::from(9u128)]);
        assert_eq!(*outcomes.successful.lock(), vec![EnvelopeId::from(10u128)]);
    }

    #[tokio::test]
    async fn drained_pipeline_rejects_posts() {
        let pipeline = start(
            10,
            Arc::new(Recorder::default()),
            Arc::new(Outcomes::default()),
            breaker(),
        );
        pipeline.drain().await;

        assert!(pipeline.input().is_closed());
        assert!(matches!(
            pipeline.input().post(envelope(1)),
            Err(DeliveryError::Closed(_))
        ));
    }
}
