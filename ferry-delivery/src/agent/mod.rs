//! Sending agents: one per destination.
//!
//! | mode | on failure | survives a crash |
//! |---|---|---|
//! | [`EndpointMode::Inline`] | error returned to the caller | no |
//! | [`EndpointMode::Buffered`] | kept in a capped ring buffer and replayed | no |
//! | [`EndpointMode::Durable`] | kept in the outbox and re-sent | yes |
//!
//! Every agent shares the same escalation: consecutive failures latch its
//! [`CircuitBreaker`], and a [`CircuitWatcher`] pings the destination until
//! the agent can resume.

mod buffer;
mod buffered;
mod durable;
mod inline;

use std::{
    fmt::Debug,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use ferry_common::{Envelope, EnvelopeStatus, OwnerId};
use ferry_store::MessageStore;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub use buffer::RetryBuffer;
pub use buffered::BufferedSendingAgent;
pub use durable::DurableSendingAgent;
pub use inline::InlineSendingAgent;

use crate::{
    AgentSettings, CircuitBreaker, DeliveryError, PerEnvelopeProtocol, Sender, SenderProtocol,
    watcher::{CircuitWatcher, Resumable},
};

/// Inbox address that holds envelopes waiting for a scheduled send
///
/// Used when the destination's transport cannot schedule natively. Recovery
/// claims these once they are due and routes them to their destination.
pub const SCHEDULED_SEND_ADDRESS: &str = "local://scheduled-send";

/// Delivery guarantee of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum EndpointMode {
    /// Send in the caller's flow, no retries
    Inline,
    /// Batched in memory, failures replayed from a ring buffer
    #[default]
    Buffered,
    /// Batched through the persistent outbox
    Durable,
}

#[async_trait]
pub trait SendingAgent: Send + Sync + Debug {
    fn destination(&self) -> &Url;

    fn mode(&self) -> EndpointMode;

    fn is_latched(&self) -> bool;

    /// Envelopes accepted but not yet reported by the sender
    fn queued_count(&self) -> usize;

    fn supports_native_scheduled_send(&self) -> bool;

    /// Hand an envelope to the agent without persisting it first
    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<(), DeliveryError>;

    /// Persist the envelope if this agent is durable, then enqueue it
    async fn store_and_forward(&self, envelope: Envelope) -> Result<(), DeliveryError>;

    /// Stop accepting envelopes and finish what is queued
    async fn drain(&self);
}

/// Everything an agent is built from
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub sender: Arc<dyn Sender>,
    pub protocol: Arc<dyn SenderProtocol>,
    pub store: Arc<dyn MessageStore>,
    /// Owner stamped on outbox rows written by durable agents
    pub owner: OwnerId,
    pub settings: AgentSettings,
    pub token: CancellationToken,
}

impl AgentContext {
    pub fn new(
        sender: Arc<dyn Sender>,
        store: Arc<dyn MessageStore>,
        settings: AgentSettings,
    ) -> Self {
        let protocol = Arc::new(PerEnvelopeProtocol::new(
            sender.clone(),
            settings.send_timeout(),
        ));
        Self {
            sender,
            protocol,
            store,
            owner: OwnerId::ANY,
            settings,
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: Arc<dyn SenderProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = owner;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Build the agent for `mode`
    pub fn build(self, mode: EndpointMode) -> Arc<dyn SendingAgent> {
        match mode {
            EndpointMode::Inline => Arc::new(InlineSendingAgent::new(self)),
            EndpointMode::Buffered => Arc::new(BufferedSendingAgent::new(self)),
            EndpointMode::Durable => Arc::new(DurableSendingAgent::new(self)),
        }
    }
}

/// Circuit state and watcher bookkeeping shared by every agent mode
#[derive(Debug)]
struct AgentCore {
    destination: Url,
    sender: Arc<dyn Sender>,
    breaker: Arc<CircuitBreaker>,
    token: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AgentCore {
    fn new(sender: Arc<dyn Sender>, settings: &AgentSettings, token: CancellationToken) -> Self {
        let destination = sender.destination().clone();
        Self {
            breaker: Arc::new(CircuitBreaker::new(
                destination.clone(),
                settings.circuit.clone(),
            )),
            destination,
            sender,
            token,
            watcher: Mutex::new(None),
        }
    }

    fn is_latched(&self) -> bool {
        self.breaker.is_latched()
    }

    /// Count a failure, starting the watcher if this one latched the agent
    fn record_failure(&self, target: Weak<dyn Resumable>) {
        if !self.breaker.record_failure() {
            return;
        }

        let handle = CircuitWatcher::spawn(
            self.sender.clone(),
            self.breaker.config().ping_interval(),
            self.token.child_token(),
            target,
        );
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn record_success(&self) -> bool {
        self.breaker.record_success()
    }

    /// Unlatch after a successful ping
    fn resume(&self) {
        self.breaker.resume();
        debug!(destination = %self.destination, "Sending agent resumed");
    }

    fn shutdown(&self) {
        self.token.cancel();
    }
}

/// Park an envelope in the inbox until its scheduled time
///
/// Returns `false` when the envelope can go out now.
async fn schedule_for_later(
    store: &dyn MessageStore,
    sender: &dyn Sender,
    envelope: &Envelope,
) -> Result<bool, DeliveryError> {
    if sender.supports_native_scheduled_send() || !envelope.is_scheduled_for_later(Utc::now()) {
        return Ok(false);
    }

    let mut job = envelope.clone();
    job.ensure_data()?;
    job.status = EnvelopeStatus::Scheduled;
    job.owner_id = OwnerId::ANY;
    job.received_at = Some(scheduled_send_address()?);

    store.schedule_job(&job).await?;
    debug!(
        envelope = %envelope.id,
        destination = %sender.destination(),
        scheduled_time = ?envelope.scheduled_time,
        "Envelope held in the inbox until its scheduled send time"
    );
    Ok(true)
}

/// Address of the scheduled-send inbox
///
/// # Errors
///
/// Only fails if [`SCHEDULED_SEND_ADDRESS`] is not a valid URL.
pub fn scheduled_send_address() -> Result<Url, url::ParseError> {
    Url::parse(SCHEDULED_SEND_ADDRESS)
}
