//! Durable receiving: incoming envelopes are stored before they are handled.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_common::{Envelope, FailureInfo, OwnerId, incoming};
use ferry_store::MessageStore;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{DeliveryError, HandlerError, RetryPolicy};

/// Application code that consumes an incoming envelope
#[async_trait]
pub trait MessageHandler: Send + Sync + Debug {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// What happened to an envelope after [`DurableReceiver::receive`] or
/// [`DurableReceiver::process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Handled,
    /// Already in the inbox, nothing was done
    Duplicate,
    /// The handler failed and the envelope runs again at the given time
    Rescheduled(DateTime<Utc>),
    /// The handler failed too many times
    DeadLettered,
    /// Past its deliver-by time, removed without handling
    Expired,
}

/// Stores, handles and retries the envelopes arriving at one address
#[derive(Debug)]
pub struct DurableReceiver {
    address: Url,
    store: Arc<dyn MessageStore>,
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
    owner: OwnerId,
}

impl DurableReceiver {
    pub fn new(
        address: Url,
        store: Arc<dyn MessageStore>,
        handler: Arc<dyn MessageHandler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            address,
            store,
            handler,
            retry,
            owner: OwnerId::ANY,
        }
    }

    #[must_use]
    pub const fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = owner;
        self
    }

    #[must_use]
    pub const fn address(&self) -> &Url {
        &self.address
    }

    /// Accept an envelope from a transport
    ///
    /// The envelope is persisted first. An envelope already in the inbox is
    /// reported as [`ReceiveOutcome::Duplicate`] and not handled again.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. The transport should redeliver.
    pub async fn receive(&self, mut envelope: Envelope) -> Result<ReceiveOutcome, DeliveryError> {
        envelope.received_at = Some(self.address.clone());
        envelope.owner_id = self.owner;

        if self.store.store_incoming(&envelope).await?.is_duplicate() {
            debug!(envelope = %envelope.id, address = %self.address, "Duplicate envelope ignored");
            return Ok(ReceiveOutcome::Duplicate);
        }

        self.process(envelope).await
    }

    /// Handle an envelope that is already in the inbox
    ///
    /// Used for fresh envelopes and for ones claimed by recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while recording the outcome.
    pub async fn process(&self, mut envelope: Envelope) -> Result<ReceiveOutcome, DeliveryError> {
        let now = Utc::now();
        if envelope.is_expired(now) {
            info!(envelope = %envelope.id, address = %self.address, "Discarding expired envelope");
            self.store.delete_incoming(std::slice::from_ref(&envelope)).await?;
            return Ok(ReceiveOutcome::Expired);
        }

        incoming!("Handling {} at {}", envelope.id, self.address);

        let failure = match self.handler.handle(&envelope).await {
            Ok(()) => {
                self.store.mark_incoming_as_handled(&envelope).await?;
                return Ok(ReceiveOutcome::Handled);
            }
            Err(failure) => failure,
        };

        envelope.attempts += 1;
        self.store.increment_incoming_attempts(&envelope).await?;

        if !self.retry.should_retry(envelope.attempts) {
            error!(
                envelope = %envelope.id,
                address = %self.address,
                attempts = envelope.attempts,
                %failure,
                "Handler kept failing, moving envelope to dead letters"
            );
            self.store
                .move_to_dead_letter(&envelope, &FailureInfo::from(&failure))
                .await?;
            return Ok(ReceiveOutcome::DeadLettered);
        }

        let next = self.retry.next_retry_at(envelope.attempts, now);
        warn!(
            envelope = %envelope.id,
            address = %self.address,
            attempts = envelope.attempts,
            remaining = self.retry.remaining_attempts(envelope.attempts),
            %failure,
            retry_at = %next,
            "Handler failed, rescheduling"
        );

        envelope.scheduled_time = Some(next);
        self.store.schedule_execution(&envelope).await?;
        Ok(ReceiveOutcome::Rescheduled(next))
    }
}
