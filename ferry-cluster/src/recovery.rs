//! Claiming envelopes nobody owns.
//!
//! Envelopes become globally owned when their node is ejected or shuts down,
//! and when the leader promotes a scheduled envelope. Every node claims them
//! in pages:
//!
//! - incoming envelopes at one of its listener addresses go to that
//!   address's [`DurableReceiver`]
//! - envelopes parked for a scheduled send are routed to their destination
//! - outgoing envelopes go to the sending agent of their destination

use std::sync::Arc;

use ferry_common::{Envelope, EnvelopeStatus, OwnerId};
use ferry_delivery::{
    DeliveryError, DurableReceiver, EndpointMode, SendingAgents, scheduled_send_address,
};
use ferry_store::MessageStore;
use tracing::{debug, error, info};

use crate::Result;

/// What one recovery pass claimed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub incoming: usize,
    pub scheduled_sends: usize,
    pub outgoing: usize,
}

impl RecoveryReport {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.incoming + self.scheduled_sends + self.outgoing
    }
}

#[derive(Debug)]
pub struct Recovery {
    store: Arc<dyn MessageStore>,
    agents: Arc<SendingAgents>,
    receivers: Vec<Arc<DurableReceiver>>,
    page_size: usize,
}

impl Recovery {
    pub fn new(
        store: Arc<dyn MessageStore>,
        agents: Arc<SendingAgents>,
        receivers: Vec<Arc<DurableReceiver>>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            agents,
            receivers,
            page_size,
        }
    }

    fn owner(&self) -> OwnerId {
        self.agents.owner()
    }

    /// Claim one page per source
    pub async fn recover_once(&self) -> Result<RecoveryReport> {
        let report = RecoveryReport {
            incoming: self.recover_incoming().await?,
            scheduled_sends: self.recover_scheduled_sends().await?,
            outgoing: self.recover_outgoing().await?,
        };

        if report.total() > 0 {
            info!(?report, owner = %self.owner(), "Recovered globally owned envelopes");
        }
        Ok(report)
    }

    async fn recover_incoming(&self) -> Result<usize> {
        let mut claimed = 0;

        for receiver in &self.receivers {
            let page = self
                .store
                .load_page_of_globally_owned_incoming(receiver.address(), self.page_size)
                .await?;
            if page.is_empty() {
                continue;
            }

            self.store.reassign_incoming(self.owner(), &page).await?;
            claimed += page.len();

            for mut envelope in page {
                envelope.owner_id = self.owner();
                let id = envelope.id;
                if let Err(err) = receiver.process(envelope).await {
                    error!(envelope = %id, address = %receiver.address(), %err, "Recovered envelope could not be processed");
                }
            }
        }

        Ok(claimed)
    }

    async fn recover_scheduled_sends(&self) -> Result<usize> {
        let address = scheduled_send_address()?;
        let page = self
            .store
            .load_page_of_globally_owned_incoming(&address, self.page_size)
            .await?;
        if page.is_empty() {
            return Ok(0);
        }

        self.store.reassign_incoming(self.owner(), &page).await?;

        let mut sent = 0;
        for job in page {
            let mut envelope = job.clone();
            envelope.status = EnvelopeStatus::Outgoing;
            envelope.received_at = None;
            envelope.scheduled_time = None;
            envelope.owner_id = OwnerId::ANY;

            match self.agents.route(envelope).await {
                Ok(()) => {
                    self.store.delete_incoming(std::slice::from_ref(&job)).await?;
                    sent += 1;
                }
                Err(err) => {
                    error!(envelope = %job.id, %err, "Scheduled send could not be routed, releasing it");
                    self.store
                        .reassign_incoming(OwnerId::ANY, std::slice::from_ref(&job))
                        .await?;
                }
            }
        }

        Ok(sent)
    }

    async fn recover_outgoing(&self) -> Result<usize> {
        let page = self
            .store
            .load_globally_owned_outgoing(self.page_size)
            .await?;

        let mut claimed = 0;
        for envelope in page {
            match self.resend(envelope).await {
                Ok(()) => claimed += 1,
                Err(err) => error!(%err, "Unable to resend recovered envelope"),
            }
        }
        Ok(claimed)
    }

    async fn resend(&self, mut envelope: Envelope) -> Result<()> {
        let destination = envelope
            .destination
            .clone()
            .ok_or(DeliveryError::NoDestination(envelope.id))?;
        let agent = self
            .agents
            .agent_for(&destination, envelope.tenant_id.as_deref())?;

        if agent.mode() == EndpointMode::Durable {
            self.store
                .reassign_outgoing(self.owner(), std::slice::from_ref(&envelope))
                .await?;
            envelope.owner_id = self.owner();
            debug!(envelope = %envelope.id, %destination, "Claimed outbox envelope");
            agent.enqueue_outgoing(envelope).await?;
        } else {
            // Non-durable agents keep nothing in the outbox
            self.store
                .delete_outgoing(std::slice::from_ref(&envelope))
                .await?;
            agent.store_and_forward(envelope).await?;
        }

        Ok(())
    }
}
