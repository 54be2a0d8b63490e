use std::sync::Arc;

use dashmap::DashMap;
use ferry_common::{Envelope, OwnerId};
use ferry_store::MessageStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::{AgentContext, DeliveryConfig, DeliveryError, SenderFactory, SendingAgent};

/// Agents are kept per destination and tenant
type AgentKey = (Url, Option<String>);

/// Every sending agent of this node, built on first use
///
/// Agents are created from the [`SenderFactory`] registered for the
/// destination's URI scheme, in the [`crate::EndpointMode`] configured for
/// that destination.
#[derive(Debug)]
pub struct SendingAgents {
    store: Arc<dyn MessageStore>,
    owner: OwnerId,
    config: DeliveryConfig,
    factories: DashMap<String, Arc<dyn SenderFactory>>,
    agents: DashMap<AgentKey, Arc<dyn SendingAgent>>,
    token: CancellationToken,
}

impl SendingAgents {
    pub fn new(
        store: Arc<dyn MessageStore>,
        owner: OwnerId,
        config: DeliveryConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            owner,
            config,
            factories: DashMap::new(),
            agents: DashMap::new(),
            token,
        }
    }

    /// Register the factory for one URI scheme, replacing any earlier one
    pub fn register(&self, factory: Arc<dyn SenderFactory>) {
        let scheme = factory.scheme().to_ascii_lowercase();
        debug!(%scheme, "Sender factory registered");
        self.factories.insert(scheme, factory);
    }

    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// The agent for `destination` and `tenant`, building it if needed
    ///
    /// # Errors
    ///
    /// Fails when no factory handles the destination's scheme, or the factory
    /// cannot build a sender for it.
    pub fn agent_for(
        &self,
        destination: &Url,
        tenant: Option<&str>,
    ) -> Result<Arc<dyn SendingAgent>, DeliveryError> {
        let key = (destination.clone(), tenant.map(ToString::to_string));
        if let Some(agent) = self.agents.get(&key) {
            return Ok(agent.clone());
        }

        let factory = self
            .factories
            .get(destination.scheme())
            .map(|factory| factory.clone())
            .ok_or_else(|| DeliveryError::UnknownScheme(destination.scheme().to_string()))?;

        let mode = self.config.mode_for(destination);
        let sender = factory.create(destination)?;
        let agent = AgentContext::new(sender, self.store.clone(), self.config.agent.clone())
            .with_owner(self.owner)
            .with_token(self.token.child_token())
            .build(mode);

        // A concurrent caller may have won; its agent is kept and ours dropped
        let agent = self.agents.entry(key).or_insert(agent).clone();
        info!(%destination, ?tenant, mode = ?agent.mode(), "Sending agent started");
        Ok(agent)
    }

    /// Send an envelope through the agent of its destination
    ///
    /// # Errors
    ///
    /// Fails when the envelope has no destination, no agent can be built for
    /// it, or the agent refuses it.
    pub async fn route(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        let destination = envelope
            .destination
            .clone()
            .ok_or(DeliveryError::NoDestination(envelope.id))?;
        let agent = self.agent_for(&destination, envelope.tenant_id.as_deref())?;
        agent.store_and_forward(envelope).await
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Destinations with a running agent
    #[must_use]
    pub fn destinations(&self) -> Vec<Url> {
        let mut destinations: Vec<_> = self.agents.iter().map(|entry| entry.key().0.clone()).collect();
        destinations.sort();
        destinations.dedup();
        destinations
    }

    #[must_use]
    pub fn latched_count(&self) -> usize {
        self.agents.iter().filter(|entry| entry.is_latched()).count()
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.agents.iter().map(|entry| entry.queued_count()).sum()
    }

    /// Drain every agent and forget them
    pub async fn drain_all(&self) {
        let agents: Vec<_> = self.agents.iter().map(|entry| entry.value().clone()).collect();
        self.agents.clear();

        for agent in agents {
            agent.drain().await;
        }
        self.token.cancel();
    }
}
