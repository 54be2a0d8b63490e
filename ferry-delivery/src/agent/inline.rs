use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ferry_common::Envelope;
use tracing::warn;
use url::Url;

use super::{AgentContext, AgentCore, EndpointMode, SendingAgent};
use crate::{DeliveryError, SendError, watcher::Resumable};

/// Sends in the caller's flow and hands transport errors straight back
///
/// No queue and no retries. While latched every send fails with
/// [`DeliveryError::Latched`] without touching the transport.
#[derive(Debug)]
pub struct InlineSendingAgent {
    inner: Arc<InlineInner>,
}

#[derive(Debug)]
struct InlineInner {
    core: AgentCore,
    timeout: std::time::Duration,
    me: Weak<Self>,
}

impl InlineSendingAgent {
    pub fn new(context: AgentContext) -> Self {
        let timeout = context.settings.send_timeout();
        let core = AgentCore::new(context.sender, &context.settings, context.token);
        Self {
            inner: Arc::new_cyclic(|me| InlineInner {
                core,
                timeout,
                me: me.clone(),
            }),
        }
    }
}

impl InlineInner {
    async fn send(&self, mut envelope: Envelope) -> Result<(), DeliveryError> {
        if self.core.is_latched() {
            return Err(DeliveryError::Latched(self.core.destination.clone()));
        }

        envelope.ensure_data()?;

        let result = match tokio::time::timeout(self.timeout, self.core.sender.send(&envelope)).await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                self.core.record_success();
                Ok(())
            }
            Err(err) => {
                warn!(
                    destination = %self.core.destination,
                    envelope = %envelope.id,
                    %err,
                    "Inline send failed"
                );
                let target: Weak<dyn Resumable> = self.me.clone();
                self.core.record_failure(target);
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl Resumable for InlineInner {
    async fn resume(&self) {
        self.core.resume();
    }
}

#[async_trait]
impl SendingAgent for InlineSendingAgent {
    fn destination(&self) -> &Url {
        &self.inner.core.destination
    }

    fn mode(&self) -> EndpointMode {
        EndpointMode::Inline
    }

    fn is_latched(&self) -> bool {
        self.inner.core.is_latched()
    }

    fn queued_count(&self) -> usize {
        0
    }

    fn supports_native_scheduled_send(&self) -> bool {
        self.inner.core.sender.supports_native_scheduled_send()
    }

    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.inner.send(envelope).await
    }

    async fn store_and_forward(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.inner.send(envelope).await
    }

    async fn drain(&self) {
        self.inner.core.shutdown();
    }
}

impl Drop for InlineSendingAgent {
    fn drop(&mut self) {
        self.inner.core.shutdown();
    }
}
