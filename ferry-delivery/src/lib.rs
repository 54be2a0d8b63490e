//! Sending agents and durable receiving for the ferry delivery core
//!
//! This crate provides:
//! - The transport contracts ([`Sender`], [`SenderProtocol`], [`SenderCallback`])
//! - A staged batching pipeline per destination
//! - Inline, buffered and durable [`SendingAgent`]s with circuit breaking
//! - The [`SendingAgents`] registry that builds agents on demand
//! - The [`DurableReceiver`] with retry and dead-lettering

pub mod agent;
mod batch;
pub mod circuit_breaker;
mod config;
mod error;
pub mod pipeline;
pub mod policy;
mod receiver;
mod registry;
mod sender;
pub mod watcher;

pub use agent::{
    AgentContext, BufferedSendingAgent, DurableSendingAgent, EndpointMode, InlineSendingAgent,
    SCHEDULED_SEND_ADDRESS, SendingAgent, scheduled_send_address,
};
pub use batch::OutgoingMessageBatch;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::{AgentSettings, DeliveryConfig, EndpointConfig};
pub use error::{DeliveryError, HandlerError, SendError};
pub use policy::RetryPolicy;
pub use receiver::{DurableReceiver, MessageHandler, ReceiveOutcome};
pub use registry::SendingAgents;
pub use sender::{PerEnvelopeProtocol, Sender, SenderCallback, SenderFactory, SenderProtocol};
pub use watcher::{CircuitWatcher, Resumable};
