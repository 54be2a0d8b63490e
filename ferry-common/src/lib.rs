//! Shared types for the ferry durable delivery core.
//!
//! The [`Envelope`] is the unit of delivery that travels between sending
//! agents, the message store and listeners. Everything else in this crate is
//! either state the store keeps next to envelopes ([`Node`],
//! [`DeadLetterEnvelope`], [`PersistedCounts`]) or ambient plumbing shared by
//! the other crates (logging, the shutdown [`Signal`]).

pub mod counts;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod logging;
pub mod node;
pub mod serializer;

pub use counts::PersistedCounts;
pub use dead_letter::{DeadLetterEnvelope, FailureInfo};
pub use envelope::{Envelope, EnvelopeStatus, IdentityKey, MessageIdentity, MessagePayload};
pub use error::SerializationError;
pub use ids::{EnvelopeId, NodeId, OwnerId};
pub use node::{Node, NodeEventType, NodeRecord};
pub use serializer::{BincodeSerializer, Serializer};
pub use tracing;
pub use url::Url;

/// Process-wide lifecycle signal broadcast by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
