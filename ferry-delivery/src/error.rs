//! Typed error handling for delivery operations.
//!
//! [`SendError`] is what a transport reports for one send attempt and decides
//! which [`crate::SenderCallback`] outcome a batch ends in. [`DeliveryError`]
//! is what agents, the registry and the receiver return to their callers.

use std::time::Duration;

use ferry_common::{EnvelopeId, FailureInfo, SerializationError};
use ferry_store::StoreError;
use thiserror::Error;
use url::Url;

/// Failure of a single transport call.
#[derive(Debug, Error)]
pub enum SendError {
    /// The destination may accept the message later.
    #[error("Transient send failure: {0}")]
    Transient(String),

    /// The destination exists but refused the message for good.
    #[error("Permanent send failure: {0}")]
    Permanent(String),

    /// The destination queue or topic does not exist.
    #[error("Queue does not exist: {0}")]
    QueueDoesNotExist(Url),

    /// The transport did not answer in time.
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// The message body could not be produced.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The transport does not support the requested operation.
    #[error("Operation not supported by sender for {0}")]
    Unsupported(Url),
}

impl SendError {
    /// Returns `true` if the send may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Failure raised by a message handler.
#[derive(Debug, Clone, Error)]
#[error("{exception_type}: {message}")]
pub struct HandlerError {
    pub exception_type: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let failure = FailureInfo::from_error(error);
        Self::new(failure.exception_type, failure.message)
    }
}

impl From<&HandlerError> for FailureInfo {
    fn from(error: &HandlerError) -> Self {
        Self::new(error.exception_type.clone(), error.message.clone())
    }
}

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The agent's circuit is open; nothing was sent.
    #[error("Sending agent for {0} is latched")]
    Latched(Url),

    #[error("Send failure: {0}")]
    Send(#[from] SendError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// No [`crate::SenderFactory`] is registered for the URI scheme.
    #[error("No sender registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("Envelope {0} has no destination")]
    NoDestination(EnvelopeId),

    /// The agent's pipeline has been drained and accepts no more work.
    #[error("Sending agent for {0} has shut down")]
    Closed(Url),

    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] url::ParseError),
}

impl DeliveryError {
    /// Returns `true` if the caller may retry later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Latched(_) => true,
            Self::Send(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_latched(&self) -> bool {
        matches!(self, Self::Latched(_))
    }
}
