//! Dead letters: envelopes that failed permanently, kept with their failure.

use std::{error::Error, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Envelope, EnvelopeId, IdentityKey, MessageIdentity, SerializationError};

/// Description of why an envelope was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub exception_type: String,
    pub message: String,
}

impl FailureInfo {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    /// Capture an error's type name and display text
    pub fn from_error<E: Error>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub id: EnvelopeId,
    pub execution_time: Option<DateTime<Utc>>,
    /// The full envelope as written by [`Envelope::to_bytes`]
    pub body: Arc<[u8]>,
    pub message_type: Option<String>,
    pub received_at: Option<Url>,
    pub destination: Option<Url>,
    pub source: Option<String>,
    pub exception_type: String,
    pub exception_message: String,
    pub sent_at: DateTime<Utc>,
    /// Marked for replay back into the inbox
    pub replayable: bool,
}

impl DeadLetterEnvelope {
    /// Capture a failed envelope together with the failure that killed it
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub fn capture(envelope: &Envelope, failure: &FailureInfo) -> Result<Self, SerializationError> {
        Ok(Self {
            id: envelope.id,
            execution_time: envelope.scheduled_time,
            body: Arc::from(envelope.to_bytes()?),
            message_type: envelope.message_type.clone(),
            received_at: envelope.received_at.clone(),
            destination: envelope.destination.clone(),
            source: envelope.source.clone(),
            exception_type: failure.exception_type.clone(),
            exception_message: failure.message.clone(),
            sent_at: envelope.sent_at,
            replayable: false,
        })
    }

    /// Key of the captured envelope, matching [`Envelope::identity`]
    #[must_use]
    pub fn identity(&self, mode: MessageIdentity) -> IdentityKey {
        IdentityKey {
            id: self.id,
            destination: match mode {
                MessageIdentity::IdOnly => None,
                MessageIdentity::IdAndDestination => self
                    .received_at
                    .as_ref()
                    .or(self.destination.as_ref())
                    .map(ToString::to_string),
            },
        }
    }

    /// Decode the captured envelope
    ///
    /// # Errors
    ///
    /// Returns an error if the stored body is not a valid envelope.
    pub fn envelope(&self) -> Result<Envelope, SerializationError> {
        Envelope::from_bytes(&self.body)
    }
}
