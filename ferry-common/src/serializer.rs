use std::{fmt, marker::PhantomData};

use serde::Serialize;

use crate::{Envelope, SerializationError};

/// Writes the in-memory message of an envelope to bytes
pub trait Serializer: fmt::Debug + Send + Sync {
    /// MIME type stamped on envelopes this serializer writes
    fn content_type(&self) -> &str;

    /// Serialize `envelope.message`
    ///
    /// # Errors
    ///
    /// Returns an error when the envelope has no message or the message cannot
    /// be encoded.
    fn write(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializationError>;
}

/// Bincode serializer for a single concrete message type
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub const CONTENT_TYPE: &'static str = "application/x-bincode";

    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BincodeSerializer")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Serializer for BincodeSerializer<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn write(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializationError> {
        let message = envelope
            .message
            .as_ref()
            .ok_or(SerializationError::MissingMessage(envelope.id))?;

        let value = message.downcast_ref::<T>().ok_or(
            SerializationError::UnexpectedMessageType {
                id: envelope.id,
                expected: std::any::type_name::<T>(),
            },
        )?;

        Ok(bincode::serde::encode_to_vec(
            value,
            bincode::config::standard(),
        )?)
    }
}
