//! Error types shared by every ferry crate.

use thiserror::Error;

use crate::EnvelopeId;

/// Serialization and deserialization errors.
///
/// Raised both when a message body cannot be produced for the wire and when a
/// whole envelope cannot be encoded for persistence.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Bincode serialization failed.
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Bincode deserialization failed.
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The envelope has neither a body nor a serializer able to produce one.
    #[error("Envelope {0} has no body and no serializer")]
    NoSerializer(EnvelopeId),

    /// The envelope has a serializer but nothing to serialize.
    #[error("Envelope {0} carries no message")]
    MissingMessage(EnvelopeId),

    /// The message payload is not of the type the serializer expects.
    #[error("Envelope {id} carries a message the serializer cannot write as {expected}")]
    UnexpectedMessageType { id: EnvelopeId, expected: &'static str },
}
