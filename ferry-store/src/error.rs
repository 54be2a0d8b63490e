//! Error types for the ferry-store crate.
//!
//! Every store operation returns [`StoreError`]. Duplicate inserts are not
//! errors: they are reported through [`crate::StoreOutcome::Duplicate`].

use std::io;

use ferry_common::{EnvelopeId, NodeId, SerializationError};
use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed while reading or writing the snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Envelope or snapshot encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// No envelope with this id is stored.
    #[error("Envelope not found: {0}")]
    NotFound(EnvelopeId),

    /// No node with this id is registered.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Store configuration or path validation failed.
    #[error("Store validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The memory store reached its configured row limit.
    #[error("Store capacity exceeded: {len}/{capacity} envelopes")]
    CapacityExceeded { len: usize, capacity: usize },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::CapacityExceeded { .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NodeNotFound(_))
    }
}

/// Snapshot path validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Store path cannot contain '..' components: {0}")]
    ParentTraversal(String),

    #[error("Store path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Store path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: &'static str, path: String },

    #[error("Store path is not a directory: {0}")]
    NotDirectory(String),
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(SerializationError::Encode(e))
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(SerializationError::Decode(e))
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
