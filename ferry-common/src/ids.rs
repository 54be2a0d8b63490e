//! Identifiers for envelopes, nodes and envelope owners.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Globally unique 128-bit envelope identifier
///
/// Backed by a ULID so identifiers sort by creation time, which gives the
/// store a natural oldest-first ordering for recovery queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Ulid);

impl EnvelopeId {
    /// Generate a new unique envelope id
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }

    /// Milliseconds since the Unix epoch encoded in this id
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Parse an id from its canonical 26 character representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl From<u128> for EnvelopeId {
    fn from(value: u128) -> Self {
        Self(Ulid::from(value))
    }
}

impl From<Ulid> for EnvelopeId {
    fn from(value: Ulid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a cluster node, stable for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Ulid);

impl NodeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl From<u128> for NodeId {
    fn from(value: u128) -> Self {
        Self(Ulid::from(value))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of a persisted envelope
///
/// Owners are the short numbers the store assigns to nodes when they register.
/// [`OwnerId::ANY`] marks an envelope as unowned: it is up for grabs by any
/// node's recovery poll.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OwnerId(pub u32);

impl OwnerId {
    pub const ANY: Self = Self(0);

    #[must_use]
    pub const fn is_any(self) -> bool {
        self.0 == Self::ANY.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            f.write_str("any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
