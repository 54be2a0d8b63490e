//! Durable storage for the ferry delivery core.
//!
//! [`MessageStore`] is the contract every backend fulfils: an inbox of
//! received and scheduled envelopes, an outbox of envelopes awaiting delivery,
//! dead letters, and the node table used for cluster coordination.
//! [`MemoryMessageStore`] is the bundled backend, optionally persisted through
//! atomic snapshots.

pub mod backends;
pub mod config;
pub mod error;
pub mod lock;
pub mod store;

pub use backends::{MemoryMessageStore, Snapshot};
pub use config::{BackendConfig, StoreConfig, StoreSettings};
pub use error::{Result, StoreError, ValidationError};
pub use lock::{LeadershipLock, MemoryLeadershipLock};
pub use store::{DeadLetters, Inbox, MessageStore, NodeStore, Outbox, StoreOutcome};
