//! Cluster coordination for the ferry delivery core.
//!
//! Nodes never talk to each other directly. Everything goes through the
//! shared [`ferry_store::MessageStore`]:
//!
//! - every node heartbeats its row in the node table
//! - one node holds the [`ferry_store::LeadershipLock`] and runs the leader
//!   duties: promoting scheduled envelopes, deleting expired rows, ejecting
//!   nodes that stopped heartbeating, pruning the event log
//! - every node claims globally owned envelopes through [`Recovery`]

mod config;
mod coordinator;
mod error;
pub mod heartbeat;
pub mod leader;
mod recovery;

pub use config::ClusterConfig;
pub use coordinator::NodeCoordinator;
pub use error::{ClusterError, Result};
pub use leader::DutyReport;
pub use recovery::{Recovery, RecoveryReport};
