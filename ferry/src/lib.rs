//! A ferry node: durable inbox and outbox delivery with cluster coordination.
//!
//! [`Ferry`] is the RON configuration of one node. [`Ferry::start`] opens the
//! store, registers the node and returns a [`FerryNode`] that routes
//! envelopes to their sending agents. [`Ferry::run`] does the same for the
//! binary and waits for a shutdown signal.

pub mod controller;
pub mod local;

pub use controller::{Ferry, FerryNode, SHUTDOWN_BROADCAST};
