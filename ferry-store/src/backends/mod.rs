//! Backend storage implementations
//!
//! - `memory`: all tables in memory behind one lock
//! - `snapshot`: atomic on-disk snapshots of the memory tables

pub mod memory;
pub mod snapshot;

pub use memory::MemoryMessageStore;
pub use snapshot::Snapshot;
