//! Delivery policies kept apart from the agents and receiver that apply them.
//!
//! - [`RetryPolicy`]: when a failed incoming envelope is retried, and when it
//!   is given up on and dead-lettered

pub mod backoff;
pub mod retry;

pub use backoff::backoff_delay;
pub use retry::RetryPolicy;
