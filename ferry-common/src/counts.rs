use serde::{Deserialize, Serialize};

/// Number of persisted rows in each store table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounts {
    pub incoming: u64,
    pub scheduled: u64,
    pub outgoing: u64,
    pub handled: u64,
    pub dead_letter: u64,
}

impl PersistedCounts {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.incoming + self.scheduled + self.outgoing + self.handled + self.dead_letter
    }
}
