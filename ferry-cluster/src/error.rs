use ferry_delivery::DeliveryError;
use ferry_store::StoreError;
use thiserror::Error;

/// Errors raised while coordinating nodes
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery failure: {0}")]
    Delivery(#[from] DeliveryError),

    /// The node has not been registered with the store yet
    #[error("Node has not been started")]
    NotStarted,

    #[error("Node is already running")]
    AlreadyRunning,
}

impl ClusterError {
    /// Returns `true` if the operation may succeed on a later tick
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Delivery(e) => e.is_transient(),
            Self::NotStarted | Self::AlreadyRunning => false,
        }
    }
}

impl From<url::ParseError> for ClusterError {
    fn from(err: url::ParseError) -> Self {
        Self::Delivery(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use ferry_common::NodeId;

    use super::*;

    #[test]
    fn test_classification() {
        assert!(!ClusterError::NotStarted.is_transient());
        assert!(!ClusterError::from(StoreError::NodeNotFound(NodeId::from(1u128))).is_transient());
        assert!(
            ClusterError::from(StoreError::CapacityExceeded {
                len: 10,
                capacity: 10
            })
            .is_transient()
        );
    }
}
