use thiserror::Error;

/// Errors raised by the health endpoint server
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Failed to bind health server to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// The server stopped with an I/O failure while accepting connections
    #[error("Health server failed: {0}")]
    Serve(#[from] std::io::Error),
}
