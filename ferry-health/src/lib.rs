//! Health check endpoints for ferry nodes
//!
//! The controller feeds a [`HealthChecker`] with what it observes about the
//! store, the sending agents and the cluster, and [`HealthServer`] exposes it
//! over HTTP for orchestrator probes.
//!
//! # Endpoints
//!
//! - **`/health/live`** - Liveness probe: Returns 200 if the process is running
//! - **`/health/ready`** - Readiness probe: Returns 200 if the node can take work
//! - **`/health/status`** - Always 200, with the full [`HealthStatus`] as JSON
//!
//! # Usage
//!
//! ```rust,no_run
//! use ferry_health::{HealthServer, HealthConfig, HealthChecker};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HealthConfig::default();
//!
//! let health_checker = Arc::new(HealthChecker::new(config.max_backlog));
//! let server = HealthServer::new(&config, health_checker).await?;
//!
//! // Run the health server
//! // server.serve(shutdown_receiver).await?;
//! # Ok(())
//! # }
//! ```

mod checker;
mod config;
mod error;
mod server;

pub use checker::{HealthChecker, HealthStatus};
pub use config::HealthConfig;
pub use error::HealthError;
pub use server::HealthServer;
