use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use ferry_common::Signal;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

use crate::{HealthChecker, HealthConfig, HealthError};

/// Serves the probe endpoints for one node
pub struct HealthServer {
    listener: TcpListener,
    router: Router,
}

impl HealthServer {
    /// Bind the configured address
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn new(
        config: &HealthConfig,
        health_checker: Arc<HealthChecker>,
    ) -> Result<Self, HealthError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|source| HealthError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;

        tracing::info!(address = %config.listen_address, "Health check server bound");

        Ok(Self {
            listener,
            router: router(health_checker),
        })
    }

    /// The bound address, useful when the configured port is 0
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, HealthError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a shutdown signal is broadcast
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), HealthError> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::debug!("Health check server received shutdown signal");
            })
            .await?;

        tracing::info!("Health check server stopped");
        Ok(())
    }
}

fn router(health_checker: Arc<HealthChecker>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/health/status", get(status_handler))
        .with_state(health_checker)
        // Probes must answer within a second
        .layer(TimeoutLayer::new(Duration::from_secs(1)))
}

async fn liveness_handler(State(health_checker): State<Arc<HealthChecker>>) -> Response {
    if health_checker.is_alive() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
    }
}

async fn readiness_handler(State(health_checker): State<Arc<HealthChecker>>) -> Response {
    if health_checker.is_ready() {
        return (StatusCode::OK, "OK").into_response();
    }

    let status = health_checker.status();
    tracing::warn!(
        store_ready = status.store_ready,
        agents_ready = status.agents_ready,
        node_registered = status.node_registered,
        backlog = status.backlog,
        max_backlog = status.max_backlog,
        "Readiness probe failed"
    );
    (StatusCode::SERVICE_UNAVAILABLE, Json(status)).into_response()
}

async fn status_handler(State(health_checker): State<Arc<HealthChecker>>) -> Response {
    (StatusCode::OK, Json(health_checker.status())).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use ferry_common::PersistedCounts;
    use tower::ServiceExt;

    use super::*;

    fn ready() -> Arc<HealthChecker> {
        let checker = Arc::new(HealthChecker::new(1000));
        checker.set_store_ready(true);
        checker.set_agents_ready(true);
        checker.set_node_registered(true);
        checker
    }

    async fn get_json(checker: Arc<HealthChecker>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(checker)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_liveness_probe_always_passes() {
        let checker = Arc::new(HealthChecker::new(1000));
        let response = liveness_handler(State(checker)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_probe_fails_when_not_ready() {
        let checker = Arc::new(HealthChecker::new(1000));
        let response = readiness_handler(State(checker)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readiness_probe_passes_when_all_ready() {
        let response = readiness_handler(State(ready())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_probe_fails_when_backlog_too_large() {
        let checker = ready();
        checker.set_counts(PersistedCounts {
            outgoing: 2000,
            ..PersistedCounts::default()
        });

        let (status, body) = get_json(checker, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["backlog"], 2000);
    }

    #[tokio::test]
    async fn test_status_reports_counts_and_leadership() {
        let checker = ready();
        checker.set_leader(true);
        checker.set_latched_agents(2);
        checker.set_counts(PersistedCounts {
            incoming: 4,
            dead_letter: 1,
            ..PersistedCounts::default()
        });

        let (status, body) = get_json(checker, "/health/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leader"], true);
        assert_eq!(body["latched_agents"], 2);
        assert_eq!(body["counts"]["incoming"], 4);
        assert_eq!(body["counts"]["dead_letter"], 1);
    }

    #[tokio::test]
    async fn test_server_shuts_down_on_signal() {
        let config = HealthConfig {
            listen_address: "127.0.0.1:0".to_string(),
            ..HealthConfig::default()
        };
        let server = HealthServer::new(&config, ready()).await.expect("binds");
        assert_ne!(server.local_addr().expect("bound").port(), 0);

        let (sender, receiver) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(server.serve(receiver));
        sender.send(Signal::Shutdown).expect("sent");

        let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
    }
}
