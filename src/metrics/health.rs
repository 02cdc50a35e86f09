//! Health check endpoints and Prometheus metrics server
//!
//! Serves liveness, readiness, Prometheus text and a JSON stats page over
//! Axum. Until a [`ServiceProbe`] is attached every probe answers 503.

use crate::metrics::collector::MetricsCollector;
use crate::service::health::{HealthCheck, HealthStatus, ServiceProbe};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const SERVICE: &str = "queue-keeper";

#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    /// Bind address, "0.0.0.0" for all interfaces
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub probe: Option<ServiceProbe>,
}

/// HTTP server for monitoring endpoints
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                probe: None,
            },
            shutdown_tx,
        }
    }

    pub fn with_probe(mut self, probe: ServiceProbe) -> Self {
        self.state.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &HealthServerConfig {
        &self.config
    }

    /// Bind and serve until [`HealthServer::stop`] is called
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health server to {}", addr))?;
        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        info!("Health server stopped");
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .with_state(self.state.clone())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Health server was not running: {}", e);
        }
        Ok(())
    }
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/ready", "/alive", "/metrics", "/stats"]
    }))
}

async fn health_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Health check requested");

    let Some(probe) = &state.probe else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": SERVICE,
                "version": env!("CARGO_PKG_VERSION"),
                "error": "Service not initialized"
            })),
        );
    };

    let (code, status) = match HealthCheck::liveness_check(probe).await {
        Ok(HealthStatus::Healthy) => (StatusCode::OK, "healthy"),
        Ok(HealthStatus::Degraded) => (StatusCode::OK, "degraded"),
        Ok(HealthStatus::Unhealthy) | Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    (
        code,
        Json(json!({
            "status": status,
            "service": SERVICE,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn ready_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let Some(probe) = &state.probe else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized");
    };

    match HealthCheck::readiness_check(probe).await {
        Ok(HealthStatus::Healthy) => (StatusCode::OK, "Ready"),
        Ok(HealthStatus::Degraded) => (StatusCode::OK, "Degraded but ready"),
        Ok(HealthStatus::Unhealthy) => (StatusCode::SERVICE_UNAVAILABLE, "Not ready"),
        Err(e) => {
            error!("Readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
        }
    }
}

async fn alive_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let Some(probe) = &state.probe else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized");
    };

    match HealthCheck::liveness_check(probe).await {
        Ok(HealthStatus::Healthy) => (StatusCode::OK, "Alive"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "Not alive"),
    }
}

async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    let metric_families = state.metrics_collector.registry().gather();
    let encoder = TextEncoder::new();

    match encoder.encode_to_string(&metric_families) {
        Ok(body) => {
            debug!("Serving {} metric families", metric_families.len());
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, encoder.format_type().to_string())],
                body,
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Human-oriented stats page
async fn stats_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let error_body = |message: String| {
        json!({
            "service": {
                "name": SERVICE,
                "version": env!("CARGO_PKG_VERSION"),
                "status": "error"
            },
            "error": message,
            "timestamp": chrono::Utc::now()
        })
    };

    let Some(probe) = &state.probe else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body("Service not initialized".to_string())),
        );
    };

    match HealthCheck::check(probe).await {
        Ok(health) => (
            StatusCode::OK,
            Json(json!({
                "service": {
                    "name": health.service,
                    "version": health.version,
                    "status": health.status,
                    "uptime_seconds": health.stats.uptime_seconds
                },
                "queue": {
                    "active_guilds": health.stats.active_guilds,
                    "entries": health.stats.queued_entries
                },
                "refresh": health.stats.refresh,
                "components": health.checks,
                "timestamp": health.timestamp
            })),
        ),
        Err(e) => {
            error!("Failed to get stats: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_body(format!("Failed to get service stats: {}", e))),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyDefaults;
    use crate::policy::PolicyService;
    use crate::queue::{EngineSettings, QueueEngine};
    use crate::refresh::{LoggingPresenter, RefreshCoordinator, RefreshSettings};
    use crate::store::{InMemoryLinkStore, InMemoryPolicyStore, InMemoryQueueStore};
    use crate::utils::{Clock, SystemClock};
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn collector() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new().expect("Failed to create collector"))
    }

    fn running_probe(metrics: Arc<MetricsCollector>) -> ServiceProbe {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let policies = PolicyService::new(
            Arc::new(InMemoryPolicyStore::new(PolicyDefaults::default(), clock.clone())),
            PolicyDefaults::default(),
        );
        let engine = QueueEngine::new(
            Arc::new(InMemoryQueueStore::new(clock.clone())),
            Arc::new(InMemoryLinkStore::new(clock.clone())),
            policies,
            clock.clone(),
            metrics.clone(),
            EngineSettings::default(),
        );
        let coordinator = RefreshCoordinator::new(
            engine.clone(),
            Arc::new(LoggingPresenter),
            clock,
            metrics,
            RefreshSettings::default(),
        );
        ServiceProbe::new(SERVICE, engine, coordinator, Arc::new(RwLock::new(true)))
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let server = HealthServer::new(HealthServerConfig::default(), collector());
        let response = get(server.create_router(), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = collector();
        metrics.record_join("joined");
        metrics.update_health_status(2);

        let server = HealthServer::new(HealthServerConfig::default(), metrics);
        let response = get(server.create_router(), "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("queue_keeper_"));
    }

    #[tokio::test]
    async fn test_probes_unavailable_without_service() {
        let server = HealthServer::new(HealthServerConfig::default(), collector());
        let app = server.create_router();

        for uri in ["/health", "/ready", "/alive", "/stats"] {
            let response = get(app.clone(), uri).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_probes_with_running_service() {
        let metrics = collector();
        let server = HealthServer::new(HealthServerConfig::default(), metrics.clone())
            .with_probe(running_probe(metrics));
        let app = server.create_router();

        for uri in ["/health", "/ready", "/alive"] {
            let response = get(app.clone(), uri).await;
            assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        }

        let response = get(app, "/stats").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["queue"]["entries"], 0);
        assert_eq!(stats["refresh"]["cycles"], 0);
    }

    #[tokio::test]
    async fn test_404_handling() {
        let server = HealthServer::new(HealthServerConfig::default(), collector());
        let response = get(server.create_router(), "/nonexistent").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_health_server_config() {
        let config = HealthServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
    }
}
