//! Health checks for the queue-keeper service
//!
//! A [`ServiceProbe`] holds cheap handles to the parts worth checking. The
//! HTTP endpoints, the periodic health task and `--health-check` all go
//! through [`HealthCheck`] on top of it.

use crate::amqp::AmqpConnection;
use crate::queue::QueueEngine;
use crate::refresh::{RefreshCoordinator, RefreshStatsSnapshot};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value used by the `health_status` metric
    pub fn gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: &HealthStatus) -> HealthStatus {
        match (&self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Set when the component is not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Guilds currently holding at least one entry
    pub active_guilds: usize,
    /// Entries stored across all guilds, hidden ones included
    pub queued_entries: usize,
    pub refresh: RefreshStatsSnapshot,
    pub uptime_seconds: u64,
}

/// Handles the health checks read from
#[derive(Clone)]
pub struct ServiceProbe {
    service_name: String,
    engine: QueueEngine,
    coordinator: RefreshCoordinator,
    amqp: Option<Arc<AmqpConnection>>,
    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
}

impl ServiceProbe {
    pub fn new(
        service_name: impl Into<String>,
        engine: QueueEngine,
        coordinator: RefreshCoordinator,
        is_running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            engine,
            coordinator,
            amqp: None,
            is_running,
            started_at: Instant::now(),
        }
    }

    pub fn with_amqp(mut self, connection: Arc<AmqpConnection>) -> Self {
        self.amqp = Some(connection);
        self
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn refresh_stats(&self) -> RefreshStatsSnapshot {
        self.coordinator.stats()
    }
}

fn component(name: &str, started: Instant, status: HealthStatus, message: Option<String>) -> ComponentCheck {
    ComponentCheck {
        name: name.to_string(),
        status,
        message,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

impl HealthCheck {
    /// Full check of every component plus current statistics
    pub async fn check(probe: &ServiceProbe) -> Result<Self> {
        let mut checks = vec![
            Self::check_service_running(probe).await,
            Self::check_queue_store(probe).await,
        ];
        if let Some(amqp) = Self::check_amqp_health(probe) {
            checks.push(amqp);
        }

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.worst(&c.status));
        let stats = Self::gather_service_stats(probe).await;

        Ok(HealthCheck {
            status,
            service: probe.service_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Liveness only looks at the running flag
    pub async fn liveness_check(probe: &ServiceProbe) -> Result<HealthStatus> {
        if probe.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Ready once running with a readable queue store
    pub async fn readiness_check(probe: &ServiceProbe) -> Result<HealthStatus> {
        if !probe.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(Self::check_queue_store(probe).await.status)
    }

    async fn check_service_running(probe: &ServiceProbe) -> ComponentCheck {
        let started = Instant::now();
        if probe.is_running().await {
            component("service_running", started, HealthStatus::Healthy, None)
        } else {
            component(
                "service_running",
                started,
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        }
    }

    async fn check_queue_store(probe: &ServiceProbe) -> ComponentCheck {
        let started = Instant::now();
        match probe.engine.active_guilds().await {
            Ok(_) => component("queue_store", started, HealthStatus::Healthy, None),
            Err(e) => {
                error!("Queue store health check failed: {}", e);
                component(
                    "queue_store",
                    started,
                    HealthStatus::Unhealthy,
                    Some(format!("Queue store unreadable: {}", e)),
                )
            }
        }
    }

    fn check_amqp_health(probe: &ServiceProbe) -> Option<ComponentCheck> {
        let connection = probe.amqp.as_ref()?;
        let started = Instant::now();
        let check = if connection.is_open() {
            component("amqp_connection", started, HealthStatus::Healthy, None)
        } else {
            component(
                "amqp_connection",
                started,
                HealthStatus::Unhealthy,
                Some("AMQP connection is closed".to_string()),
            )
        };
        Some(check)
    }

    async fn gather_service_stats(probe: &ServiceProbe) -> ServiceStats {
        let mut stats = ServiceStats {
            refresh: probe.refresh_stats(),
            uptime_seconds: probe.uptime_seconds(),
            ..ServiceStats::default()
        };

        let guilds = match probe.engine.active_guilds().await {
            Ok(guilds) => guilds,
            Err(e) => {
                debug!("Failed to list guilds for health stats: {}", e);
                return stats;
            }
        };
        stats.active_guilds = guilds.len();
        for guild_id in &guilds {
            match probe.engine.list(guild_id, usize::MAX).await {
                Ok(entries) => stats.queued_entries += entries.len(),
                Err(e) => debug!("Failed to count entries of guild '{}': {}", guild_id, e),
            }
        }
        stats
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
