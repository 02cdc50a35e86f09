//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the queue-keeper service:
//! queue lifecycle counters, refresh cycle timings and eligibility verdicts.

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::PruneCounts;

/// Main metrics collector for the queue service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Queue lifecycle metrics
    queue_metrics: QueueMetrics,

    /// Refresh coordinator metrics
    refresh_metrics: RefreshMetrics,

    /// Eligibility validation metrics
    eligibility_metrics: EligibilityMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Total AMQP messages processed
    pub amqp_messages_total: IntCounterVec,

    /// AMQP message processing errors
    pub amqp_errors_total: IntCounterVec,

    /// AMQP operation durations
    pub amqp_operation_duration: HistogramVec,

    /// Commands handled by name and result
    pub commands_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Queue lifecycle metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Join attempts by outcome (joined, refreshed, not_linked)
    pub joins_total: IntCounterVec,

    /// Leave requests by whether a row existed
    pub leaves_total: IntCounterVec,

    /// Presence transitions by kind and whether they applied
    pub presence_transitions_total: IntCounterVec,

    /// Entries removed by prune, per status class
    pub pruned_total: IntCounterVec,

    /// Entries shown in the last rendered roster, per guild
    pub roster_size: IntGaugeVec,
}

/// Refresh coordinator metrics
#[derive(Clone)]
pub struct RefreshMetrics {
    /// Refresh requests received
    pub requests_total: IntCounter,

    /// Prune+render cycles executed
    pub cycles_total: IntCounter,

    /// Stage failures by stage (prune, list, render) and kind (error, timeout)
    pub stage_failures_total: IntCounterVec,

    /// Forward wake-ups scheduled
    pub wakeups_scheduled_total: IntCounter,

    /// Full cycle duration
    pub cycle_duration: Histogram,
}

/// Eligibility validation metrics
#[derive(Clone)]
pub struct EligibilityMetrics {
    /// Validation results by verdict
    pub verdicts_total: IntCounterVec,

    /// Jobs skipped because the validation queue was full
    pub dropped_total: IntCounter,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let refresh_metrics = RefreshMetrics::new(&registry)?;
        let eligibility_metrics = EligibilityMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            refresh_metrics,
            eligibility_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn refresh(&self) -> &RefreshMetrics {
        &self.refresh_metrics
    }

    pub fn eligibility(&self) -> &EligibilityMetrics {
        &self.eligibility_metrics
    }

    pub fn record_join(&self, outcome: &str) {
        self.queue_metrics
            .joins_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_leave(&self, existed: bool) {
        let label = if existed { "removed" } else { "absent" };
        self.queue_metrics
            .leaves_total
            .with_label_values(&[label])
            .inc();
    }

    pub fn record_presence(&self, transition: &str, applied: bool) {
        let label = if applied { "applied" } else { "ignored" };
        self.queue_metrics
            .presence_transitions_total
            .with_label_values(&[transition, label])
            .inc();
    }

    pub fn record_prune(&self, counts: &PruneCounts) {
        self.queue_metrics
            .pruned_total
            .with_label_values(&["afk"])
            .inc_by(counts.afk);
        self.queue_metrics
            .pruned_total
            .with_label_values(&["left"])
            .inc_by(counts.left);
    }

    pub fn set_roster_size(&self, guild_id: &str, size: usize) {
        self.queue_metrics
            .roster_size
            .with_label_values(&[guild_id])
            .set(size as i64);
    }

    pub fn record_refresh_request(&self) {
        self.refresh_metrics.requests_total.inc();
    }

    pub fn record_refresh_cycle(&self, duration: Duration) {
        self.refresh_metrics.cycles_total.inc();
        self.refresh_metrics
            .cycle_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_stage_failure(&self, stage: &str, kind: &str) {
        self.refresh_metrics
            .stage_failures_total
            .with_label_values(&[stage, kind])
            .inc();
    }

    pub fn record_wakeup_scheduled(&self) {
        self.refresh_metrics.wakeups_scheduled_total.inc();
    }

    pub fn record_eligibility(&self, verdict: &str) {
        self.eligibility_metrics
            .verdicts_total
            .with_label_values(&[verdict])
            .inc();
    }

    pub fn record_validation_dropped(&self) {
        self.eligibility_metrics.dropped_total.inc();
    }

    pub fn record_command(&self, command: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.service_metrics
            .commands_total
            .with_label_values(&[command, status])
            .inc();
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.service_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("queue_keeper_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "queue_keeper_amqp_messages_total",
                "Total AMQP messages processed",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("queue_keeper_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "queue_keeper_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        let commands_total = IntCounterVec::new(
            Opts::new("queue_keeper_commands_total", "Commands handled"),
            &["command", "status"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let health_status = IntGauge::new(
            "queue_keeper_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("queue_keeper_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            amqp_operation_duration,
            commands_total,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let joins_total = IntCounterVec::new(
            Opts::new("queue_keeper_joins_total", "Join attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(joins_total.clone()))?;

        let leaves_total = IntCounterVec::new(
            Opts::new("queue_keeper_leaves_total", "Leave requests"),
            &["result"],
        )?;
        registry.register(Box::new(leaves_total.clone()))?;

        let presence_transitions_total = IntCounterVec::new(
            Opts::new(
                "queue_keeper_presence_transitions_total",
                "Presence-driven status transitions",
            ),
            &["transition", "result"],
        )?;
        registry.register(Box::new(presence_transitions_total.clone()))?;

        let pruned_total = IntCounterVec::new(
            Opts::new("queue_keeper_pruned_total", "Entries removed by prune"),
            &["status"],
        )?;
        registry.register(Box::new(pruned_total.clone()))?;

        let roster_size = IntGaugeVec::new(
            Opts::new("queue_keeper_roster_size", "Entries in the rendered roster"),
            &["guild"],
        )?;
        registry.register(Box::new(roster_size.clone()))?;

        Ok(Self {
            joins_total,
            leaves_total,
            presence_transitions_total,
            pruned_total,
            roster_size,
        })
    }
}

impl RefreshMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounter::new(
            "queue_keeper_refresh_requests_total",
            "Refresh requests received",
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let cycles_total = IntCounter::new(
            "queue_keeper_refresh_cycles_total",
            "Refresh cycles executed",
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let stage_failures_total = IntCounterVec::new(
            Opts::new(
                "queue_keeper_refresh_stage_failures_total",
                "Refresh stage failures",
            ),
            &["stage", "kind"],
        )?;
        registry.register(Box::new(stage_failures_total.clone()))?;

        let wakeups_scheduled_total = IntCounter::new(
            "queue_keeper_refresh_wakeups_total",
            "Forward wake-ups scheduled",
        )?;
        registry.register(Box::new(wakeups_scheduled_total.clone()))?;

        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "queue_keeper_refresh_cycle_duration_seconds",
                "Refresh cycle duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5]),
        )?;
        registry.register(Box::new(cycle_duration.clone()))?;

        Ok(Self {
            requests_total,
            cycles_total,
            stage_failures_total,
            wakeups_scheduled_total,
            cycle_duration,
        })
    }
}

impl EligibilityMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let verdicts_total = IntCounterVec::new(
            Opts::new(
                "queue_keeper_eligibility_verdicts_total",
                "Eligibility validation results",
            ),
            &["verdict"],
        )?;
        registry.register(Box::new(verdicts_total.clone()))?;

        let dropped_total = IntCounter::new(
            "queue_keeper_eligibility_dropped_total",
            "Validations skipped because the queue was full",
        )?;
        registry.register(Box::new(dropped_total.clone()))?;

        Ok(Self {
            verdicts_total,
            dropped_total,
        })
    }
}
