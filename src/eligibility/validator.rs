//! Detached eligibility validation
//!
//! Joins submit a job to a bounded queue drained by a fixed set of workers.
//! Each job runs the chain under an overall deadline and reports through an
//! outcome channel; the [`OutcomeDispatcher`] is the only consumer and the
//! only place that acts on a denial.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::EligibilitySettings;
use crate::metrics::MetricsCollector;
use crate::refresh::RefreshCoordinator;
use crate::store::QueueStore;
use crate::types::{EligibilityDenied, GuildId, UserId};
use crate::utils::Clock;

use super::{EligibilityChain, EligibilityNotifier, EligibilityReport};

/// Pool sizing and deadline
#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub deadline: Duration,
}

impl ValidatorSettings {
    pub fn from_config(settings: &EligibilitySettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            queue_capacity: settings.queue_capacity.max(1),
            deadline: Duration::from_millis(settings.validation_deadline_ms),
        }
    }
}

#[derive(Debug, Clone)]
struct ValidationJob {
    guild_id: GuildId,
    user_id: UserId,
    submitted_at: Instant,
}

/// How a validation job ended
#[derive(Debug, Clone)]
pub enum ValidationResult {
    Completed(EligibilityReport),
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub result: ValidationResult,
    /// Time from submission to completion, including queueing
    pub elapsed: Duration,
}

/// Handle for submitting validation jobs
#[derive(Clone)]
pub struct EligibilityValidator {
    sender: mpsc::Sender<ValidationJob>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    metrics: Arc<MetricsCollector>,
}

impl EligibilityValidator {
    /// Spawn the worker pool; outcomes arrive on the returned receiver
    pub fn start(
        chain: Arc<EligibilityChain>,
        settings: ValidatorSettings,
        metrics: Arc<MetricsCollector>,
    ) -> (Self, mpsc::Receiver<ValidationOutcome>) {
        let (sender, jobs) = mpsc::channel::<ValidationJob>(settings.queue_capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(settings.queue_capacity);
        let jobs = Arc::new(tokio::sync::Mutex::new(jobs));

        let handles = (0..settings.workers)
            .map(|worker_id| {
                let chain = chain.clone();
                let jobs = jobs.clone();
                let outcomes = outcome_tx.clone();
                let deadline = settings.deadline;
                tokio::spawn(async move {
                    debug!("Eligibility worker {} started", worker_id);
                    loop {
                        let job = { jobs.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        let outcome = Self::run_job(&chain, job, deadline).await;
                        if outcomes.send(outcome).await.is_err() {
                            break;
                        }
                    }
                    debug!("Eligibility worker {} stopped", worker_id);
                })
            })
            .collect();

        info!(
            "Eligibility validator started with {} workers (capacity {}, deadline {:?})",
            settings.workers, settings.queue_capacity, settings.deadline
        );

        let validator = Self {
            sender,
            workers: Arc::new(Mutex::new(handles)),
            metrics,
        };
        (validator, outcome_rx)
    }

    async fn run_job(
        chain: &EligibilityChain,
        job: ValidationJob,
        deadline: Duration,
    ) -> ValidationOutcome {
        let result = match timeout(deadline, chain.evaluate(&job.guild_id, &job.user_id)).await {
            Ok(Ok(report)) => ValidationResult::Completed(report),
            Ok(Err(e)) => ValidationResult::Failed(e.to_string()),
            Err(_) => ValidationResult::TimedOut,
        };
        ValidationOutcome {
            guild_id: job.guild_id,
            user_id: job.user_id,
            result,
            elapsed: job.submitted_at.elapsed(),
        }
    }

    /// Queue a validation without waiting; returns false when the queue is full or closed
    pub fn submit(&self, guild_id: &str, user_id: &str) -> bool {
        let job = ValidationJob {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            submitted_at: Instant::now(),
        };
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    "Eligibility queue full; skipping validation of '{}' in guild '{}'",
                    job.user_id, job.guild_id
                );
                self.metrics.record_validation_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Eligibility validator is shut down; validation skipped");
                false
            }
        }
    }

    /// Abort all workers
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let handles = std::mem::take(&mut *workers);
        drop(workers);
        let count = handles.len();
        for handle in handles {
            handle.abort();
        }
        info!("Eligibility validator stopped ({} workers)", count);
    }
}

/// Acts on validation outcomes
pub struct OutcomeDispatcher {
    notifier: Arc<dyn EligibilityNotifier>,
    store: Arc<dyn QueueStore>,
    coordinator: RefreshCoordinator,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    evict_ineligible: bool,
}

impl OutcomeDispatcher {
    pub fn new(
        notifier: Arc<dyn EligibilityNotifier>,
        store: Arc<dyn QueueStore>,
        coordinator: RefreshCoordinator,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        evict_ineligible: bool,
    ) -> Self {
        Self {
            notifier,
            store,
            coordinator,
            clock,
            metrics,
            evict_ineligible,
        }
    }

    /// Consume outcomes until every sender is gone
    pub async fn run(self, mut outcomes: mpsc::Receiver<ValidationOutcome>) {
        info!("Eligibility outcome dispatcher started");
        while let Some(outcome) = outcomes.recv().await {
            self.handle(outcome).await;
        }
        info!("Eligibility outcome dispatcher stopped");
    }

    pub async fn handle(&self, outcome: ValidationOutcome) {
        let ValidationOutcome {
            guild_id,
            user_id,
            result,
            elapsed,
        } = outcome;

        let report = match result {
            ValidationResult::Completed(report) => report,
            ValidationResult::TimedOut => {
                warn!(
                    "Eligibility validation of '{}' in guild '{}' timed out after {:?}; keeping entry",
                    user_id, guild_id, elapsed
                );
                self.metrics.record_eligibility("timeout");
                return;
            }
            ValidationResult::Failed(message) => {
                warn!(
                    "Eligibility validation of '{}' in guild '{}' failed: {}; keeping entry",
                    user_id, guild_id, message
                );
                self.metrics.record_eligibility("error");
                return;
            }
        };

        self.metrics.record_eligibility(report.verdict.label());
        if report.verdict.is_eligible() {
            debug!(
                "User '{}' in guild '{}' validated in {:.2}ms",
                user_id,
                guild_id,
                elapsed.as_secs_f64() * 1000.0
            );
            return;
        }

        // The user may have left while validation ran
        match self.store.exists(&guild_id, &user_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "User '{}' left guild '{}' queue before denial; nothing to do",
                    user_id, guild_id
                );
                return;
            }
            Err(e) => {
                error!("Failed to check queue entry for '{}': {}", user_id, e);
                return;
            }
        }

        let mut evicted = false;
        if self.evict_ineligible {
            match self.store.leave(&guild_id, &user_id).await {
                Ok(existed) => {
                    evicted = existed;
                    info!(
                        "Evicted ineligible user '{}' from guild '{}' queue ({})",
                        user_id,
                        guild_id,
                        report.verdict.label()
                    );
                }
                Err(e) => error!("Failed to evict '{}': {}", user_id, e),
            }
        }

        let notice = EligibilityDenied {
            guild_id: guild_id.clone(),
            user_id: user_id.clone(),
            reason: report.verdict.reason(),
            retry_after_secs: report.verdict.retry_after().map(|d| d.as_secs()),
            evicted,
            timestamp: self.clock.now(),
        };
        if let Err(e) = self.notifier.notify_denied(&notice).await {
            warn!("Failed to deliver eligibility notice to '{}': {}", user_id, e);
        }

        if evicted {
            self.coordinator.request_refresh(&guild_id);
        }
    }
}
