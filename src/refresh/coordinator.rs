//! Per-guild debounced refresh scheduling
//!
//! Each guild owns a slot holding its debounce timer, its forward wake-up and
//! a cycle lock. The timer state sits behind a plain mutex that is never held
//! across an await; the cycle lock keeps two cycles for the same guild from
//! overlapping. Guilds never wait on each other. A slot with nothing pending
//! is dropped once its cycle ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::queue::QueueEngine;
use crate::types::{GuildId, RosterSnapshot};
use crate::utils::{remaining_until, to_chrono, Clock};

use super::RosterPresenter;

/// Timing knobs for the coordinator
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub debounce: Duration,
    pub prune_timeout: Duration,
    pub list_timeout: Duration,
    pub render_timeout: Duration,
    pub wakeup_margin: Duration,
    pub sweep_interval: Duration,
    pub imminent_window: Duration,
    pub managed_guilds: Vec<GuildId>,
}

impl RefreshSettings {
    pub fn from_config(settings: &QueueSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.debounce_ms),
            prune_timeout: Duration::from_millis(settings.prune_timeout_ms),
            list_timeout: Duration::from_millis(settings.list_timeout_ms),
            render_timeout: Duration::from_millis(settings.render_timeout_ms),
            wakeup_margin: Duration::from_millis(settings.wakeup_margin_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            imminent_window: Duration::from_secs(settings.imminent_window_secs),
            managed_guilds: settings.managed_guilds.clone(),
        }
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self::from_config(&QueueSettings::default())
    }
}

/// Running counters, readable while the coordinator works
#[derive(Debug, Default)]
pub struct RefreshStats {
    requests: AtomicU64,
    cycles: AtomicU64,
    renders: AtomicU64,
    pruned: AtomicU64,
    prune_failures: AtomicU64,
    list_failures: AtomicU64,
    render_failures: AtomicU64,
    wakeups: AtomicU64,
}

/// Point-in-time copy of [`RefreshStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStatsSnapshot {
    pub requests: u64,
    pub cycles: u64,
    pub renders: u64,
    /// Entries removed by prune stages
    pub pruned: u64,
    pub prune_failures: u64,
    pub list_failures: u64,
    pub render_failures: u64,
    pub wakeups: u64,
}

impl RefreshStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RefreshStatsSnapshot {
        RefreshStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            renders: self.renders.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            prune_failures: self.prune_failures.load(Ordering::Relaxed),
            list_failures: self.list_failures.load(Ordering::Relaxed),
            render_failures: self.render_failures.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct TimerState {
    /// Set on every request; a debounce task only fires if it still holds the latest value
    generation: u64,
    pending: Option<JoinHandle<()>>,
    wakeup: Option<(DateTime<Utc>, JoinHandle<()>)>,
}

#[derive(Default)]
struct GuildSlot {
    timer: Mutex<TimerState>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl GuildSlot {
    fn timer(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_idle(&self) -> bool {
        let timer = self.timer();
        timer.pending.is_none() && timer.wakeup.is_none()
    }
}

struct Inner {
    engine: QueueEngine,
    presenter: Arc<dyn RosterPresenter>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    settings: RefreshSettings,
    slots: Mutex<HashMap<GuildId, Arc<GuildSlot>>>,
    /// Request generations stay unique across dropped and recreated slots
    generations: AtomicU64,
    stats: RefreshStats,
}

/// Single-flight refresh scheduler keyed by guild
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        engine: QueueEngine,
        presenter: Arc<dyn RosterPresenter>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                presenter,
                clock,
                metrics,
                settings,
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                stats: RefreshStats::default(),
            }),
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> RefreshStatsSnapshot {
        self.inner.stats.snapshot()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<GuildId, Arc<GuildSlot>>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, guild_id: &str) -> Arc<GuildSlot> {
        self.slots().entry(guild_id.to_string()).or_default().clone()
    }

    fn existing_slot(&self, guild_id: &str) -> Option<Arc<GuildSlot>> {
        self.slots().get(guild_id).cloned()
    }

    /// Drop the guild's slot when no task holds it and no timer is armed.
    ///
    /// Every clone of a slot is taken under the map lock, so a strong count of
    /// one seen under that lock means nobody else can be using it.
    fn release_if_idle(&self, guild_id: &str) {
        let mut slots = self.slots();
        let idle = slots
            .get(guild_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && slot.is_idle());
        if idle {
            slots.remove(guild_id);
            debug!("Released idle refresh slot for guild '{}'", guild_id);
        }
    }

    /// Number of guilds currently holding refresh state
    pub fn tracked_guilds(&self) -> usize {
        self.slots().len()
    }

    /// Arm or re-arm the debounce window for `guild_id`.
    ///
    /// Calls landing inside an open window cancel the pending firing and
    /// start a new window, so a burst produces exactly one cycle.
    pub fn request_refresh(&self, guild_id: &str) {
        RefreshStats::bump(&self.inner.stats.requests);
        self.inner.metrics.record_refresh_request();

        let slot = self.slot(guild_id);
        let mut timer = slot.timer();
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        timer.generation = generation;
        if let Some(pending) = timer.pending.take() {
            pending.abort();
        }

        let this = self.clone();
        let guild = guild_id.to_string();
        let debounce = self.inner.settings.debounce;
        timer.pending = Some(tokio::spawn(async move {
            sleep(debounce).await;
            this.fire(&guild, generation).await;
        }));
    }

    async fn fire(&self, guild_id: &str, generation: u64) {
        {
            let slot = self.slot(guild_id);
            {
                let mut timer = slot.timer();
                if timer.generation != generation {
                    return;
                }
                // Detach the handle so a later request cannot abort a running cycle
                timer.pending = None;
            }

            let _cycle = slot.cycle_lock.lock().await;
            self.run_cycle(guild_id).await;
        }
        self.release_if_idle(guild_id);
    }

    /// Run a cycle immediately, waiting for any in-flight cycle of the same guild
    pub async fn refresh_now(&self, guild_id: &str) {
        {
            let slot = self.slot(guild_id);
            let _cycle = slot.cycle_lock.lock().await;
            self.run_cycle(guild_id).await;
        }
        self.release_if_idle(guild_id);
    }

    async fn run_cycle(&self, guild_id: &str) {
        let started = Instant::now();
        RefreshStats::bump(&self.inner.stats.cycles);
        debug!("Refresh cycle started for guild '{}'", guild_id);

        self.prune_stage(guild_id).await;
        if let Some(roster) = self.list_stage(guild_id).await {
            if self.render_stage(&roster).await {
                if let Some(expiry) = self.nearest_expiry(&roster).await {
                    self.schedule_wakeup(guild_id, expiry);
                }
            }
        }

        let elapsed = started.elapsed();
        self.inner.metrics.record_refresh_cycle(elapsed);
        debug!(
            "Refresh cycle for guild '{}' finished in {:.2}ms",
            guild_id,
            elapsed.as_secs_f64() * 1000.0
        );
    }

    async fn prune_stage(&self, guild_id: &str) {
        let started = Instant::now();
        let limit = self.inner.settings.prune_timeout;
        match timeout(limit, self.inner.engine.prune(guild_id)).await {
            Ok(Ok(counts)) => {
                self.inner
                    .stats
                    .pruned
                    .fetch_add(counts.total(), Ordering::Relaxed);
                debug!(
                    "Prune for guild '{}' removed {} afk and {} left entries in {:?}",
                    guild_id,
                    counts.afk,
                    counts.left,
                    started.elapsed()
                )
            }
            Ok(Err(e)) => {
                error!("Prune failed for guild '{}': {}", guild_id, e);
                self.stage_failed("prune", "error", &self.inner.stats.prune_failures);
            }
            Err(_) => {
                error!("Prune timed out for guild '{}' after {:?}", guild_id, limit);
                self.stage_failed("prune", "timeout", &self.inner.stats.prune_failures);
            }
        }
    }

    async fn list_stage(&self, guild_id: &str) -> Option<RosterSnapshot> {
        let started = Instant::now();
        let limit = self.inner.settings.list_timeout;
        match timeout(limit, self.inner.engine.roster(guild_id)).await {
            Ok(Ok(roster)) => {
                debug!(
                    "Listed {} entries for guild '{}' in {:?}",
                    roster.len(),
                    guild_id,
                    started.elapsed()
                );
                Some(roster)
            }
            Ok(Err(e)) => {
                error!("Listing failed for guild '{}': {}", guild_id, e);
                self.stage_failed("list", "error", &self.inner.stats.list_failures);
                None
            }
            Err(_) => {
                error!("Listing timed out for guild '{}' after {:?}", guild_id, limit);
                self.stage_failed("list", "timeout", &self.inner.stats.list_failures);
                None
            }
        }
    }

    async fn render_stage(&self, roster: &RosterSnapshot) -> bool {
        let started = Instant::now();
        let limit = self.inner.settings.render_timeout;
        match timeout(limit, self.inner.presenter.render(roster)).await {
            Ok(Ok(())) => {
                RefreshStats::bump(&self.inner.stats.renders);
                self.inner
                    .metrics
                    .set_roster_size(&roster.guild_id, roster.len());
                debug!(
                    "Rendered roster for guild '{}' in {:?}",
                    roster.guild_id,
                    started.elapsed()
                );
                true
            }
            Ok(Err(e)) => {
                error!("Render failed for guild '{}': {}", roster.guild_id, e);
                self.stage_failed("render", "error", &self.inner.stats.render_failures);
                false
            }
            Err(_) => {
                error!(
                    "Render timed out for guild '{}' after {:?}",
                    roster.guild_id, limit
                );
                self.stage_failed("render", "timeout", &self.inner.stats.render_failures);
                false
            }
        }
    }

    /// Earliest grace deadline across every row of the guild, not just the
    /// rendered ones; falls back to the roster's own when the store is slow
    async fn nearest_expiry(&self, roster: &RosterSnapshot) -> Option<DateTime<Utc>> {
        let limit = self.inner.settings.list_timeout;
        match timeout(limit, self.inner.engine.next_expiry(&roster.guild_id)).await {
            Ok(Ok(expiry)) => expiry,
            Ok(Err(e)) => {
                warn!(
                    "Could not read expiries for guild '{}': {}",
                    roster.guild_id, e
                );
                roster.next_expiry
            }
            Err(_) => {
                warn!(
                    "Expiry lookup timed out for guild '{}' after {:?}",
                    roster.guild_id, limit
                );
                roster.next_expiry
            }
        }
    }

    fn stage_failed(&self, stage: &str, kind: &str, counter: &AtomicU64) {
        RefreshStats::bump(counter);
        self.inner.metrics.record_stage_failure(stage, kind);
    }

    /// Schedule a follow-up refresh just after `expiry`, keeping only the earliest per guild
    fn schedule_wakeup(&self, guild_id: &str, expiry: DateTime<Utc>) {
        let at = expiry + to_chrono(self.inner.settings.wakeup_margin);
        let slot = self.slot(guild_id);
        let mut timer = slot.timer();

        if let Some((existing, handle)) = &timer.wakeup {
            if *existing <= at && !handle.is_finished() {
                return;
            }
        }
        if let Some((_, handle)) = timer.wakeup.take() {
            handle.abort();
        }

        let delay = remaining_until(at, self.inner.clock.now());
        let this = self.clone();
        let guild = guild_id.to_string();
        timer.wakeup = Some((
            at,
            tokio::spawn(async move {
                sleep(delay).await;
                this.clear_wakeup(&guild, at);
                this.request_refresh(&guild);
            }),
        ));
        drop(timer);

        RefreshStats::bump(&self.inner.stats.wakeups);
        self.inner.metrics.record_wakeup_scheduled();
        debug!(
            "Wake-up for guild '{}' scheduled in {:?} (at {})",
            guild_id, delay, at
        );
    }

    fn clear_wakeup(&self, guild_id: &str, at: DateTime<Utc>) {
        if let Some(slot) = self.existing_slot(guild_id) {
            let mut timer = slot.timer();
            if timer.wakeup.as_ref().is_some_and(|(existing, _)| *existing == at) {
                timer.wakeup = None;
            }
        }
    }

    /// Deadline of the pending forward wake-up, if any
    pub fn pending_wakeup(&self, guild_id: &str) -> Option<DateTime<Utc>> {
        let slot = self.existing_slot(guild_id)?;
        let timer = slot.timer();
        timer.wakeup.as_ref().map(|(at, _)| *at)
    }

    /// Request a refresh for every guild whose nearest grace deadline is imminent
    pub async fn sweep_once(&self) -> Result<usize> {
        let mut guilds: BTreeSet<GuildId> =
            self.inner.engine.active_guilds().await?.into_iter().collect();
        guilds.extend(self.inner.settings.managed_guilds.iter().cloned());

        let horizon = self.inner.clock.now() + to_chrono(self.inner.settings.imminent_window);
        let mut requested = 0;
        for guild_id in guilds {
            match self.inner.engine.next_expiry(&guild_id).await {
                Ok(Some(expiry)) if expiry <= horizon => {
                    self.request_refresh(&guild_id);
                    requested += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Sweep could not read expiries for guild '{}': {}", guild_id, e),
            }
        }
        Ok(requested)
    }

    /// Supervisory sweep loop; runs until the task is aborted
    pub async fn run_supervisor(self) {
        let period = self.inner.settings.sweep_interval;
        info!("Refresh supervisor started (every {:?})", period);
        let mut ticks = IntervalStream::new(tokio::time::interval(period));
        while ticks.next().await.is_some() {
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(n) => debug!("Sweep requested refresh for {} guilds", n),
                Err(e) => warn!("Refresh sweep failed: {}", e),
            }
        }
    }

    /// Cancel every pending debounce and wake-up and forget all guild slots
    pub fn shutdown(&self) {
        let slots: Vec<Arc<GuildSlot>> = self.slots().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let mut timer = slot.timer();
            if let Some(pending) = timer.pending.take() {
                pending.abort();
            }
            if let Some((_, handle)) = timer.wakeup.take() {
                handle.abort();
            }
        }
        info!("Refresh coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyDefaults;
    use crate::link::UserLink;
    use crate::policy::PolicyService;
    use crate::queue::EngineSettings;
    use crate::store::{InMemoryLinkStore, InMemoryPolicyStore, InMemoryQueueStore, LinkStore};
    use crate::utils::ManualClock;
    use async_trait::async_trait;

    #[derive(Default)]
    struct CountingPresenter {
        rendered: Mutex<Vec<RosterSnapshot>>,
    }

    #[async_trait]
    impl RosterPresenter for CountingPresenter {
        async fn render(&self, roster: &RosterSnapshot) -> Result<()> {
            self.rendered.lock().unwrap().push(roster.clone());
            Ok(())
        }
    }

    struct Harness {
        coordinator: RefreshCoordinator,
        engine: QueueEngine,
        presenter: Arc<CountingPresenter>,
        clock: Arc<ManualClock>,
        links: Arc<InMemoryLinkStore>,
    }

    fn harness() -> Harness {
        harness_with_limit(EngineSettings::default().roster_limit)
    }

    fn harness_with_limit(roster_limit: usize) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let links = Arc::new(InMemoryLinkStore::new(clock.clone()));
        let defaults = PolicyDefaults::default();
        let policies = PolicyService::new(
            Arc::new(InMemoryPolicyStore::new(defaults.clone(), clock.clone())),
            defaults,
        );
        let engine = QueueEngine::new(
            Arc::new(InMemoryQueueStore::new(clock.clone())),
            links.clone(),
            policies,
            clock.clone(),
            metrics.clone(),
            EngineSettings {
                roster_limit,
                ..EngineSettings::default()
            },
        );
        let presenter = Arc::new(CountingPresenter::default());
        let settings = RefreshSettings {
            debounce: Duration::from_millis(20),
            ..RefreshSettings::default()
        };
        let coordinator =
            RefreshCoordinator::new(engine.clone(), presenter.clone(), clock.clone(), metrics, settings);
        Harness {
            coordinator,
            engine,
            presenter,
            clock,
            links,
        }
    }

    async fn link(h: &Harness, user: &str) {
        h.links
            .upsert_link(UserLink::new(user, format!("ext-{}", user), user, h.clock.now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_burst_collapses_to_one_cycle() {
        let h = harness();
        for _ in 0..25 {
            h.coordinator.request_refresh("g1");
        }
        sleep(Duration::from_millis(120)).await;

        let stats = h.coordinator.stats();
        assert_eq!(stats.requests, 25);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.renders, 1);
        assert_eq!(h.presenter.rendered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_guilds_refresh_independently() {
        let h = harness();
        h.coordinator.request_refresh("g1");
        h.coordinator.request_refresh("g2");
        sleep(Duration::from_millis(120)).await;

        let rendered = h.presenter.rendered.lock().unwrap();
        let mut guilds: Vec<&str> = rendered.iter().map(|r| r.guild_id.as_str()).collect();
        guilds.sort();
        assert_eq!(guilds, vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn test_render_schedules_wakeup_after_expiry() {
        let h = harness();
        link(&h, "u1").await;
        h.engine.join("g1", "u1").await.unwrap();
        h.engine.mark_afk("g1", "u1").await.unwrap();

        h.coordinator.refresh_now("g1").await;

        let expected = h.clock.now()
            + chrono::Duration::seconds(60)
            + to_chrono(h.coordinator.settings().wakeup_margin);
        assert_eq!(h.coordinator.pending_wakeup("g1"), Some(expected));
        assert_eq!(h.coordinator.stats().wakeups, 1);
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_wakeup_keeps_earliest_deadline() {
        let h = harness();
        link(&h, "u1").await;
        link(&h, "u2").await;
        h.engine.join("g1", "u1").await.unwrap();
        h.engine.join("g1", "u2").await.unwrap();
        h.engine.mark_left("g1", "u1").await.unwrap();

        h.coordinator.refresh_now("g1").await;
        let first = h.coordinator.pending_wakeup("g1").unwrap();

        // An afk deadline 60s out replaces the 120s left deadline
        h.engine.mark_afk("g1", "u2").await.unwrap();
        h.coordinator.refresh_now("g1").await;
        let second = h.coordinator.pending_wakeup("g1").unwrap();
        assert!(second < first);

        // A later deadline does not displace it
        h.clock.advance(Duration::from_secs(1));
        h.coordinator.refresh_now("g1").await;
        assert_eq!(h.coordinator.pending_wakeup("g1"), Some(second));
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_sweep_requests_only_imminent_guilds() {
        let h = harness();
        link(&h, "u1").await;
        link(&h, "u2").await;
        h.engine.join("g1", "u1").await.unwrap();
        h.engine.join("g2", "u2").await.unwrap();
        h.engine.mark_afk("g1", "u1").await.unwrap();

        assert_eq!(h.coordinator.sweep_once().await.unwrap(), 0);

        h.clock.advance(Duration::from_secs(57));
        assert_eq!(h.coordinator.sweep_once().await.unwrap(), 1);
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_refresh() {
        let h = harness();
        h.coordinator.request_refresh("g1");
        h.coordinator.shutdown();
        sleep(Duration::from_millis(80)).await;
        assert_eq!(h.coordinator.stats().cycles, 0);
        assert_eq!(h.coordinator.tracked_guilds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakeup_fires_prunes_and_rerenders() {
        let h = harness();
        link(&h, "u1").await;
        link(&h, "u2").await;
        h.engine.join("g1", "u1").await.unwrap();
        h.engine.join("g1", "u2").await.unwrap();
        h.engine.mark_afk("g1", "u1").await.unwrap();

        h.coordinator.refresh_now("g1").await;
        assert_eq!(h.presenter.rendered.lock().unwrap()[0].len(), 2);
        assert!(h.coordinator.pending_wakeup("g1").is_some());

        // Past the 60s afk window plus the wake-up margin
        h.clock.advance(Duration::from_secs(61));
        tokio::time::advance(Duration::from_secs(61)).await;
        sleep(Duration::from_millis(100)).await;

        let rendered = h.presenter.rendered.lock().unwrap().clone();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[1].len(), 1);
        assert_eq!(rendered[1].position_of("u1"), None);
        assert_eq!(rendered[1].position_of("u2"), Some(1));

        let stats = h.coordinator.stats();
        assert_eq!(stats.pruned, 1);
        assert_eq!(stats.cycles, 2);
        assert_eq!(h.coordinator.pending_wakeup("g1"), None);
        assert!(h.engine.entry("g1", "u1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_refreshes_guild_nearing_expiry() {
        let h = harness();
        link(&h, "u1").await;
        h.engine.join("g1", "u1").await.unwrap();
        h.engine.mark_afk("g1", "u1").await.unwrap();

        let supervisor = tokio::spawn(h.coordinator.clone().run_supervisor());

        // Two sweeps with the deadline a minute away
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.coordinator.stats().requests, 0);
        assert!(h.presenter.rendered.lock().unwrap().is_empty());

        // Three seconds left falls inside the 5s imminent window
        h.clock.advance(Duration::from_secs(57));
        sleep(Duration::from_millis(1000)).await;

        assert!(h.coordinator.stats().requests >= 1);
        let rendered = h.presenter.rendered.lock().unwrap().clone();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].position_of("u1"), Some(1));
        assert!(h.coordinator.pending_wakeup("g1").is_some());

        supervisor.abort();
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_idle_slot_released_after_cycle() {
        let h = harness();
        h.coordinator.request_refresh("g1");
        assert_eq!(h.coordinator.tracked_guilds(), 1);
        sleep(Duration::from_millis(120)).await;

        assert_eq!(h.coordinator.stats().cycles, 1);
        assert_eq!(h.coordinator.tracked_guilds(), 0);

        // A guild with a graced entry keeps its slot for the wake-up
        link(&h, "u1").await;
        h.engine.join("g2", "u1").await.unwrap();
        h.engine.mark_left("g2", "u1").await.unwrap();
        h.coordinator.refresh_now("g2").await;
        assert_eq!(h.coordinator.tracked_guilds(), 1);

        h.coordinator.shutdown();
        assert_eq!(h.coordinator.tracked_guilds(), 0);
    }

    #[tokio::test]
    async fn test_wakeup_covers_entries_beyond_roster_limit() {
        let h = harness_with_limit(1);
        link(&h, "u1").await;
        link(&h, "u2").await;
        h.engine.join("g1", "u1").await.unwrap();
        h.engine.join("g1", "u2").await.unwrap();
        h.engine.mark_afk("g1", "u2").await.unwrap();

        h.coordinator.refresh_now("g1").await;

        let rendered = h.presenter.rendered.lock().unwrap().clone();
        assert_eq!(rendered[0].len(), 1);
        assert_eq!(rendered[0].next_expiry, None);

        let expected = h.clock.now()
            + chrono::Duration::seconds(60)
            + to_chrono(h.coordinator.settings().wakeup_margin);
        assert_eq!(h.coordinator.pending_wakeup("g1"), Some(expected));
        h.coordinator.shutdown();
    }
}
