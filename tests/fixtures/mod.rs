//! Test fixtures shared by the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use queue_keeper::amqp::MockEventPublisher;
use queue_keeper::config::AppConfig;
use queue_keeper::eligibility::{EligibilityProvider, PlayerProfile, StaticEligibilityProvider};
use queue_keeper::error::{QueueError, Result};
use queue_keeper::link::UserLink;
use queue_keeper::metrics::MetricsCollector;
use queue_keeper::refresh::RosterPresenter;
use queue_keeper::service::{Collaborators, QueueComponents};
use queue_keeper::types::RosterSnapshot;
use queue_keeper::utils::{Clock, ManualClock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed starting instant for manual clocks
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap()
}

/// Configuration tuned for fast tests: short debounce, 60s afk and 120s left grace
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.queue.debounce_ms = 20;
    config.queue.render_timeout_ms = 200;
    config.eligibility.step_timeout_ms = 200;
    config.eligibility.validation_deadline_ms = 1_000;
    config.eligibility.workers = 2;
    config.policy_defaults.afk_timeout_secs = 60;
    config.policy_defaults.left_timeout_secs = 120;
    config
}

/// Provider wrapping the static one that can be switched into failure or slowness
#[derive(Debug)]
pub struct FlakyProvider {
    inner: StaticEligibilityProvider,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FlakyProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: StaticEligibilityProvider::new(clock),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn players(&self) -> &StaticEligibilityProvider {
        &self.inner
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::ProviderError {
                operation: operation.to_string(),
                message: "provider unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl EligibilityProvider for FlakyProvider {
    async fn get_player_by_nickname(
        &self,
        nickname: &str,
        game: &str,
    ) -> Result<Option<PlayerProfile>> {
        self.enter("get_player_by_nickname").await?;
        self.inner.get_player_by_nickname(nickname, game).await
    }

    async fn is_member_of_hub(&self, hub_id: &str, external_id: &str) -> Result<bool> {
        self.enter("is_member_of_hub").await?;
        self.inner.is_member_of_hub(hub_id, external_id).await
    }

    async fn player_in_ongoing_hub(&self, hub_id: &str, external_id: &str) -> Result<bool> {
        self.enter("player_in_ongoing_hub").await?;
        self.inner.player_in_ongoing_hub(hub_id, external_id).await
    }

    async fn last_match_loss_within(
        &self,
        hub_id: &str,
        external_id: &str,
        window: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        self.enter("last_match_loss_within").await?;
        self.inner
            .last_match_loss_within(hub_id, external_id, window)
            .await
    }
}

/// Presenter that records every roster, optionally stalling or failing per guild
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    renders: Mutex<Vec<RosterSnapshot>>,
    slow_guilds: Mutex<HashSet<String>>,
    slow_delay: Mutex<Duration>,
    failing: AtomicBool,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stall_guild(&self, guild_id: &str, delay: Duration) {
        self.slow_guilds.lock().unwrap().insert(guild_id.to_string());
        *self.slow_delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn renders(&self) -> Vec<RosterSnapshot> {
        self.renders.lock().unwrap().clone()
    }

    pub fn renders_for(&self, guild_id: &str) -> Vec<RosterSnapshot> {
        self.renders()
            .into_iter()
            .filter(|r| r.guild_id == guild_id)
            .collect()
    }
}

#[async_trait]
impl RosterPresenter for RecordingPresenter {
    async fn render(&self, roster: &RosterSnapshot) -> Result<()> {
        let stalled = self.slow_guilds.lock().unwrap().contains(&roster.guild_id);
        if stalled {
            let delay = *self.slow_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::InternalError {
                message: "message edit rejected".to_string(),
            }
            .into());
        }
        self.renders.lock().unwrap().push(roster.clone());
        Ok(())
    }
}

/// Fully assembled queue core on in-memory stores and a manual clock
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub provider: Arc<FlakyProvider>,
    pub events: Arc<MockEventPublisher>,
    pub presenter: Arc<RecordingPresenter>,
    pub components: QueueComponents,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let provider = Arc::new(FlakyProvider::new(clock.clone()));
        let events = Arc::new(MockEventPublisher::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let components = QueueComponents::assemble(
            &config,
            Collaborators {
                clock: clock.clone(),
                provider: provider.clone(),
                presenter: presenter.clone(),
                notifier: events.clone(),
                metrics: Arc::new(MetricsCollector::new().unwrap()),
            },
        );
        Self {
            clock,
            provider,
            events,
            presenter,
            components,
        }
    }

    /// Link `user_id` to `ext-<user_id>` and register the account with the provider
    pub async fn link(&self, user_id: &str, member: bool) {
        let external_id = format!("ext-{}", user_id);
        self.provider
            .players()
            .add_player(
                PlayerProfile {
                    external_id: external_id.clone(),
                    nickname: user_id.to_string(),
                    elo: 1200,
                    skill_level: 5,
                },
                member,
            )
            .unwrap();
        self.components
            .link_store
            .upsert_link(UserLink::new(user_id, external_id, user_id, self.clock.now()))
            .await
            .unwrap();
    }

    pub fn advance_secs(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Poll `check` until it holds or two seconds pass
    pub async fn eventually<F>(&self, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.components.shutdown();
    }
}
