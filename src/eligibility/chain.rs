//! Sequential eligibility checks
//!
//! Order: ongoing match, loss cooldown, then hub membership when the guild
//! requires it. The first definitive failure short-circuits. Each provider
//! call runs under its own timeout; an error or timeout marks the step
//! inconclusive and the chain moves on.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::EligibilitySettings;
use crate::error::{QueueError, Result};
use crate::link::{needs_refresh, RatingSnapshot, Snapshot, UserLink};
use crate::policy::PolicyService;
use crate::store::LinkStore;
use crate::utils::{remaining_until, to_chrono, Clock};

use super::{CheckStep, EligibilityProvider, EligibilityReport, Verdict};

/// Tunables for the chain
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub hub_id: String,
    pub game: String,
    pub step_timeout: Duration,
    pub member_stale: Duration,
    pub rating_stale: Duration,
    pub default_cooldown: Duration,
}

impl ChainSettings {
    pub fn from_config(settings: &EligibilitySettings) -> Self {
        Self {
            hub_id: settings.hub_id.clone(),
            game: settings.game.clone(),
            step_timeout: Duration::from_millis(settings.step_timeout_ms),
            member_stale: Duration::from_secs(settings.member_stale_secs),
            rating_stale: Duration::from_secs(settings.rating_stale_secs),
            default_cooldown: Duration::from_secs(settings.default_cooldown_secs),
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self::from_config(&EligibilitySettings::default())
    }
}

pub struct EligibilityChain {
    provider: Arc<dyn EligibilityProvider>,
    links: Arc<dyn LinkStore>,
    policies: PolicyService,
    clock: Arc<dyn Clock>,
    settings: ChainSettings,
}

impl EligibilityChain {
    pub fn new(
        provider: Arc<dyn EligibilityProvider>,
        links: Arc<dyn LinkStore>,
        policies: PolicyService,
        clock: Arc<dyn Clock>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            provider,
            links,
            policies,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Run the chain for a linked user.
    ///
    /// Fails with `NotLinked` when the user has no active link and propagates
    /// link-store read failures. Provider failures never fail the call.
    pub async fn evaluate(&self, guild_id: &str, user_id: &str) -> Result<EligibilityReport> {
        let started = Instant::now();
        let link = self
            .links
            .get_by_user(user_id)
            .await?
            .ok_or_else(|| QueueError::NotLinked {
                user_id: user_id.to_string(),
            })?;
        let policy = self.policies.effective_policy(guild_id).await;
        let mut report = EligibilityReport::new(guild_id, user_id);

        let verdict = match self.check_ongoing_match(&link, &mut report).await {
            Some(verdict) => verdict,
            None => {
                let cooldown = policy.loss_cooldown(self.settings.default_cooldown);
                match self.check_loss_cooldown(&link, cooldown, &mut report).await {
                    Some(verdict) => verdict,
                    None if policy.require_member => {
                        self.check_membership(&link, &mut report).await
                    }
                    None => Verdict::Eligible,
                }
            }
        };

        debug!(
            "Eligibility for user '{}' in guild '{}': {} (inconclusive: {:?}, {:.2}ms)",
            user_id,
            guild_id,
            verdict.label(),
            report.inconclusive,
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(report.with_verdict(verdict))
    }

    async fn step<T>(
        &self,
        step: CheckStep,
        call: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, QueueError> {
        match timeout(self.settings.step_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(QueueError::ProviderError {
                operation: step.as_str().to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(QueueError::ProviderTimeout {
                operation: step.as_str().to_string(),
            }),
        }
    }

    fn inconclusive(report: &mut EligibilityReport, step: CheckStep, err: &QueueError) {
        warn!(
            "Eligibility step '{}' inconclusive for user '{}': {}; continuing",
            step.as_str(),
            report.user_id,
            err
        );
        report.inconclusive.push(step);
    }

    async fn check_ongoing_match(
        &self,
        link: &UserLink,
        report: &mut EligibilityReport,
    ) -> Option<Verdict> {
        let call = self
            .provider
            .player_in_ongoing_hub(&self.settings.hub_id, &link.external_id);
        match self.step(CheckStep::OngoingMatch, call).await {
            Ok(true) => Some(Verdict::InOngoingMatch),
            Ok(false) => None,
            Err(e) => {
                Self::inconclusive(report, CheckStep::OngoingMatch, &e);
                None
            }
        }
    }

    async fn check_loss_cooldown(
        &self,
        link: &UserLink,
        cooldown: Duration,
        report: &mut EligibilityReport,
    ) -> Option<Verdict> {
        let call = self.provider.last_match_loss_within(
            &self.settings.hub_id,
            &link.external_id,
            cooldown,
        );
        match self.step(CheckStep::LossCooldown, call).await {
            Ok(Some(finished_at)) => {
                let remaining =
                    remaining_until(finished_at + to_chrono(cooldown), self.clock.now());
                (!remaining.is_zero()).then_some(Verdict::LossCooldown { remaining })
            }
            Ok(None) => None,
            Err(e) => {
                Self::inconclusive(report, CheckStep::LossCooldown, &e);
                None
            }
        }
    }

    /// Membership uses the stored snapshot while it is fresh. A stale or
    /// missing snapshot is refreshed from the provider and persisted; if the
    /// refresh fails the previous snapshot decides, and with none the step
    /// is inconclusive.
    async fn check_membership(&self, link: &UserLink, report: &mut EligibilityReport) -> Verdict {
        let now = self.clock.now();
        let member = if needs_refresh(link.membership.as_ref(), now, self.settings.member_stale) {
            let call = self
                .provider
                .is_member_of_hub(&self.settings.hub_id, &link.external_id);
            match self.step(CheckStep::Membership, call).await {
                Ok(fresh) => {
                    self.persist_membership(link, fresh).await;
                    self.refresh_rating_if_stale(link, report).await;
                    Some(fresh)
                }
                Err(e) => {
                    Self::inconclusive(report, CheckStep::Membership, &e);
                    link.is_member()
                }
            }
        } else {
            link.is_member()
        };

        match member {
            Some(false) => Verdict::NotMember,
            _ => Verdict::Eligible,
        }
    }

    async fn persist_membership(&self, link: &UserLink, is_member: bool) {
        let now = self.clock.now();
        if let Err(e) = self
            .links
            .update_membership(&link.external_id, is_member, now)
            .await
        {
            warn!(
                "Failed to persist membership snapshot for '{}': {}",
                link.user_id, e
            );
        }
    }

    async fn refresh_rating_if_stale(&self, link: &UserLink, report: &mut EligibilityReport) {
        let now = self.clock.now();
        if !needs_refresh(link.rating.as_ref(), now, self.settings.rating_stale) {
            return;
        }

        let call = self
            .provider
            .get_player_by_nickname(&link.nickname, &self.settings.game);
        match self.step(CheckStep::Rating, call).await {
            Ok(Some(profile)) => {
                let snapshot = Snapshot::new(
                    RatingSnapshot {
                        elo: profile.elo,
                        skill_level: profile.skill_level,
                    },
                    now,
                );
                if let Err(e) = self.links.update_rating(&link.external_id, snapshot).await {
                    warn!("Failed to persist rating snapshot for '{}': {}", link.user_id, e);
                }
            }
            Ok(None) => debug!("No provider profile for nickname '{}'", link.nickname),
            Err(e) => Self::inconclusive(report, CheckStep::Rating, &e),
        }
    }
}
