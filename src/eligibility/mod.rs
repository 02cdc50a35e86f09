//! Eligibility checks for queued users
//!
//! Admission is optimistic: a join is written first and validated afterwards
//! by the [`EligibilityChain`], run on a bounded worker pool
//! ([`EligibilityValidator`]). Provider failures are inconclusive and never
//! deny; only a definitive answer produces a denial.

pub mod chain;
pub mod provider;
pub mod validator;

pub use chain::{ChainSettings, EligibilityChain};
pub use provider::{EligibilityProvider, PlayerProfile, StaticEligibilityProvider};
pub use validator::{
    EligibilityValidator, OutcomeDispatcher, ValidationOutcome, ValidationResult,
    ValidatorSettings,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::types::{EligibilityDenied, GuildId, UserId};
use crate::utils::format_remaining;

/// Checks performed by the chain, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStep {
    OngoingMatch,
    LossCooldown,
    Membership,
    Rating,
}

impl CheckStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStep::OngoingMatch => "ongoing_match",
            CheckStep::LossCooldown => "loss_cooldown",
            CheckStep::Membership => "membership",
            CheckStep::Rating => "rating",
        }
    }
}

/// Result of an eligibility evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Eligible,
    InOngoingMatch,
    LossCooldown { remaining: Duration },
    NotMember,
}

impl Verdict {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Verdict::Eligible)
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Eligible => "eligible",
            Verdict::InOngoingMatch => "ongoing_match",
            Verdict::LossCooldown { .. } => "loss_cooldown",
            Verdict::NotMember => "not_member",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Verdict::LossCooldown { remaining } => Some(*remaining),
            _ => None,
        }
    }

    /// Message shown to the user
    pub fn reason(&self) -> String {
        match self {
            Verdict::Eligible => "You are eligible to play.".to_string(),
            Verdict::InOngoingMatch => "You are currently in an ongoing hub match.".to_string(),
            Verdict::LossCooldown { remaining } => format!(
                "You lost your last match. Wait {} before queueing again.",
                format_remaining(*remaining)
            ),
            Verdict::NotMember => "You are not a member of the hub.".to_string(),
        }
    }
}

/// Verdict plus the steps that could not be answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub verdict: Verdict,
    pub inconclusive: Vec<CheckStep>,
}

impl EligibilityReport {
    pub fn new(guild_id: &str, user_id: &str) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            verdict: Verdict::Eligible,
            inconclusive: Vec::new(),
        }
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self
    }
}

/// Delivers denial notices to users
#[async_trait]
pub trait EligibilityNotifier: Send + Sync {
    async fn notify_denied(&self, notice: &EligibilityDenied) -> Result<()>;
}

/// Notifier that only logs, used when no transport is wired
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl EligibilityNotifier for LoggingNotifier {
    async fn notify_denied(&self, notice: &EligibilityDenied) -> Result<()> {
        tracing::info!(
            "Eligibility denied for user '{}' in guild '{}': {}",
            notice.user_id,
            notice.guild_id,
            notice.reason
        );
        Ok(())
    }
}
