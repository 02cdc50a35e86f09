//! Queue engine
//!
//! State machine over absent, waiting, afk and left. Join is optimistic: the
//! row is written first and eligibility is validated afterwards on the
//! worker pool. Synchronous paths only fail on storage errors.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{LevelBadges, QueueSettings};
use crate::eligibility::{EligibilityChain, EligibilityReport, EligibilityValidator};
use crate::error::{QueueError, Result};
use crate::link::UserLink;
use crate::metrics::MetricsCollector;
use crate::policy::PolicyService;
use crate::store::{LinkStore, QueueStore};
use crate::types::{
    EntryStatus, GraceWindows, GuildId, PresenceTransition, PruneCounts, QueueEntry, RosterEntry,
    RosterSnapshot,
};
use crate::utils::{format_remaining, remaining_until, Clock};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub roster_limit: usize,
    /// Entries this close to removal get a countdown caption
    pub imminent_window: Duration,
}

impl EngineSettings {
    pub fn from_config(settings: &QueueSettings) -> Self {
        Self {
            roster_limit: settings.roster_limit,
            imminent_window: Duration::from_secs(settings.imminent_window_secs),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&QueueSettings::default())
    }
}

/// Result of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Already queued; status reset to waiting, original spot kept
    Refreshed,
    NotLinked,
}

impl JoinOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JoinOutcome::Joined => "joined",
            JoinOutcome::Refreshed => "refreshed",
            JoinOutcome::NotLinked => "not_linked",
        }
    }

    pub fn is_queued(&self) -> bool {
        !matches!(self, JoinOutcome::NotLinked)
    }
}

impl fmt::Display for JoinOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinOutcome::Joined => f.write_str("You joined the queue."),
            JoinOutcome::Refreshed => {
                f.write_str("You are already in the queue; your spot is kept.")
            }
            JoinOutcome::NotLinked => {
                f.write_str("Link your account first with the link command.")
            }
        }
    }
}

/// Result of a leave or kick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    NotInQueue,
}

impl fmt::Display for LeaveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaveOutcome::Left => f.write_str("Removed from the queue."),
            LeaveOutcome::NotInQueue => f.write_str("Not in the queue."),
        }
    }
}

/// Entry point for every queue mutation and listing
#[derive(Clone)]
pub struct QueueEngine {
    store: Arc<dyn QueueStore>,
    links: Arc<dyn LinkStore>,
    policies: PolicyService,
    chain: Option<Arc<EligibilityChain>>,
    validator: Option<EligibilityValidator>,
    badges: Arc<LevelBadges>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    settings: EngineSettings,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn QueueStore>,
        links: Arc<dyn LinkStore>,
        policies: PolicyService,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            links,
            policies,
            chain: None,
            validator: None,
            badges: Arc::new(LevelBadges::default()),
            clock,
            metrics,
            settings,
        }
    }

    pub fn with_badges(mut self, badges: Arc<LevelBadges>) -> Self {
        self.badges = badges;
        self
    }

    /// Attach the chain for on-demand checks and the pool that validates joins
    pub fn with_eligibility(
        mut self,
        chain: Arc<EligibilityChain>,
        validator: EligibilityValidator,
    ) -> Self {
        self.chain = Some(chain);
        self.validator = Some(validator);
        self
    }

    pub fn policies(&self) -> &PolicyService {
        &self.policies
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Admit a linked user as waiting, then queue a background eligibility check
    pub async fn join(&self, guild_id: &str, user_id: &str) -> Result<JoinOutcome> {
        let Some(link) = self.links.get_by_user(user_id).await? else {
            info!(
                "Join refused for unlinked user '{}' in guild '{}'",
                user_id, guild_id
            );
            self.metrics.record_join(JoinOutcome::NotLinked.label());
            return Ok(JoinOutcome::NotLinked);
        };

        let entry = QueueEntry::waiting(
            guild_id,
            user_id,
            link.external_id.clone(),
            link.nickname.clone(),
            self.clock.now(),
        );
        let existed = self.store.join(entry).await?;
        let outcome = if existed {
            JoinOutcome::Refreshed
        } else {
            JoinOutcome::Joined
        };

        if let Some(validator) = &self.validator {
            validator.submit(guild_id, user_id);
        }

        info!(
            "User '{}' {} queue of guild '{}'",
            user_id,
            if existed { "refreshed in" } else { "joined" },
            guild_id
        );
        self.metrics.record_join(outcome.label());
        Ok(outcome)
    }

    /// Delete the entry; a missing row is not an error
    pub async fn leave(&self, guild_id: &str, user_id: &str) -> Result<LeaveOutcome> {
        let existed = self.store.leave(guild_id, user_id).await?;
        self.metrics.record_leave(existed);
        if existed {
            info!("User '{}' left queue of guild '{}'", user_id, guild_id);
            Ok(LeaveOutcome::Left)
        } else {
            debug!(
                "Leave for '{}' in guild '{}' found no entry",
                user_id, guild_id
            );
            Ok(LeaveOutcome::NotInQueue)
        }
    }

    pub async fn touch_valid(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        self.apply_presence(guild_id, user_id, PresenceTransition::TouchValid)
            .await
    }

    pub async fn mark_afk(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        self.apply_presence(guild_id, user_id, PresenceTransition::MarkAfk)
            .await
    }

    pub async fn mark_left(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        self.apply_presence(guild_id, user_id, PresenceTransition::MarkLeft)
            .await
    }

    /// Apply a presence transition; false when there is no row or the move is a no-op
    pub async fn apply_presence(
        &self,
        guild_id: &str,
        user_id: &str,
        transition: PresenceTransition,
    ) -> Result<bool> {
        let applied = self
            .store
            .transition(guild_id, user_id, transition)
            .await?;
        self.metrics.record_presence(transition.as_str(), applied);
        if applied {
            debug!(
                "User '{}' in guild '{}' is now {}",
                user_id,
                guild_id,
                transition.target()
            );
        }
        Ok(applied)
    }

    /// Prune with the guild's current grace windows
    pub async fn prune(&self, guild_id: &str) -> Result<PruneCounts> {
        let grace = self.policies.grace_windows(guild_id).await;
        self.prune_with(guild_id, grace).await
    }

    pub async fn prune_with(&self, guild_id: &str, grace: GraceWindows) -> Result<PruneCounts> {
        let counts = self.store.prune(guild_id, grace).await?;
        if counts.total() > 0 {
            info!(
                "Pruned {} afk and {} left entries from guild '{}'",
                counts.afk, counts.left, guild_id
            );
            self.metrics.record_prune(&counts);
        }
        Ok(counts)
    }

    pub async fn list(&self, guild_id: &str, limit: usize) -> Result<Vec<QueueEntry>> {
        self.store.list(guild_id, limit).await
    }

    pub async fn list_with_grace(
        &self,
        guild_id: &str,
        limit: usize,
        grace: GraceWindows,
    ) -> Result<Vec<QueueEntry>> {
        self.store.list_with_grace(guild_id, limit, grace).await
    }

    pub async fn grace_windows(&self, guild_id: &str) -> GraceWindows {
        self.policies.grace_windows(guild_id).await
    }

    /// Earliest grace deadline in the guild, including rows already due for pruning
    pub async fn next_expiry(&self, guild_id: &str) -> Result<Option<DateTime<Utc>>> {
        let grace = self.policies.grace_windows(guild_id).await;
        self.store.next_expiry(guild_id, grace).await
    }

    pub async fn active_guilds(&self) -> Result<Vec<GuildId>> {
        self.store.guilds().await
    }

    pub async fn entry(&self, guild_id: &str, user_id: &str) -> Result<QueueEntry> {
        self.store
            .get(guild_id, user_id)
            .await?
            .ok_or_else(|| {
                QueueError::NotFound {
                    guild_id: guild_id.to_string(),
                    user_id: user_id.to_string(),
                }
                .into()
            })
    }

    /// 1-based place among the entries currently shown
    pub async fn position(&self, guild_id: &str, user_id: &str) -> Result<Option<usize>> {
        let grace = self.policies.grace_windows(guild_id).await;
        let visible = self
            .store
            .list_with_grace(guild_id, usize::MAX, grace)
            .await?;
        Ok(visible
            .iter()
            .position(|e| e.user_id == user_id)
            .map(|i| i + 1))
    }

    /// Ordered, enriched roster for presentation
    pub async fn roster(&self, guild_id: &str) -> Result<RosterSnapshot> {
        let grace = self.policies.grace_windows(guild_id).await;
        let now = self.clock.now();
        let rows = self
            .store
            .list_with_grace(guild_id, self.settings.roster_limit, grace)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            let link = self.lookup_link(&row.user_id).await;
            entries.push(self.roster_entry(index + 1, row, link.as_ref(), &grace, now));
        }
        let next_expiry = entries.iter().filter_map(|e| e.expires_at).min();

        Ok(RosterSnapshot {
            guild_id: guild_id.to_string(),
            generated_at: now,
            afk_grace_secs: grace.afk.as_secs(),
            left_grace_secs: grace.left.as_secs(),
            entries,
            next_expiry,
        })
    }

    async fn lookup_link(&self, user_id: &str) -> Option<UserLink> {
        match self.links.get_by_user(user_id).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not load link for '{}' while listing: {}", user_id, e);
                None
            }
        }
    }

    fn roster_entry(
        &self,
        position: usize,
        row: QueueEntry,
        link: Option<&UserLink>,
        grace: &GraceWindows,
        now: DateTime<Utc>,
    ) -> RosterEntry {
        let expires_at = row.expires_at(grace);
        let countdown = expires_at
            .map(|deadline| remaining_until(deadline, now))
            .filter(|remaining| *remaining <= self.settings.imminent_window)
            .map(format_remaining);
        let skill_level = link.and_then(UserLink::skill_level);
        let badge = skill_level
            .and_then(|level| self.badges.badge(level))
            .map(str::to_string);
        let display_name = link
            .map(|l| l.nickname.clone())
            .unwrap_or(row.display_name);

        RosterEntry {
            position,
            user_id: row.user_id,
            external_id: row.external_id,
            display_name,
            status: row.status,
            joined_at: row.joined_at,
            last_seen_at: row.last_seen_at,
            expires_at,
            skill_level,
            badge,
            countdown,
        }
    }

    /// Run the eligibility chain on demand; never gates a join
    pub async fn check_eligibility(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<EligibilityReport> {
        let chain = self.chain.as_ref().ok_or_else(|| QueueError::InternalError {
            message: "eligibility checks are not configured".to_string(),
        })?;
        chain.evaluate(guild_id, user_id).await
    }
}

/// Plain-text roster used by the status command
pub fn describe_roster(roster: &RosterSnapshot) -> String {
    if roster.is_empty() {
        return "The queue is empty.".to_string();
    }

    let mut lines = vec![format!("Queue ({} players):", roster.len())];
    for entry in &roster.entries {
        let mut line = format!("{}. ", entry.position);
        if let Some(badge) = &entry.badge {
            line.push_str(badge);
            line.push(' ');
        }
        line.push_str(&entry.display_name);
        match (entry.status, &entry.countdown) {
            (EntryStatus::Waiting, _) => {}
            (status, Some(countdown)) => {
                line.push_str(&format!(" ({}, removed in {})", status, countdown))
            }
            (status, None) => line.push_str(&format!(" ({})", status)),
        }
        lines.push(line);
    }
    lines.join("\n")
}
