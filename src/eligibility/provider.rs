//! External eligibility provider
//!
//! Answers membership, ongoing-match and last-result questions about an
//! external account. Any call may be slow or fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::PlayerSeed;
use crate::error::{QueueError, Result};
use crate::types::ExternalId;
use crate::utils::{to_chrono, Clock};

/// Player profile as returned by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub external_id: ExternalId,
    pub nickname: String,
    pub elo: i32,
    pub skill_level: u8,
}

/// Provider contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EligibilityProvider: Send + Sync {
    /// Resolve a nickname; `None` when no such player exists
    async fn get_player_by_nickname(
        &self,
        nickname: &str,
        game: &str,
    ) -> Result<Option<PlayerProfile>>;

    async fn is_member_of_hub(&self, hub_id: &str, external_id: &str) -> Result<bool>;

    /// Whether the player is rostered in a live match of the hub
    async fn player_in_ongoing_hub(&self, hub_id: &str, external_id: &str) -> Result<bool>;

    /// Finish time of the player's latest match if it was a loss that ended within `window`
    async fn last_match_loss_within(
        &self,
        hub_id: &str,
        external_id: &str,
        window: Duration,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// In-memory provider fed by hand; hub ids are ignored
#[derive(Debug)]
pub struct StaticEligibilityProvider {
    players: RwLock<HashMap<String, PlayerProfile>>,
    members: RwLock<HashSet<ExternalId>>,
    ongoing: RwLock<HashSet<ExternalId>>,
    losses: RwLock<HashMap<ExternalId, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl StaticEligibilityProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            players: RwLock::new(HashMap::new()),
            members: RwLock::new(HashSet::new()),
            ongoing: RwLock::new(HashSet::new()),
            losses: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Provider pre-loaded with configured players
    pub fn seeded(clock: Arc<dyn Clock>, seeds: &[PlayerSeed]) -> Result<Self> {
        let provider = Self::new(clock);
        for seed in seeds {
            provider.add_player(
                PlayerProfile {
                    external_id: seed.external_id.trim().to_string(),
                    nickname: seed.nickname.trim().to_string(),
                    elo: seed.elo,
                    skill_level: seed.skill_level,
                },
                seed.member,
            )?;
        }
        Ok(provider)
    }

    pub fn player_count(&self) -> usize {
        self.players.read().map(|players| players.len()).unwrap_or(0)
    }

    /// Register a player and optionally mark them as a hub member
    pub fn add_player(&self, profile: PlayerProfile, member: bool) -> Result<()> {
        if member {
            self.set_member(&profile.external_id, true)?;
        }
        let mut players = self
            .players
            .write()
            .map_err(|_| QueueError::lock("provider players"))?;
        players.insert(profile.nickname.to_lowercase(), profile);
        Ok(())
    }

    pub fn set_member(&self, external_id: &str, member: bool) -> Result<()> {
        let mut members = self
            .members
            .write()
            .map_err(|_| QueueError::lock("provider members"))?;
        if member {
            members.insert(external_id.to_string());
        } else {
            members.remove(external_id);
        }
        Ok(())
    }

    pub fn set_in_match(&self, external_id: &str, in_match: bool) -> Result<()> {
        let mut ongoing = self
            .ongoing
            .write()
            .map_err(|_| QueueError::lock("provider matches"))?;
        if in_match {
            ongoing.insert(external_id.to_string());
        } else {
            ongoing.remove(external_id);
        }
        Ok(())
    }

    /// Record that the player's latest match was a loss finished at `finished_at`
    pub fn record_loss(&self, external_id: &str, finished_at: DateTime<Utc>) -> Result<()> {
        let mut losses = self
            .losses
            .write()
            .map_err(|_| QueueError::lock("provider losses"))?;
        losses.insert(external_id.to_string(), finished_at);
        Ok(())
    }
}

#[async_trait]
impl EligibilityProvider for StaticEligibilityProvider {
    async fn get_player_by_nickname(
        &self,
        nickname: &str,
        _game: &str,
    ) -> Result<Option<PlayerProfile>> {
        let players = self
            .players
            .read()
            .map_err(|_| QueueError::lock("provider players"))?;
        Ok(players.get(&nickname.to_lowercase()).cloned())
    }

    async fn is_member_of_hub(&self, _hub_id: &str, external_id: &str) -> Result<bool> {
        let members = self
            .members
            .read()
            .map_err(|_| QueueError::lock("provider members"))?;
        Ok(members.contains(external_id))
    }

    async fn player_in_ongoing_hub(&self, _hub_id: &str, external_id: &str) -> Result<bool> {
        let ongoing = self
            .ongoing
            .read()
            .map_err(|_| QueueError::lock("provider matches"))?;
        Ok(ongoing.contains(external_id))
    }

    async fn last_match_loss_within(
        &self,
        _hub_id: &str,
        external_id: &str,
        window: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let cutoff = self.clock.now() - to_chrono(window);
        let losses = self
            .losses
            .read()
            .map_err(|_| QueueError::lock("provider losses"))?;
        Ok(losses
            .get(external_id)
            .copied()
            .filter(|finished| *finished > cutoff))
    }
}
