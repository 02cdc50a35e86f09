//! Account linking
//!
//! Unlike the eligibility chain, this path is synchronous with the user's
//! command: provider failures propagate so the caller can ask for a retry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::eligibility::{ChainSettings, EligibilityProvider, PlayerProfile};
use crate::error::{QueueError, Result};
use crate::store::LinkStore;
use crate::types::{ExternalId, UserId};
use crate::utils::Clock;

use super::{RatingSnapshot, Snapshot, UserLink};

/// Result of a link request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked { nickname: String, is_member: bool },
    /// Already bound to the same account; membership re-checked
    Revalidated { nickname: String, is_member: bool },
    /// Bound to a different account; unlink first
    AlreadyLinkedElsewhere { nickname: String },
    /// The account belongs to another user
    AccountTaken { nickname: String },
    PlayerNotFound { nickname: String },
}

impl fmt::Display for LinkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let membership = |is_member: bool| {
            if is_member {
                "hub member"
            } else {
                "not a hub member"
            }
        };
        match self {
            LinkOutcome::Linked {
                nickname,
                is_member,
            } => write!(f, "Linked to {} ({}).", nickname, membership(*is_member)),
            LinkOutcome::Revalidated {
                nickname,
                is_member,
            } => write!(
                f,
                "Already linked to {}; membership re-checked ({}).",
                nickname,
                membership(*is_member)
            ),
            LinkOutcome::AlreadyLinkedElsewhere { nickname } => write!(
                f,
                "You are linked to {}. Unlink before linking another account.",
                nickname
            ),
            LinkOutcome::AccountTaken { nickname } => {
                write!(f, "{} is already linked to another user.", nickname)
            }
            LinkOutcome::PlayerNotFound { nickname } => {
                write!(f, "No player named {} was found.", nickname)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Unlinked,
    NotLinked,
}

impl fmt::Display for UnlinkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlinkOutcome::Unlinked => f.write_str("Your account was unlinked."),
            UnlinkOutcome::NotLinked => f.write_str("You have no linked account."),
        }
    }
}

/// Owns the lifecycle of [`UserLink`] records
#[derive(Clone)]
pub struct LinkService {
    links: Arc<dyn LinkStore>,
    provider: Arc<dyn EligibilityProvider>,
    clock: Arc<dyn Clock>,
    settings: ChainSettings,
}

impl LinkService {
    pub fn new(
        links: Arc<dyn LinkStore>,
        provider: Arc<dyn EligibilityProvider>,
        clock: Arc<dyn Clock>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            links,
            provider,
            clock,
            settings,
        }
    }

    async fn call<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(self.settings.step_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(QueueError::ProviderError {
                operation: operation.to_string(),
                message: e.to_string(),
            }
            .into()),
            Err(_) => Err(QueueError::ProviderTimeout {
                operation: operation.to_string(),
            }
            .into()),
        }
    }

    pub async fn link(&self, user_id: &str, nickname: &str) -> Result<LinkOutcome> {
        let Some(profile) = self.describe_player(nickname).await? else {
            return Ok(LinkOutcome::PlayerNotFound {
                nickname: nickname.to_string(),
            });
        };

        let existing = self.links.get_by_user(user_id).await?;
        if let Some(current) = &existing {
            if current.external_id != profile.external_id {
                return Ok(LinkOutcome::AlreadyLinkedElsewhere {
                    nickname: current.nickname.clone(),
                });
            }
        }

        let is_member = self
            .call(
                "membership",
                self.provider
                    .is_member_of_hub(&self.settings.hub_id, &profile.external_id),
            )
            .await?;
        let now = self.clock.now();
        let rating = Snapshot::new(
            RatingSnapshot {
                elo: profile.elo,
                skill_level: profile.skill_level,
            },
            now,
        );

        if existing.is_some() {
            self.links
                .update_membership(&profile.external_id, is_member, now)
                .await?;
            self.links
                .update_rating(&profile.external_id, rating)
                .await?;
            debug!(
                "Revalidated link for '{}' ({}): member={}",
                user_id, profile.nickname, is_member
            );
            return Ok(LinkOutcome::Revalidated {
                nickname: profile.nickname,
                is_member,
            });
        }

        let mut link = UserLink::new(
            user_id,
            profile.external_id.clone(),
            profile.nickname.clone(),
            now,
        );
        link.membership = Some(Snapshot::new(is_member, now));
        link.rating = Some(rating);

        if let Err(e) = self.links.upsert_link(link).await {
            if let Some(QueueError::ConstraintViolation { .. }) = e.downcast_ref::<QueueError>() {
                return Ok(LinkOutcome::AccountTaken {
                    nickname: profile.nickname,
                });
            }
            return Err(e);
        }

        info!(
            "Linked user '{}' to '{}' ({}), member={}",
            user_id, profile.nickname, profile.external_id, is_member
        );
        Ok(LinkOutcome::Linked {
            nickname: profile.nickname,
            is_member,
        })
    }

    pub async fn unlink(&self, user_id: &str) -> Result<UnlinkOutcome> {
        if self.links.soft_delete_by_user(user_id).await? {
            info!("Unlinked user '{}'", user_id);
            Ok(UnlinkOutcome::Unlinked)
        } else {
            Ok(UnlinkOutcome::NotLinked)
        }
    }

    pub async fn whoami(&self, user_id: &str) -> Result<Option<UserLink>> {
        self.links.get_by_user(user_id).await
    }

    /// Provider profile for a nickname
    pub async fn describe_player(&self, nickname: &str) -> Result<Option<PlayerProfile>> {
        self.call(
            "player_lookup",
            self.provider
                .get_player_by_nickname(nickname, &self.settings.game),
        )
        .await
    }

    /// Map external account ids (e.g. a match roster) back to platform users
    pub async fn resolve_platform_ids(
        &self,
        external_ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, UserId>> {
        self.links.find_users_by_external_ids(external_ids).await
    }
}

/// Text for the whoami command
pub fn describe_link(link: Option<&UserLink>) -> String {
    let Some(link) = link else {
        return UnlinkOutcome::NotLinked.to_string();
    };
    let membership = match link.is_member() {
        Some(true) => "member",
        Some(false) => "not a member",
        None => "membership unknown",
    };
    match (link.skill_level(), link.elo()) {
        (Some(level), Some(elo)) => format!(
            "Linked to {} (level {}, {} elo, {}).",
            link.nickname, level, elo, membership
        ),
        _ => format!("Linked to {} ({}).", link.nickname, membership),
    }
}
