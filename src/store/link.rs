//! Identity link storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{QueueError, Result};
use crate::link::{RatingSnapshot, Snapshot, UserLink};
use crate::types::{ExternalId, UserId};
use crate::utils::Clock;

/// Storage contract for user links; soft-deleted links are invisible to reads
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn get_by_user(&self, user_id: &str) -> Result<Option<UserLink>>;

    /// Insert or replace the active link for `link.user_id`.
    ///
    /// Fails with `ConstraintViolation` when the user is actively bound to a
    /// different external account, or the external account to a different user.
    async fn upsert_link(&self, link: UserLink) -> Result<()>;

    /// Soft delete; returns whether an active link existed
    async fn soft_delete_by_user(&self, user_id: &str) -> Result<bool>;

    /// Map external account ids back to platform users for active links
    async fn find_users_by_external_ids(
        &self,
        external_ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, UserId>>;

    /// Record a membership observation; returns whether an active link matched
    async fn update_membership(
        &self,
        external_id: &str,
        is_member: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a rating observation; returns whether an active link matched
    async fn update_rating(
        &self,
        external_id: &str,
        rating: Snapshot<RatingSnapshot>,
    ) -> Result<bool>;
}

/// In-memory link store, keyed by platform user
#[derive(Debug)]
pub struct InMemoryLinkStore {
    links: RwLock<HashMap<UserId, UserLink>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLinkStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl LinkStore for InMemoryLinkStore {
    async fn get_by_user(&self, user_id: &str) -> Result<Option<UserLink>> {
        let links = self.links.read().map_err(|_| QueueError::lock("link"))?;
        Ok(links.get(user_id).filter(|l| l.is_active()).cloned())
    }

    async fn upsert_link(&self, link: UserLink) -> Result<()> {
        let mut links = self.links.write().map_err(|_| QueueError::lock("link"))?;

        if let Some(current) = links.get(&link.user_id).filter(|l| l.is_active()) {
            if current.external_id != link.external_id {
                return Err(QueueError::ConstraintViolation {
                    message: format!(
                        "user {} is already linked to {}",
                        link.user_id, current.external_id
                    ),
                }
                .into());
            }
        }
        let taken = links.values().any(|other| {
            other.is_active()
                && other.external_id == link.external_id
                && other.user_id != link.user_id
        });
        if taken {
            return Err(QueueError::ConstraintViolation {
                message: format!("external account {} is linked to another user", link.external_id),
            }
            .into());
        }

        let mut link = link;
        link.deleted_at = None;
        links.insert(link.user_id.clone(), link);
        Ok(())
    }

    async fn soft_delete_by_user(&self, user_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut links = self.links.write().map_err(|_| QueueError::lock("link"))?;
        match links.get_mut(user_id).filter(|l| l.is_active()) {
            Some(link) => {
                link.deleted_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_users_by_external_ids(
        &self,
        external_ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, UserId>> {
        let links = self.links.read().map_err(|_| QueueError::lock("link"))?;
        Ok(links
            .values()
            .filter(|l| l.is_active() && external_ids.contains(&l.external_id))
            .map(|l| (l.external_id.clone(), l.user_id.clone()))
            .collect())
    }

    async fn update_membership(
        &self,
        external_id: &str,
        is_member: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut links = self.links.write().map_err(|_| QueueError::lock("link"))?;
        let mut matched = false;
        for link in links
            .values_mut()
            .filter(|l| l.is_active() && l.external_id == external_id)
        {
            link.membership = Some(Snapshot::new(is_member, checked_at));
            matched = true;
        }
        Ok(matched)
    }

    async fn update_rating(
        &self,
        external_id: &str,
        rating: Snapshot<RatingSnapshot>,
    ) -> Result<bool> {
        let mut links = self.links.write().map_err(|_| QueueError::lock("link"))?;
        let mut matched = false;
        for link in links
            .values_mut()
            .filter(|l| l.is_active() && l.external_id == external_id)
        {
            link.rating = Some(rating);
            matched = true;
        }
        Ok(matched)
    }
}
