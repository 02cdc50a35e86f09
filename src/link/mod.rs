//! Identity links between platform users and external accounts
//!
//! A [`UserLink`] carries membership and rating snapshots, each paired with
//! the instant it was taken so staleness is a plain predicate.

pub mod service;

pub use service::{describe_link, LinkOutcome, LinkService, UnlinkOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{ExternalId, UserId};
use crate::utils::to_chrono;

/// A value observed from the provider at `checked_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    pub value: T,
    pub checked_at: DateTime<Utc>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T, checked_at: DateTime<Utc>) -> Self {
        Self { value, checked_at }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.checked_at
    }

    /// True when the snapshot is older than `max_age`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > to_chrono(max_age)
    }
}

/// Whether an optional snapshot has to be fetched again
pub fn needs_refresh<T>(snapshot: Option<&Snapshot<T>>, now: DateTime<Utc>, max_age: Duration) -> bool {
    snapshot.map_or(true, |s| s.is_stale(now, max_age))
}

/// Skill data copied from the provider profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingSnapshot {
    pub elo: i32,
    pub skill_level: u8,
}

/// Binding of a platform user to an external account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLink {
    pub user_id: UserId,
    pub external_id: ExternalId,
    pub nickname: String,
    pub linked_at: DateTime<Utc>,
    pub membership: Option<Snapshot<bool>>,
    pub rating: Option<Snapshot<RatingSnapshot>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserLink {
    pub fn new(
        user_id: impl Into<UserId>,
        external_id: impl Into<ExternalId>,
        nickname: impl Into<String>,
        linked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            external_id: external_id.into(),
            nickname: nickname.into(),
            linked_at,
            membership: None,
            rating: None,
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Last known membership, regardless of age
    pub fn is_member(&self) -> Option<bool> {
        self.membership.map(|s| s.value)
    }

    pub fn skill_level(&self) -> Option<u8> {
        self.rating.map(|s| s.value.skill_level)
    }

    pub fn elo(&self) -> Option<i32> {
        self.rating.map(|s| s.value.elo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_staleness() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let snap = Snapshot::new(true, t0);
        let max_age = Duration::from_secs(600);

        assert!(!snap.is_stale(t0 + chrono::Duration::seconds(600), max_age));
        assert!(snap.is_stale(t0 + chrono::Duration::seconds(601), max_age));
        assert!(needs_refresh::<bool>(None, t0, max_age));
        assert!(!needs_refresh(Some(&snap), t0, max_age));
    }

    #[test]
    fn test_link_accessors() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut link = UserLink::new("u1", "ext-1", "nick", t0);
        assert!(link.is_active());
        assert_eq!(link.is_member(), None);
        assert_eq!(link.skill_level(), None);

        link.rating = Some(Snapshot::new(
            RatingSnapshot {
                elo: 1850,
                skill_level: 8,
            },
            t0,
        ));
        link.membership = Some(Snapshot::new(false, t0));
        assert_eq!(link.skill_level(), Some(8));
        assert_eq!(link.elo(), Some(1850));
        assert_eq!(link.is_member(), Some(false));

        link.deleted_at = Some(t0);
        assert!(!link.is_active());
    }
}
