//! Queue entry storage
//!
//! The store is the only synchronization point the engine relies on: every
//! write is an atomic conditional upsert or delete keyed by (guild, user).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{QueueError, Result};
use crate::types::{
    EntryStatus, GraceWindows, GuildId, PresenceTransition, PruneCounts, QueueEntry, UserId,
};
use crate::utils::Clock;

/// Storage contract for queue entries
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert `entry` as waiting, or reset an existing row to waiting while
    /// keeping its `joined_at`. Returns whether a row already existed.
    async fn join(&self, entry: QueueEntry) -> Result<bool>;

    /// Delete the row; returns whether it existed
    async fn leave(&self, guild_id: &str, user_id: &str) -> Result<bool>;

    /// Waiting rows only, oldest first
    async fn list(&self, guild_id: &str, limit: usize) -> Result<Vec<QueueEntry>>;

    /// Waiting rows plus afk/left rows still inside their grace window, oldest first
    async fn list_with_grace(
        &self,
        guild_id: &str,
        limit: usize,
        grace: GraceWindows,
    ) -> Result<Vec<QueueEntry>>;

    /// Delete afk/left rows whose grace window has elapsed. Never touches waiting rows.
    async fn prune(&self, guild_id: &str, grace: GraceWindows) -> Result<PruneCounts>;

    async fn touch_valid(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        self.transition(guild_id, user_id, PresenceTransition::TouchValid)
            .await
    }

    async fn mark_afk(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        self.transition(guild_id, user_id, PresenceTransition::MarkAfk)
            .await
    }

    async fn mark_left(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        self.transition(guild_id, user_id, PresenceTransition::MarkLeft)
            .await
    }

    /// Apply a presence transition to an existing row; returns whether it applied
    async fn transition(
        &self,
        guild_id: &str,
        user_id: &str,
        transition: PresenceTransition,
    ) -> Result<bool>;

    async fn exists(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.get(guild_id, user_id).await?.is_some())
    }

    async fn get(&self, guild_id: &str, user_id: &str) -> Result<Option<QueueEntry>>;

    /// Earliest grace deadline among afk/left rows, including ones already due
    async fn next_expiry(&self, guild_id: &str, grace: GraceWindows)
        -> Result<Option<DateTime<Utc>>>;

    /// Guilds that currently hold at least one row
    async fn guilds(&self) -> Result<Vec<GuildId>>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: QueueEntry,
    /// Insertion order, used to break `joined_at` ties
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueTables {
    guilds: HashMap<GuildId, HashMap<UserId, StoredEntry>>,
    next_seq: u64,
}

/// In-memory queue store
#[derive(Debug)]
pub struct InMemoryQueueStore {
    tables: RwLock<QueueTables>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(QueueTables::default()),
            clock,
        }
    }

    fn sorted(rows: impl Iterator<Item = StoredEntry>) -> Vec<QueueEntry> {
        let mut rows: Vec<StoredEntry> = rows.collect();
        rows.sort_by(|a, b| {
            a.entry
                .joined_at
                .cmp(&b.entry.joined_at)
                .then(a.seq.cmp(&b.seq))
        });
        rows.into_iter().map(|row| row.entry).collect()
    }

    /// Total rows across guilds
    pub fn len(&self) -> Result<usize> {
        let tables = self.tables.read().map_err(|_| QueueError::lock("queue"))?;
        Ok(tables.guilds.values().map(HashMap::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn join(&self, entry: QueueEntry) -> Result<bool> {
        let now = self.clock.now();
        let mut tables = self.tables.write().map_err(|_| QueueError::lock("queue"))?;
        let seq = tables.next_seq;

        let rows = tables.guilds.entry(entry.guild_id.clone()).or_default();
        let existed = match rows.get_mut(&entry.user_id) {
            Some(stored) => {
                stored.entry.external_id = entry.external_id;
                stored.entry.display_name = entry.display_name;
                stored.entry.status = EntryStatus::Waiting;
                stored.entry.last_seen_at = now;
                true
            }
            None => {
                let mut entry = entry;
                entry.status = EntryStatus::Waiting;
                entry.last_seen_at = now;
                rows.insert(entry.user_id.clone(), StoredEntry { entry, seq });
                false
            }
        };

        if !existed {
            tables.next_seq += 1;
        }
        Ok(existed)
    }

    async fn leave(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().map_err(|_| QueueError::lock("queue"))?;
        let Some(rows) = tables.guilds.get_mut(guild_id) else {
            return Ok(false);
        };
        let existed = rows.remove(user_id).is_some();
        if rows.is_empty() {
            tables.guilds.remove(guild_id);
        }
        Ok(existed)
    }

    async fn list(&self, guild_id: &str, limit: usize) -> Result<Vec<QueueEntry>> {
        let tables = self.tables.read().map_err(|_| QueueError::lock("queue"))?;
        let Some(rows) = tables.guilds.get(guild_id) else {
            return Ok(Vec::new());
        };

        let waiting = rows
            .values()
            .filter(|row| row.entry.status == EntryStatus::Waiting)
            .cloned();
        Ok(Self::sorted(waiting).into_iter().take(limit).collect())
    }

    async fn list_with_grace(
        &self,
        guild_id: &str,
        limit: usize,
        grace: GraceWindows,
    ) -> Result<Vec<QueueEntry>> {
        let now = self.clock.now();
        let tables = self.tables.read().map_err(|_| QueueError::lock("queue"))?;
        let Some(rows) = tables.guilds.get(guild_id) else {
            return Ok(Vec::new());
        };

        let visible = rows
            .values()
            .filter(|row| row.entry.is_visible(&grace, now))
            .cloned();
        Ok(Self::sorted(visible).into_iter().take(limit).collect())
    }

    async fn prune(&self, guild_id: &str, grace: GraceWindows) -> Result<PruneCounts> {
        let now = self.clock.now();
        let mut tables = self.tables.write().map_err(|_| QueueError::lock("queue"))?;
        let Some(rows) = tables.guilds.get_mut(guild_id) else {
            return Ok(PruneCounts::default());
        };

        let mut counts = PruneCounts::default();
        rows.retain(|_, row| {
            if !row.entry.is_expired(&grace, now) {
                return true;
            }
            match row.entry.status {
                EntryStatus::Afk => counts.afk += 1,
                EntryStatus::Left => counts.left += 1,
                EntryStatus::Waiting => return true,
            }
            false
        });

        if rows.is_empty() {
            tables.guilds.remove(guild_id);
        }
        Ok(counts)
    }

    async fn transition(
        &self,
        guild_id: &str,
        user_id: &str,
        transition: PresenceTransition,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut tables = self.tables.write().map_err(|_| QueueError::lock("queue"))?;
        let Some(stored) = tables
            .guilds
            .get_mut(guild_id)
            .and_then(|rows| rows.get_mut(user_id))
        else {
            return Ok(false);
        };

        if !transition.applies_to(stored.entry.status) {
            return Ok(false);
        }
        stored.entry.status = transition.target();
        stored.entry.last_seen_at = now;
        Ok(true)
    }

    async fn get(&self, guild_id: &str, user_id: &str) -> Result<Option<QueueEntry>> {
        let tables = self.tables.read().map_err(|_| QueueError::lock("queue"))?;
        Ok(tables
            .guilds
            .get(guild_id)
            .and_then(|rows| rows.get(user_id))
            .map(|row| row.entry.clone()))
    }

    async fn next_expiry(
        &self,
        guild_id: &str,
        grace: GraceWindows,
    ) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().map_err(|_| QueueError::lock("queue"))?;
        Ok(tables.guilds.get(guild_id).and_then(|rows| {
            rows.values()
                .filter_map(|row| row.entry.expires_at(&grace))
                .min()
        }))
    }

    async fn guilds(&self) -> Result<Vec<GuildId>> {
        let tables = self.tables.read().map_err(|_| QueueError::lock("queue"))?;
        Ok(tables.guilds.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, InMemoryQueueStore) {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let store = InMemoryQueueStore::new(clock.clone());
        (clock, store)
    }

    fn entry(clock: &ManualClock, user: &str) -> QueueEntry {
        QueueEntry::waiting("g1", user, format!("ext-{}", user), user, clock.now())
    }

    fn grace() -> GraceWindows {
        GraceWindows::new(Duration::from_secs(60), Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (clock, store) = setup();
        let first = entry(&clock, "u1");
        let joined_at = first.joined_at;

        assert!(!store.join(first).await.unwrap());
        clock.advance(Duration::from_secs(5));
        store.mark_afk("g1", "u1").await.unwrap();
        clock.advance(Duration::from_secs(5));
        assert!(store.join(entry(&clock, "u1")).await.unwrap());

        let rows = store.list_with_grace("g1", 50, grace()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EntryStatus::Waiting);
        assert_eq!(rows[0].joined_at, joined_at);
        assert_eq!(rows[0].last_seen_at, clock.now());
    }

    #[tokio::test]
    async fn test_leave_reports_existence() {
        let (clock, store) = setup();
        assert!(!store.leave("g1", "u1").await.unwrap());

        store.join(entry(&clock, "u1")).await.unwrap();
        assert!(store.leave("g1", "u1").await.unwrap());
        assert!(!store.exists("g1", "u1").await.unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_transitions_on_missing_row_are_noops() {
        let (_clock, store) = setup();
        assert!(!store.touch_valid("g1", "ghost").await.unwrap());
        assert!(!store.mark_afk("g1", "ghost").await.unwrap());
        assert!(!store.mark_left("g1", "ghost").await.unwrap());
        assert!(!store.exists("g1", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_repeated_afk_keeps_grace_start() {
        let (clock, store) = setup();
        store.join(entry(&clock, "u1")).await.unwrap();

        assert!(store.mark_afk("g1", "u1").await.unwrap());
        let marked_at = clock.now();
        clock.advance(Duration::from_secs(30));
        assert!(!store.mark_afk("g1", "u1").await.unwrap());

        let row = store.get("g1", "u1").await.unwrap().unwrap();
        assert_eq!(row.last_seen_at, marked_at);
        assert_eq!(
            store.next_expiry("g1", grace()).await.unwrap(),
            Some(marked_at + chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn test_prune_never_touches_waiting() {
        let (clock, store) = setup();
        store.join(entry(&clock, "waiter")).await.unwrap();
        clock.advance(Duration::from_secs(86_400 * 30));

        let counts = store.prune("g1", grace()).await.unwrap();
        assert_eq!(counts.total(), 0);
        assert!(store.exists("g1", "waiter").await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_classes_are_independent() {
        let (clock, store) = setup();
        store.join(entry(&clock, "afk")).await.unwrap();
        store.join(entry(&clock, "gone")).await.unwrap();
        store.mark_afk("g1", "afk").await.unwrap();
        store.mark_left("g1", "gone").await.unwrap();
        clock.advance(Duration::from_secs(500));

        let afk_disabled = GraceWindows::new(Duration::ZERO, Duration::from_secs(120));
        let counts = store.prune("g1", afk_disabled).await.unwrap();
        assert_eq!(counts, PruneCounts { afk: 0, left: 1 });
        assert!(store.exists("g1", "afk").await.unwrap());

        let counts = store.prune("g1", grace()).await.unwrap();
        assert_eq!(counts, PruneCounts { afk: 1, left: 0 });
    }

    #[tokio::test]
    async fn test_list_orders_by_join_time() {
        let (clock, store) = setup();
        for user in ["a", "b", "c"] {
            store.join(entry(&clock, user)).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        // Status churn and later touches must not reorder
        store.mark_left("g1", "a").await.unwrap();
        store.touch_valid("g1", "a").await.unwrap();
        store.mark_afk("g1", "b").await.unwrap();

        let rows = store.list_with_grace("g1", 50, grace()).await.unwrap();
        let users: Vec<_> = rows.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(users, vec!["a", "b", "c"]);

        let waiting = store.list("g1", 50).await.unwrap();
        let users: Vec<_> = waiting.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(users, vec!["a", "c"]);

        let limited = store.list_with_grace("g1", 2, grace()).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_equal_join_times_keep_insertion_order() {
        let (clock, store) = setup();
        for user in ["z", "y", "x"] {
            store.join(entry(&clock, user)).await.unwrap();
        }
        let rows = store.list("g1", 50).await.unwrap();
        let users: Vec<_> = rows.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(users, vec!["z", "y", "x"]);
    }

    #[tokio::test]
    async fn test_guilds_are_isolated() {
        let (clock, store) = setup();
        store.join(entry(&clock, "u1")).await.unwrap();
        let mut other = entry(&clock, "u1");
        other.guild_id = "g2".to_string();
        store.join(other).await.unwrap();

        store.leave("g1", "u1").await.unwrap();
        assert!(store.exists("g2", "u1").await.unwrap());
        assert_eq!(store.guilds().await.unwrap(), vec!["g2".to_string()]);
    }
}
