//! Common types used throughout the queue service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::policy::PolicyPatch;
use crate::utils::to_chrono;

/// Platform (chat) guild identifier
pub type GuildId = String;

/// Platform (chat) user identifier
pub type UserId = String;

/// External match-provider account identifier
pub type ExternalId = String;

/// Standing of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Waiting,
    Afk,
    Left,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Waiting => "waiting",
            EntryStatus::Afk => "afk",
            EntryStatus::Left => "left",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence-driven status transition applied to an existing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceTransition {
    TouchValid,
    MarkAfk,
    MarkLeft,
}

impl PresenceTransition {
    /// Status an entry ends up in after this transition
    pub fn target(&self) -> EntryStatus {
        match self {
            PresenceTransition::TouchValid => EntryStatus::Waiting,
            PresenceTransition::MarkAfk => EntryStatus::Afk,
            PresenceTransition::MarkLeft => EntryStatus::Left,
        }
    }

    /// Whether an entry currently in `from` accepts this transition.
    ///
    /// A repeated AFK or left signal does not restart the grace window.
    pub fn applies_to(&self, from: EntryStatus) -> bool {
        match self {
            PresenceTransition::TouchValid => true,
            PresenceTransition::MarkAfk => {
                matches!(from, EntryStatus::Waiting | EntryStatus::Left)
            }
            PresenceTransition::MarkLeft => {
                matches!(from, EntryStatus::Waiting | EntryStatus::Afk)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceTransition::TouchValid => "touch_valid",
            PresenceTransition::MarkAfk => "mark_afk",
            PresenceTransition::MarkLeft => "mark_left",
        }
    }
}

/// One row of a guild's waiting list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub external_id: ExternalId,
    pub display_name: String,
    pub status: EntryStatus,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Build a fresh `waiting` entry stamped at `now`
    pub fn waiting(
        guild_id: impl Into<GuildId>,
        user_id: impl Into<UserId>,
        external_id: impl Into<ExternalId>,
        display_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            user_id: user_id.into(),
            external_id: external_id.into(),
            display_name: display_name.into(),
            status: EntryStatus::Waiting,
            joined_at: now,
            last_seen_at: now,
        }
    }

    /// Instant at which this entry falls out of its grace window, if it has one
    pub fn expires_at(&self, grace: &GraceWindows) -> Option<DateTime<Utc>> {
        grace
            .for_status(self.status)
            .map(|window| self.last_seen_at + to_chrono(window))
    }

    /// Whether the entry is still shown at `now` under `grace`
    pub fn is_visible(&self, grace: &GraceWindows, now: DateTime<Utc>) -> bool {
        match self.status {
            EntryStatus::Waiting => true,
            _ => self.expires_at(grace).is_some_and(|deadline| now < deadline),
        }
    }

    /// Whether a prune at `now` under `grace` removes this entry
    pub fn is_expired(&self, grace: &GraceWindows, now: DateTime<Utc>) -> bool {
        match self.status {
            EntryStatus::Waiting => false,
            _ => self.expires_at(grace).is_some_and(|deadline| now >= deadline),
        }
    }
}

/// Active grace windows for a guild; a zero window disables that class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraceWindows {
    pub afk: Duration,
    pub left: Duration,
}

impl GraceWindows {
    pub fn new(afk: Duration, left: Duration) -> Self {
        Self { afk, left }
    }

    /// Grace window governing `status`, or `None` when the class is disabled or never expires
    pub fn for_status(&self, status: EntryStatus) -> Option<Duration> {
        let window = match status {
            EntryStatus::Waiting => return None,
            EntryStatus::Afk => self.afk,
            EntryStatus::Left => self.left,
        };
        (!window.is_zero()).then_some(window)
    }
}

/// Per-class removal counts from a prune pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PruneCounts {
    pub afk: u64,
    pub left: u64,
}

impl PruneCounts {
    pub fn total(&self) -> u64 {
        self.afk + self.left
    }
}

/// Raw voice state for a user as reported by the chat platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    pub channel_id: Option<String>,
    pub category_id: Option<String>,
    #[serde(default)]
    pub self_deafened: bool,
}

impl VoiceState {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn in_channel(channel_id: impl Into<String>, category_id: Option<&str>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            category_id: category_id.map(str::to_string),
            self_deafened: false,
        }
    }
}

/// Queue command issued by a platform user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueCommand {
    Join {
        #[serde(default)]
        voice: Option<VoiceState>,
    },
    Leave,
    Kick {
        target_id: UserId,
    },
    Status,
    Position,
    PolicyShow,
    PolicySet {
        patch: PolicyPatch,
    },
    Link {
        nickname: String,
    },
    Unlink,
    WhoAmI,
}

impl QueueCommand {
    pub fn name(&self) -> &'static str {
        match self {
            QueueCommand::Join { .. } => "join",
            QueueCommand::Leave => "leave",
            QueueCommand::Kick { .. } => "kick",
            QueueCommand::Status => "status",
            QueueCommand::Position => "position",
            QueueCommand::PolicyShow => "policy_show",
            QueueCommand::PolicySet { .. } => "policy_set",
            QueueCommand::Link { .. } => "link",
            QueueCommand::Unlink => "unlink",
            QueueCommand::WhoAmI => "whoami",
        }
    }
}

/// Inbound command message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub guild_id: GuildId,
    pub user_id: UserId,
    /// Resolved by the platform adapter from the user's roles
    #[serde(default)]
    pub is_admin: bool,
    pub command: QueueCommand,
}

/// Inbound voice presence change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub voice: VoiceState,
}

/// Reply to a command, published back to the platform adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub command: String,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One rendered line of the roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub position: usize,
    pub user_id: UserId,
    pub external_id: ExternalId,
    pub display_name: String,
    pub status: EntryStatus,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub skill_level: Option<u8>,
    pub badge: Option<String>,
    /// `m:ss` countdown, present only once removal is imminent
    pub countdown: Option<String>,
}

/// Ordered roster handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub guild_id: GuildId,
    pub generated_at: DateTime<Utc>,
    pub afk_grace_secs: u64,
    pub left_grace_secs: u64,
    pub entries: Vec<RosterEntry>,
    /// Nearest grace deadline among the listed entries
    pub next_expiry: Option<DateTime<Utc>>,
}

impl RosterSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position_of(&self, user_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.user_id == user_id)
            .map(|e| e.position)
    }
}

/// Notice that a queued user failed eligibility validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityDenied {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub reason: String,
    pub retry_after_secs: Option<u64>,
    pub evicted: bool,
    pub timestamp: DateTime<Utc>,
}
