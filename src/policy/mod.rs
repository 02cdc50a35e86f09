//! Per-guild queue policy
//!
//! A [`GuildPolicy`] is created lazily with configured defaults and changed
//! through partial patches where only supplied fields override.

pub mod service;

pub use service::PolicyService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::PolicyDefaults;
use crate::types::{GraceWindows, GuildId};

/// Queue rules for one guild; all durations are in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildPolicy {
    pub guild_id: GuildId,
    pub require_member: bool,
    pub voice_required: bool,
    pub afk_timeout_secs: u64,
    pub left_timeout_secs: u64,
    pub cooldown_after_loss_secs: u64,
    pub updated_at: DateTime<Utc>,
}

/// Partial policy update; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_member: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub afk_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_after_loss_secs: Option<u64>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        self == &PolicyPatch::default()
    }
}

impl GuildPolicy {
    pub fn from_defaults(guild_id: impl Into<GuildId>, defaults: &PolicyDefaults) -> Self {
        Self {
            guild_id: guild_id.into(),
            require_member: defaults.require_member,
            voice_required: defaults.voice_required,
            afk_timeout_secs: defaults.afk_timeout_secs,
            left_timeout_secs: defaults.left_timeout_secs,
            cooldown_after_loss_secs: defaults.cooldown_after_loss_secs,
            updated_at: Utc::now(),
        }
    }

    /// Apply only the fields present in `patch`
    pub fn apply(&mut self, patch: &PolicyPatch) {
        if let Some(v) = patch.require_member {
            self.require_member = v;
        }
        if let Some(v) = patch.voice_required {
            self.voice_required = v;
        }
        if let Some(v) = patch.afk_timeout_secs {
            self.afk_timeout_secs = v;
        }
        if let Some(v) = patch.left_timeout_secs {
            self.left_timeout_secs = v;
        }
        if let Some(v) = patch.cooldown_after_loss_secs {
            self.cooldown_after_loss_secs = v;
        }
    }

    pub fn grace_windows(&self) -> GraceWindows {
        GraceWindows::new(
            Duration::from_secs(self.afk_timeout_secs),
            Duration::from_secs(self.left_timeout_secs),
        )
    }

    /// Loss cooldown, falling back to `default` when the policy sets none
    pub fn loss_cooldown(&self, default: Duration) -> Duration {
        match self.cooldown_after_loss_secs {
            0 => default,
            secs => Duration::from_secs(secs),
        }
    }

    /// Human-readable summary for the policy show command
    pub fn describe(&self) -> String {
        fn on_off(v: bool) -> &'static str {
            if v {
                "on"
            } else {
                "off"
            }
        }
        format!(
            "Policy for guild {}\n- require member: {}\n- voice required: {}\n- afk grace: {}s\n- left grace: {}s\n- cooldown after loss: {}s",
            self.guild_id,
            on_off(self.require_member),
            on_off(self.voice_required),
            self.afk_timeout_secs,
            self.left_timeout_secs,
            self.cooldown_after_loss_secs,
        )
    }
}
