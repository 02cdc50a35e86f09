//! Policy lookups with safe fallbacks

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PolicyDefaults;
use crate::error::{QueueError, Result};
use crate::policy::{GuildPolicy, PolicyPatch};
use crate::store::PolicyStore;
use crate::types::GraceWindows;

/// Front for the policy store used by the engine and command layer
#[derive(Clone)]
pub struct PolicyService {
    store: Arc<dyn PolicyStore>,
    defaults: PolicyDefaults,
}

impl PolicyService {
    pub fn new(store: Arc<dyn PolicyStore>, defaults: PolicyDefaults) -> Self {
        Self { store, defaults }
    }

    /// Policy as stored; storage failures propagate
    pub async fn get_policy(&self, guild_id: &str) -> Result<GuildPolicy> {
        self.store.get(guild_id).await
    }

    /// Policy as stored, or configured defaults when the store is unreachable
    pub async fn effective_policy(&self, guild_id: &str) -> GuildPolicy {
        match self.store.get(guild_id).await {
            Ok(policy) => policy,
            Err(e) => {
                let err = QueueError::PolicyUnavailable {
                    guild_id: guild_id.to_string(),
                    message: e.to_string(),
                };
                warn!("{}; assuming defaults", err);
                GuildPolicy::from_defaults(guild_id, &self.defaults)
            }
        }
    }

    /// Grace windows for pruning and listing, never failing
    pub async fn grace_windows(&self, guild_id: &str) -> GraceWindows {
        self.effective_policy(guild_id).await.grace_windows()
    }

    pub async fn update(&self, guild_id: &str, patch: &PolicyPatch) -> Result<GuildPolicy> {
        let policy = self.store.update(guild_id, patch).await?;
        info!(
            "Policy updated for guild '{}': member={}, voice={}, afk={}s, left={}s, cooldown={}s",
            guild_id,
            policy.require_member,
            policy.voice_required,
            policy.afk_timeout_secs,
            policy.left_timeout_secs,
            policy.cooldown_after_loss_secs
        );
        Ok(policy)
    }

    pub async fn upsert(&self, policy: GuildPolicy) -> Result<()> {
        self.store.upsert(policy).await
    }

    /// Text for the policy show command
    pub async fn show(&self, guild_id: &str) -> Result<String> {
        Ok(self.get_policy(guild_id).await?.describe())
    }
}
