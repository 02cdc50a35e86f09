//! Guild policy storage

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::PolicyDefaults;
use crate::error::{QueueError, Result};
use crate::policy::{GuildPolicy, PolicyPatch};
use crate::types::GuildId;
use crate::utils::Clock;

/// Storage contract for guild policies
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch the guild's policy, creating it with defaults on first access
    async fn get(&self, guild_id: &str) -> Result<GuildPolicy>;

    async fn upsert(&self, policy: GuildPolicy) -> Result<()>;

    /// Apply a partial patch and return the resulting policy
    async fn update(&self, guild_id: &str, patch: &PolicyPatch) -> Result<GuildPolicy>;
}

/// In-memory policy store
#[derive(Debug)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<GuildId, GuildPolicy>>,
    defaults: PolicyDefaults,
    clock: Arc<dyn Clock>,
}

impl InMemoryPolicyStore {
    pub fn new(defaults: PolicyDefaults, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            defaults,
            clock,
        }
    }

    fn fresh(&self, guild_id: &str) -> GuildPolicy {
        let mut policy = GuildPolicy::from_defaults(guild_id, &self.defaults);
        policy.updated_at = self.clock.now();
        policy
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(&self, guild_id: &str) -> Result<GuildPolicy> {
        {
            let policies = self
                .policies
                .read()
                .map_err(|_| QueueError::lock("policy"))?;
            if let Some(policy) = policies.get(guild_id) {
                return Ok(policy.clone());
            }
        }

        let mut policies = self
            .policies
            .write()
            .map_err(|_| QueueError::lock("policy"))?;
        Ok(policies
            .entry(guild_id.to_string())
            .or_insert_with(|| self.fresh(guild_id))
            .clone())
    }

    async fn upsert(&self, policy: GuildPolicy) -> Result<()> {
        let mut policies = self
            .policies
            .write()
            .map_err(|_| QueueError::lock("policy"))?;
        policies.insert(policy.guild_id.clone(), policy);
        Ok(())
    }

    async fn update(&self, guild_id: &str, patch: &PolicyPatch) -> Result<GuildPolicy> {
        let now = self.clock.now();
        let mut policies = self
            .policies
            .write()
            .map_err(|_| QueueError::lock("policy"))?;
        let policy = policies
            .entry(guild_id.to_string())
            .or_insert_with(|| self.fresh(guild_id));
        policy.apply(patch);
        policy.updated_at = now;
        Ok(policy.clone())
    }
}
