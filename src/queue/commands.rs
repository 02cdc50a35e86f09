//! User command handling
//!
//! Every command produces a [`CommandReply`]; failures become a reply with
//! `success = false` instead of an error. State-changing commands request a
//! roster refresh.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{QueueError, Result};
use crate::link::{describe_link, LinkOutcome, LinkService};
use crate::metrics::MetricsCollector;
use crate::policy::PolicyPatch;
use crate::refresh::RefreshCoordinator;
use crate::types::{CommandReply, CommandRequest, QueueCommand, VoiceState};
use crate::utils::Clock;

use super::{describe_roster, LeaveOutcome, QueueEngine, VoiceClassifier};

const THROTTLED: &str = "You are clicking too fast; try again in a moment.";
const ADMIN_ONLY: &str = "Only server admins can do that.";

pub struct CommandHandler {
    engine: QueueEngine,
    links: LinkService,
    coordinator: RefreshCoordinator,
    classifier: VoiceClassifier,
    limiter: DefaultKeyedRateLimiter<String>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl CommandHandler {
    pub fn new(
        engine: QueueEngine,
        links: LinkService,
        coordinator: RefreshCoordinator,
        classifier: VoiceClassifier,
        click_window: Duration,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let quota = Quota::with_period(click_window)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self {
            engine,
            links,
            coordinator,
            classifier,
            limiter: RateLimiter::keyed(quota),
            clock,
            metrics,
        }
    }

    pub async fn handle(&self, request: CommandRequest) -> CommandReply {
        let name = request.command.name();
        let (success, message) = match self.execute(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    "Command '{}' from '{}' in guild '{}' failed: {}",
                    name, request.user_id, request.guild_id, e
                );
                (false, failure_message(&e))
            }
        };
        self.metrics.record_command(name, success);

        CommandReply {
            guild_id: request.guild_id,
            user_id: request.user_id,
            command: name.to_string(),
            success,
            message,
            timestamp: self.clock.now(),
        }
    }

    async fn execute(&self, request: &CommandRequest) -> Result<(bool, String)> {
        let guild_id = request.guild_id.as_str();
        let user_id = request.user_id.as_str();
        debug!(
            "Handling '{}' from '{}' in guild '{}'",
            request.command.name(),
            user_id,
            guild_id
        );

        match &request.command {
            QueueCommand::Join { voice } => {
                if !self.allow_click(guild_id, user_id) {
                    return Ok((false, THROTTLED.to_string()));
                }
                self.join(guild_id, user_id, voice.as_ref()).await
            }
            QueueCommand::Leave => {
                if !self.allow_click(guild_id, user_id) {
                    return Ok((false, THROTTLED.to_string()));
                }
                self.remove(guild_id, user_id).await
            }
            QueueCommand::Kick { target_id } => {
                if !request.is_admin {
                    return Ok((false, ADMIN_ONLY.to_string()));
                }
                self.remove(guild_id, target_id).await
            }
            QueueCommand::Status => {
                let roster = self.engine.roster(guild_id).await?;
                Ok((true, describe_roster(&roster)))
            }
            QueueCommand::Position => match self.engine.position(guild_id, user_id).await? {
                Some(position) => Ok((true, format!("You are #{} in the queue.", position))),
                None => Ok((true, "You are not in the queue.".to_string())),
            },
            QueueCommand::PolicyShow => {
                let text = self.engine.policies().show(guild_id).await?;
                Ok((true, text))
            }
            QueueCommand::PolicySet { patch } => {
                if !request.is_admin {
                    return Ok((false, ADMIN_ONLY.to_string()));
                }
                self.set_policy(guild_id, patch).await
            }
            QueueCommand::Link { nickname } => {
                let outcome = self.links.link(user_id, nickname.trim()).await?;
                let linked = matches!(
                    outcome,
                    LinkOutcome::Linked { .. } | LinkOutcome::Revalidated { .. }
                );
                Ok((linked, outcome.to_string()))
            }
            QueueCommand::Unlink => {
                let outcome = self.links.unlink(user_id).await?;
                Ok((true, outcome.to_string()))
            }
            QueueCommand::WhoAmI => {
                let link = self.links.whoami(user_id).await?;
                Ok((true, describe_link(link.as_ref())))
            }
        }
    }

    /// Drop throttle state for users whose click window has passed; returns the keys left
    pub fn prune_throttle(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    fn allow_click(&self, guild_id: &str, user_id: &str) -> bool {
        let key = format!("{}:{}", guild_id, user_id);
        let allowed = self.limiter.check_key(&key).is_ok();
        if !allowed {
            debug!("Throttled click from '{}' in guild '{}'", user_id, guild_id);
        }
        allowed
    }

    async fn join(
        &self,
        guild_id: &str,
        user_id: &str,
        voice: Option<&VoiceState>,
    ) -> Result<(bool, String)> {
        let policy = self.engine.policies().effective_policy(guild_id).await;
        if policy.voice_required {
            let present = voice.is_some_and(|state| self.classifier.classify(state).is_valid());
            if !present {
                return Ok((
                    false,
                    "Join a voice channel in the queue category before joining.".to_string(),
                ));
            }
        }

        let outcome = self.engine.join(guild_id, user_id).await?;
        if outcome.is_queued() {
            self.coordinator.request_refresh(guild_id);
        }
        Ok((outcome.is_queued(), outcome.to_string()))
    }

    async fn remove(&self, guild_id: &str, user_id: &str) -> Result<(bool, String)> {
        let outcome = self.engine.leave(guild_id, user_id).await?;
        if outcome == LeaveOutcome::Left {
            self.coordinator.request_refresh(guild_id);
        }
        Ok((outcome == LeaveOutcome::Left, outcome.to_string()))
    }

    async fn set_policy(&self, guild_id: &str, patch: &PolicyPatch) -> Result<(bool, String)> {
        if patch.is_empty() {
            return Ok((false, "No policy fields were given.".to_string()));
        }
        let policy = self.engine.policies().update(guild_id, patch).await?;
        // Grace windows may have changed
        self.coordinator.request_refresh(guild_id);
        Ok((true, policy.describe()))
    }
}

fn failure_message(error: &anyhow::Error) -> String {
    match error.downcast_ref::<QueueError>() {
        Some(e) if e.is_provider_failure() => {
            warn!("Provider unavailable while handling command: {}", e);
            "The match provider is not responding; try again shortly.".to_string()
        }
        _ => "Something went wrong; try again or contact a server admin.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyDefaults, VoiceSettings};
    use crate::eligibility::{ChainSettings, PlayerProfile, StaticEligibilityProvider};
    use crate::policy::PolicyService;
    use crate::queue::EngineSettings;
    use crate::refresh::{LoggingPresenter, RefreshSettings};
    use crate::store::{InMemoryLinkStore, InMemoryPolicyStore, InMemoryQueueStore};
    use crate::utils::ManualClock;
    use chrono::Utc;

    fn handler() -> CommandHandler {
        handler_with_window(Duration::from_secs(1))
    }

    fn handler_with_window(click_window: Duration) -> CommandHandler {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let links = Arc::new(InMemoryLinkStore::new(clock.clone()));
        let defaults = PolicyDefaults::default();
        let policies = PolicyService::new(
            Arc::new(InMemoryPolicyStore::new(defaults.clone(), clock.clone())),
            defaults,
        );
        let provider = Arc::new(StaticEligibilityProvider::new(clock.clone()));
        provider
            .add_player(
                PlayerProfile {
                    external_id: "e1".to_string(),
                    nickname: "Alpha".to_string(),
                    elo: 1100,
                    skill_level: 4,
                },
                true,
            )
            .unwrap();

        let engine = QueueEngine::new(
            Arc::new(InMemoryQueueStore::new(clock.clone())),
            links.clone(),
            policies,
            clock.clone(),
            metrics.clone(),
            EngineSettings::default(),
        );
        let coordinator = RefreshCoordinator::new(
            engine.clone(),
            Arc::new(LoggingPresenter),
            clock.clone(),
            metrics.clone(),
            RefreshSettings::default(),
        );
        let link_service = LinkService::new(links, provider, clock.clone(), ChainSettings::default());
        let classifier = VoiceClassifier::new(&VoiceSettings {
            afk_channel_id: Some("afk".to_string()),
            allowed_category_id: Some("games".to_string()),
            deafened_is_afk: false,
        });
        CommandHandler::new(
            engine,
            link_service,
            coordinator,
            classifier,
            click_window,
            clock,
            metrics,
        )
    }

    fn request(user: &str, is_admin: bool, command: QueueCommand) -> CommandRequest {
        CommandRequest {
            guild_id: "g1".to_string(),
            user_id: user.to_string(),
            is_admin,
            command,
        }
    }

    #[tokio::test]
    async fn test_link_then_join() {
        let handler = handler();

        let reply = handler
            .handle(request("u1", false, QueueCommand::Join { voice: None }))
            .await;
        assert!(!reply.success);
        assert!(reply.message.contains("Link your account"));

        let reply = handler
            .handle(request(
                "u1",
                false,
                QueueCommand::Link {
                    nickname: " Alpha ".to_string(),
                },
            ))
            .await;
        assert!(reply.success, "{}", reply.message);

        let reply = handler
            .handle(request("u1", false, QueueCommand::Position))
            .await;
        assert_eq!(reply.message, "You are not in the queue.");
    }

    #[tokio::test]
    async fn test_join_is_throttled() {
        let handler = handler();
        handler
            .handle(request(
                "u1",
                false,
                QueueCommand::Link {
                    nickname: "Alpha".to_string(),
                },
            ))
            .await;

        let first = handler
            .handle(request("u1", false, QueueCommand::Join { voice: None }))
            .await;
        assert!(first.success);
        let second = handler
            .handle(request("u1", false, QueueCommand::Leave))
            .await;
        assert!(!second.success);
        assert_eq!(second.message, THROTTLED);

        let position = handler
            .handle(request("u1", false, QueueCommand::Position))
            .await;
        assert_eq!(position.message, "You are #1 in the queue.");
    }

    #[tokio::test]
    async fn test_throttle_state_is_pruned_after_window() {
        let handler = handler_with_window(Duration::from_millis(50));
        for user in ["u1", "u2"] {
            handler
                .handle(request(user, false, QueueCommand::Leave))
                .await;
        }
        assert_eq!(handler.prune_throttle(), 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handler.prune_throttle(), 0);

        // A pruned user starts with a fresh allowance
        let reply = handler
            .handle(request("u1", false, QueueCommand::Leave))
            .await;
        assert_ne!(reply.message, THROTTLED);
    }

    #[tokio::test]
    async fn test_admin_only_commands() {
        let handler = handler();
        let reply = handler
            .handle(request(
                "u1",
                false,
                QueueCommand::Kick {
                    target_id: "u2".to_string(),
                },
            ))
            .await;
        assert_eq!(reply.message, ADMIN_ONLY);

        let patch = PolicyPatch {
            voice_required: Some(true),
            ..PolicyPatch::default()
        };
        let reply = handler
            .handle(request("u1", false, QueueCommand::PolicySet { patch: patch.clone() }))
            .await;
        assert!(!reply.success);

        let reply = handler
            .handle(request("admin", true, QueueCommand::PolicySet { patch }))
            .await;
        assert!(reply.success);
        assert!(reply.message.contains("voice required: on"));

        let reply = handler
            .handle(request(
                "admin",
                true,
                QueueCommand::PolicySet {
                    patch: PolicyPatch::default(),
                },
            ))
            .await;
        assert!(!reply.success);
    }

    #[tokio::test]
    async fn test_voice_required_gate() {
        let handler = handler();
        handler
            .handle(request(
                "admin",
                true,
                QueueCommand::PolicySet {
                    patch: PolicyPatch {
                        voice_required: Some(true),
                        ..PolicyPatch::default()
                    },
                },
            ))
            .await;
        handler
            .handle(request(
                "u1",
                false,
                QueueCommand::Link {
                    nickname: "Alpha".to_string(),
                },
            ))
            .await;

        let reply = handler
            .handle(request(
                "u1",
                false,
                QueueCommand::Join {
                    voice: Some(VoiceState::in_channel("music", Some("other"))),
                },
            ))
            .await;
        assert!(!reply.success);
        assert!(reply.message.contains("voice channel"));
    }

    #[tokio::test]
    async fn test_voice_required_admits_valid_presence() {
        let handler = handler();
        handler
            .handle(request(
                "admin",
                true,
                QueueCommand::PolicySet {
                    patch: PolicyPatch {
                        voice_required: Some(true),
                        ..PolicyPatch::default()
                    },
                },
            ))
            .await;
        handler
            .handle(request(
                "u1",
                false,
                QueueCommand::Link {
                    nickname: "Alpha".to_string(),
                },
            ))
            .await;

        let reply = handler
            .handle(request(
                "u1",
                false,
                QueueCommand::Join {
                    voice: Some(VoiceState::in_channel("lobby", Some("games"))),
                },
            ))
            .await;
        assert!(reply.success, "{}", reply.message);

        let status = handler.handle(request("u1", false, QueueCommand::Status)).await;
        assert!(status.message.contains("1. "));
        assert!(status.message.contains("Alpha"));
    }
}
