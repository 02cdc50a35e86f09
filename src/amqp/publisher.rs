//! AMQP event publisher for outbound events
//!
//! The publisher doubles as the roster presenter and the eligibility
//! notifier: rendered rosters, denial notices and command replies all leave
//! the service as enveloped JSON on one topic exchange.

use crate::amqp::messages::{
    MessageEnvelope, COMMAND_REPLY_ROUTING_KEY, ELIGIBILITY_DENIED_ROUTING_KEY,
    ROSTER_UPDATED_ROUTING_KEY,
};
use crate::eligibility::EligibilityNotifier;
use crate::error::{QueueError, Result};
use crate::metrics::MetricsCollector;
use crate::refresh::RosterPresenter;
use crate::types::{CommandReply, EligibilityDenied, RosterSnapshot};
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Publishing contract for outbound events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_roster(&self, roster: &RosterSnapshot) -> Result<()>;

    async fn publish_denied(&self, notice: &EligibilityDenied) -> Result<()>;

    async fn publish_reply(&self, reply: &CommandReply) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: "queue.events".to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

/// AMQP-based event publisher implementation
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
    metrics: Arc<MetricsCollector>,
}

impl AmqpEventPublisher {
    /// Create the publisher and declare its exchange
    pub async fn new(
        channel: Channel,
        config: PublisherConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let publisher = Self {
            channel,
            config,
            metrics,
        };
        publisher.setup_exchange().await?;
        Ok(publisher)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange, "topic")
            .durable(true)
            .finish();
        self.channel.exchange_declare(args).await.map_err(|e| {
            QueueError::AmqpConnectionFailed {
                message: format!(
                    "Failed to declare exchange {}: {}",
                    self.config.exchange, e
                ),
            }
        })?;

        info!("Declared events exchange '{}'", self.config.exchange);
        Ok(())
    }

    /// Publish with retry and exponential backoff
    async fn publish<T>(&self, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let started = Instant::now();
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(()) => {
                    self.metrics
                        .record_amqp_operation("publish", true, started.elapsed());
                    debug!(
                        "Published {} ({}) to exchange {}",
                        envelope.routing_key, envelope.correlation_id, self.config.exchange
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        self.metrics
                            .record_amqp_operation("publish", false, started.elapsed());
                        error!(
                            "Failed to publish {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );
                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    async fn try_publish<T>(&self, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = envelope.to_bytes()?;
        let args = BasicPublishArguments::new(&self.config.exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| QueueError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish_roster(&self, roster: &RosterSnapshot) -> Result<()> {
        let envelope = MessageEnvelope::new(roster.clone(), ROSTER_UPDATED_ROUTING_KEY);
        self.publish(&envelope).await
    }

    async fn publish_denied(&self, notice: &EligibilityDenied) -> Result<()> {
        let envelope = MessageEnvelope::new(notice.clone(), ELIGIBILITY_DENIED_ROUTING_KEY);
        self.publish(&envelope).await
    }

    async fn publish_reply(&self, reply: &CommandReply) -> Result<()> {
        let envelope = MessageEnvelope::new(reply.clone(), COMMAND_REPLY_ROUTING_KEY);
        self.publish(&envelope).await
    }
}

#[async_trait]
impl RosterPresenter for AmqpEventPublisher {
    async fn render(&self, roster: &RosterSnapshot) -> Result<()> {
        self.publish_roster(roster).await
    }
}

#[async_trait]
impl EligibilityNotifier for AmqpEventPublisher {
    async fn notify_denied(&self, notice: &EligibilityDenied) -> Result<()> {
        self.publish_denied(notice).await
    }
}

/// Event publisher that records instead of sending
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    rosters: Mutex<Vec<RosterSnapshot>>,
    denials: Mutex<Vec<EligibilityDenied>>,
    replies: Mutex<Vec<CommandReply>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rosters(&self) -> Vec<RosterSnapshot> {
        self.rosters
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn denials(&self) -> Vec<EligibilityDenied> {
        self.denials
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn replies(&self) -> Vec<CommandReply> {
        self.replies
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut rosters) = self.rosters.lock() {
            rosters.clear();
        }
        if let Ok(mut denials) = self.denials.lock() {
            denials.clear();
        }
        if let Ok(mut replies) = self.replies.lock() {
            replies.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_roster(&self, roster: &RosterSnapshot) -> Result<()> {
        if let Ok(mut rosters) = self.rosters.lock() {
            rosters.push(roster.clone());
        }
        Ok(())
    }

    async fn publish_denied(&self, notice: &EligibilityDenied) -> Result<()> {
        if let Ok(mut denials) = self.denials.lock() {
            denials.push(notice.clone());
        }
        Ok(())
    }

    async fn publish_reply(&self, reply: &CommandReply) -> Result<()> {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(reply.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RosterPresenter for MockEventPublisher {
    async fn render(&self, roster: &RosterSnapshot) -> Result<()> {
        self.publish_roster(roster).await
    }
}

#[async_trait]
impl EligibilityNotifier for MockEventPublisher {
    async fn notify_denied(&self, notice: &EligibilityDenied) -> Result<()> {
        self.publish_denied(notice).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_publisher_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.exchange, "queue.events");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 500);
    }

    #[tokio::test]
    async fn test_mock_publisher_records_through_collaborator_traits() {
        let publisher = MockEventPublisher::new();
        let roster = RosterSnapshot {
            guild_id: "g1".to_string(),
            generated_at: Utc::now(),
            afk_grace_secs: 60,
            left_grace_secs: 120,
            entries: Vec::new(),
            next_expiry: None,
        };
        publisher.render(&roster).await.unwrap();

        let notice = EligibilityDenied {
            guild_id: "g1".to_string(),
            user_id: "u1".to_string(),
            reason: "not a member".to_string(),
            retry_after_secs: None,
            evicted: false,
            timestamp: Utc::now(),
        };
        publisher.notify_denied(&notice).await.unwrap();

        assert_eq!(publisher.rosters().len(), 1);
        assert_eq!(publisher.denials(), vec![notice]);
        assert!(publisher.replies().is_empty());

        publisher.clear();
        assert!(publisher.rosters().is_empty());
    }
}
