//! AMQP consumers for inbound commands and presence updates

use crate::amqp::messages::MessageUtils;
use crate::error::{QueueError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{CommandRequest, PresenceUpdate};
use amqprs::{
    channel::{BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, Channel},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Trait defining the interface for handling inbound messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_command(&self, request: CommandRequest) -> Result<()>;

    async fn handle_presence(&self, update: PresenceUpdate) -> Result<()>;

    /// Called for messages that could not be decoded or processed
    async fn handle_error(&self, error: QueueError, message_data: &[u8]);
}

/// Which inbound stream a consumer reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Command,
    Presence,
}

impl InboundKind {
    fn operation(&self) -> &'static str {
        match self {
            InboundKind::Command => "consume_command",
            InboundKind::Presence => "consume_presence",
        }
    }
}

/// Consumer registration on one queue
pub struct InboundConsumer {
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<MetricsCollector>,
    channel: Channel,
    consumer_tag: String,
    kind: InboundKind,
}

impl InboundConsumer {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<MetricsCollector>,
        channel: Channel,
        kind: InboundKind,
    ) -> Self {
        let consumer_tag = format!("{}-{}", kind.operation(), uuid::Uuid::new_v4());
        Self {
            handler,
            metrics,
            channel,
            consumer_tag,
            kind,
        }
    }

    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);
        let consumer = DeliveryConsumer {
            handler: self.handler.clone(),
            metrics: self.metrics.clone(),
            kind: self.kind,
        };

        self.channel
            .basic_consume(consumer, args)
            .await
            .map_err(|e| QueueError::AmqpConnectionFailed {
                message: format!("Failed to start consuming {}: {}", queue_name, e),
            })?;

        info!("Started consuming {:?} messages from queue: {}", self.kind, queue_name);
        Ok(())
    }

    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);
        self.channel
            .basic_cancel(args)
            .await
            .map_err(|e| QueueError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            })?;

        info!("Stopped consuming {:?} messages", self.kind);
        Ok(())
    }
}

struct DeliveryConsumer {
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<MetricsCollector>,
    kind: InboundKind,
}

impl DeliveryConsumer {
    async fn process_message(&self, content: &[u8]) -> Result<()> {
        match self.kind {
            InboundKind::Command => {
                let request = MessageUtils::decode_command(content)?;
                debug!(
                    "Command '{}' from '{}' in guild '{}'",
                    request.command.name(),
                    request.user_id,
                    request.guild_id
                );
                self.handler.handle_command(request).await
            }
            InboundKind::Presence => {
                let update = MessageUtils::decode_presence(content)?;
                self.handler.handle_presence(update).await
            }
        }
    }
}

#[async_trait]
impl AsyncConsumer for DeliveryConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        let started = Instant::now();
        debug!(
            "AMQP message received - delivery_tag: {}, routing_key: '{}', size: {} bytes",
            delivery_tag,
            deliver.routing_key(),
            content.len()
        );

        let result = self.process_message(&content).await;
        let elapsed = started.elapsed();
        self.metrics
            .record_amqp_operation(self.kind.operation(), result.is_ok(), elapsed);

        match result {
            Ok(()) => debug!(
                "Message processed - delivery_tag: {}, processing_time: {:.2}ms",
                delivery_tag,
                elapsed.as_secs_f64() * 1000.0
            ),
            Err(e) => {
                error!(
                    "Message processing failed - delivery_tag: {}, processing_time: {:.2}ms, error: {}",
                    delivery_tag,
                    elapsed.as_secs_f64() * 1000.0,
                    e
                );
                let error = match e.downcast::<QueueError>() {
                    Ok(typed) => typed,
                    Err(other) => QueueError::InternalError {
                        message: other.to_string(),
                    },
                };
                self.handler.handle_error(error, &content).await;
            }
        }

        // Acked even on failure so a bad payload is not redelivered forever
        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            warn!("Failed to ack delivery {}: {}", delivery_tag, e);
        }
    }
}

/// Handler that records what it receives
#[derive(Default)]
pub struct MockMessageHandler {
    pub commands: tokio::sync::Mutex<Vec<CommandRequest>>,
    pub presence: tokio::sync::Mutex<Vec<PresenceUpdate>>,
    pub errors: tokio::sync::Mutex<Vec<String>>,
}

impl MockMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageHandler for MockMessageHandler {
    async fn handle_command(&self, request: CommandRequest) -> Result<()> {
        self.commands.lock().await.push(request);
        Ok(())
    }

    async fn handle_presence(&self, update: PresenceUpdate) -> Result<()> {
        self.presence.lock().await.push(update);
        Ok(())
    }

    async fn handle_error(&self, error: QueueError, _message_data: &[u8]) {
        self.errors.lock().await.push(error.to_string());
    }
}
