//! Main application state and service coordination
//!
//! [`QueueComponents`] wires the queue core (stores, engine, eligibility,
//! refresh, command and presence handling) against whatever presenter,
//! notifier and provider it is given. [`AppState`] puts AMQP, the health
//! server and the background tasks around it.

use crate::amqp::{
    AmqpConfig, AmqpConnection, AmqpEventPublisher, EventPublisher, InboundConsumer, InboundKind,
    MessageHandler, PublisherConfig,
};
use crate::config::{AppConfig, LevelBadges};
use crate::eligibility::{
    ChainSettings, EligibilityChain, EligibilityNotifier, EligibilityProvider,
    EligibilityValidator, OutcomeDispatcher, StaticEligibilityProvider, ValidationOutcome,
    ValidatorSettings,
};
use crate::error::{QueueError, Result as QueueResult};
use crate::link::LinkService;
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::policy::PolicyService;
use crate::queue::{CommandHandler, EngineSettings, PresenceTracker, QueueEngine, VoiceClassifier};
use crate::refresh::{RefreshCoordinator, RefreshSettings, RosterPresenter};
use crate::service::health::{HealthCheck, HealthStatus, ServiceProbe};
use crate::store::{
    InMemoryLinkStore, InMemoryPolicyStore, InMemoryQueueStore, LinkStore, PolicyStore,
    QueueStore,
};
use crate::types::{CommandRequest, PresenceUpdate};
use crate::utils::{Clock, SystemClock};
use amqprs::channel::{Channel, QueueDeclareArguments};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

const THROTTLE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// External collaborators the queue core is built against
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub provider: Arc<dyn EligibilityProvider>,
    pub presenter: Arc<dyn RosterPresenter>,
    pub notifier: Arc<dyn EligibilityNotifier>,
    pub metrics: Arc<MetricsCollector>,
}

/// Fully wired queue core, independent of transport
pub struct QueueComponents {
    pub queue_store: Arc<dyn QueueStore>,
    pub link_store: Arc<dyn LinkStore>,
    pub policies: PolicyService,
    pub engine: QueueEngine,
    pub coordinator: RefreshCoordinator,
    pub validator: EligibilityValidator,
    pub links: LinkService,
    pub commands: Arc<CommandHandler>,
    pub presence: Arc<PresenceTracker>,
    dispatcher: Option<(OutcomeDispatcher, mpsc::Receiver<ValidationOutcome>)>,
}

impl QueueComponents {
    /// Build on fresh in-memory stores. Spawns the validator workers, so it
    /// must run inside a tokio runtime.
    pub fn assemble(config: &AppConfig, deps: Collaborators) -> Self {
        let queue_store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new(deps.clock.clone()));
        let link_store: Arc<dyn LinkStore> = Arc::new(InMemoryLinkStore::new(deps.clock.clone()));
        let policy_store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new(
            config.policy_defaults.clone(),
            deps.clock.clone(),
        ));
        Self::assemble_with_stores(config, deps, queue_store, link_store, policy_store)
    }

    pub fn assemble_with_stores(
        config: &AppConfig,
        deps: Collaborators,
        queue_store: Arc<dyn QueueStore>,
        link_store: Arc<dyn LinkStore>,
        policy_store: Arc<dyn PolicyStore>,
    ) -> Self {
        let Collaborators {
            clock,
            provider,
            presenter,
            notifier,
            metrics,
        } = deps;

        let policies = PolicyService::new(policy_store, config.policy_defaults.clone());
        let chain_settings = ChainSettings::from_config(&config.eligibility);
        let chain = Arc::new(EligibilityChain::new(
            provider.clone(),
            link_store.clone(),
            policies.clone(),
            clock.clone(),
            chain_settings.clone(),
        ));
        let (validator, outcomes) = EligibilityValidator::start(
            chain.clone(),
            ValidatorSettings::from_config(&config.eligibility),
            metrics.clone(),
        );

        let badges = Arc::new(LevelBadges::assemble(&config.badges));
        let engine = QueueEngine::new(
            queue_store.clone(),
            link_store.clone(),
            policies.clone(),
            clock.clone(),
            metrics.clone(),
            EngineSettings::from_config(&config.queue),
        )
        .with_badges(badges)
        .with_eligibility(chain, validator.clone());

        let coordinator = RefreshCoordinator::new(
            engine.clone(),
            presenter,
            clock.clone(),
            metrics.clone(),
            RefreshSettings::from_config(&config.queue),
        );
        let dispatcher = OutcomeDispatcher::new(
            notifier,
            queue_store.clone(),
            coordinator.clone(),
            clock.clone(),
            metrics.clone(),
            config.eligibility.evict_ineligible,
        );

        let links = LinkService::new(link_store.clone(), provider, clock.clone(), chain_settings);
        let classifier = VoiceClassifier::new(&config.voice);
        let commands = Arc::new(CommandHandler::new(
            engine.clone(),
            links.clone(),
            coordinator.clone(),
            classifier.clone(),
            config.click_window(),
            clock,
            metrics,
        ));
        let presence = Arc::new(PresenceTracker::new(
            engine.clone(),
            classifier,
            coordinator.clone(),
        ));

        Self {
            queue_store,
            link_store,
            policies,
            engine,
            coordinator,
            validator,
            links,
            commands,
            presence,
            dispatcher: Some((dispatcher, outcomes)),
        }
    }

    /// Start the outcome loop; `None` once it has been started
    pub fn spawn_dispatcher(&mut self) -> Option<JoinHandle<()>> {
        let (dispatcher, outcomes) = self.dispatcher.take()?;
        Some(tokio::spawn(dispatcher.run(outcomes)))
    }

    /// Start the supervisory sweep
    pub fn spawn_supervisor(&self) -> JoinHandle<()> {
        tokio::spawn(self.coordinator.clone().run_supervisor())
    }

    /// Periodically forget click-throttle state that has aged out
    pub fn spawn_throttle_pruner(&self, period: Duration) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let remaining = commands.prune_throttle();
                debug!("Click throttle pruned; {} users still tracked", remaining);
            }
        })
    }

    /// Cancel pending refreshes and stop the validation workers
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.validator.shutdown();
    }
}

/// Built-in provider loaded with the configured players
pub fn configured_provider(
    config: &AppConfig,
    clock: Arc<dyn Clock>,
) -> QueueResult<Arc<StaticEligibilityProvider>> {
    let provider = StaticEligibilityProvider::seeded(clock, &config.eligibility.players)?;
    if provider.player_count() == 0 {
        warn!("No players configured under eligibility.players; every link will be refused");
    } else {
        info!(
            "Eligibility provider loaded with {} players",
            provider.player_count()
        );
    }
    Ok(Arc::new(provider))
}

/// Routes decoded AMQP messages into the queue core
pub struct ServiceMessageHandler {
    commands: Arc<CommandHandler>,
    presence: Arc<PresenceTracker>,
    replies: Arc<dyn EventPublisher>,
}

impl ServiceMessageHandler {
    pub fn new(
        commands: Arc<CommandHandler>,
        presence: Arc<PresenceTracker>,
        replies: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            commands,
            presence,
            replies,
        }
    }
}

#[async_trait]
impl MessageHandler for ServiceMessageHandler {
    async fn handle_command(&self, request: CommandRequest) -> QueueResult<()> {
        let started = std::time::Instant::now();
        let reply = self.commands.handle(request).await;
        info!(
            "Command '{}' from '{}' in guild '{}' -> {} ({:.2}ms)",
            reply.command,
            reply.user_id,
            reply.guild_id,
            if reply.success { "ok" } else { "rejected" },
            started.elapsed().as_secs_f64() * 1000.0
        );
        self.replies.publish_reply(&reply).await
    }

    async fn handle_presence(&self, update: PresenceUpdate) -> QueueResult<()> {
        let changed = self
            .presence
            .on_voice_state(&update.guild_id, &update.user_id, &update.voice)
            .await?;
        debug!(
            "Presence update for '{}' in guild '{}' (entry changed: {})",
            update.user_id, update.guild_id, changed
        );
        Ok(())
    }

    async fn handle_error(&self, error: QueueError, message_data: &[u8]) {
        error!(
            "Inbound message rejected - error: '{}', message_size: {} bytes",
            error,
            message_data.len()
        );
        if !message_data.is_empty() {
            let preview_len = message_data.len().min(100);
            let preview = String::from_utf8_lossy(&message_data[..preview_len]);
            debug!("Message preview: {:?}", preview);
        }
    }
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    components: QueueComponents,
    amqp_connection: Arc<AmqpConnection>,
    publisher: Arc<AmqpEventPublisher>,
    metrics_service: Arc<MetricsService>,
    probe: ServiceProbe,
    consumers: Vec<InboundConsumer>,
    background_tasks: Vec<JoinHandle<()>>,
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Connect to the broker and wire every component
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing {} service", config.service.name);
        info!(
            "Configuration: service={}, amqp_url={}",
            config.service.name, config.amqp.url
        );

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let amqp_connection = Self::initialize_amqp(&config).await?;
        let publisher = Self::initialize_publisher(
            &config,
            amqp_connection.clone(),
            metrics_collector.clone(),
        )
        .await?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider = configured_provider(&config, clock.clone()).map_err(|e| {
            ServiceError::Configuration {
                message: format!("Failed to load eligibility players: {}", e),
            }
        })?;
        if config.eligibility.hub_id.is_empty() {
            warn!("No eligibility hub configured; membership checks use the in-memory provider");
        }
        let components = QueueComponents::assemble(
            &config,
            Collaborators {
                clock,
                provider,
                presenter: publisher.clone(),
                notifier: publisher.clone(),
                metrics: metrics_collector.clone(),
            },
        );

        let is_running = Arc::new(RwLock::new(false));
        let probe = ServiceProbe::new(
            config.service.name.clone(),
            components.engine.clone(),
            components.coordinator.clone(),
            is_running.clone(),
        )
        .with_amqp(amqp_connection.clone());

        let health_server = HealthServer::new(
            HealthServerConfig {
                port: config.service.health_port,
                host: "0.0.0.0".to_string(),
            },
            metrics_collector.clone(),
        )
        .with_probe(probe.clone());
        let metrics_service = Arc::new(MetricsService::new(
            metrics_collector,
            Arc::new(health_server),
        ));

        Ok(Self {
            config,
            components,
            amqp_connection,
            publisher,
            metrics_service,
            probe,
            consumers: Vec::new(),
            background_tasks: Vec::new(),
            is_running,
        })
    }

    /// Start the health server, the outcome loop, consumers and background tasks
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {} service", self.config.service.name);

        *self.is_running.write().await = true;

        self.start_metrics_service().await?;

        if let Some(dispatcher) = self.components.spawn_dispatcher() {
            self.background_tasks.push(dispatcher);
        }

        self.start_amqp_consumption().await?;
        self.start_background_tasks();

        info!("✅ {} service started successfully", self.config.service.name);
        Ok(())
    }

    /// Graceful shutdown: stop intake first, then timers and workers
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);

        *self.is_running.write().await = false;

        for consumer in self.consumers.drain(..) {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop AMQP consumer: {}", e);
            }
        }
        info!("✅ AMQP message consumption stopped");

        self.components.shutdown();
        self.stop_background_tasks().await;

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        } else {
            info!("✅ Metrics service stopped");
        }

        info!(
            "Final refresh statistics: {:?}",
            self.components.coordinator.stats()
        );
        info!("✅ {} shutdown completed", self.config.service.name);
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn components(&self) -> &QueueComponents {
        &self.components
    }

    pub fn probe(&self) -> &ServiceProbe {
        &self.probe
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    pub fn amqp_connection(&self) -> Arc<AmqpConnection> {
        self.amqp_connection.clone()
    }

    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        info!("Connecting to AMQP broker: {}", config.amqp.url);

        let amqp_config =
            AmqpConfig::from_settings(&config.amqp).map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?;

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        Ok(Arc::new(connection))
    }

    async fn open_channel(connection: &AmqpConnection) -> Result<Channel, ServiceError> {
        connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open AMQP channel: {}", e),
            })
    }

    async fn initialize_publisher(
        config: &AppConfig,
        connection: Arc<AmqpConnection>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Arc<AmqpEventPublisher>, ServiceError> {
        let channel = Self::open_channel(&connection).await?;
        let publisher_config = PublisherConfig {
            exchange: config.amqp.exchange_name.clone(),
            max_retries: config.amqp.max_retry_attempts,
            retry_delay_ms: config.amqp.retry_delay_ms,
        };
        let publisher = AmqpEventPublisher::new(channel, publisher_config, metrics)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize event publisher: {}", e),
            })?;
        Ok(Arc::new(publisher))
    }

    async fn start_metrics_service(&mut self) -> Result<(), ServiceError> {
        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.health_port;

        let handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            }
        });
        self.background_tasks.push(handle);

        // Let the listener bind before consumers start
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("✅ Health and metrics endpoints on port {}", port);
        Ok(())
    }

    async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), ServiceError> {
        let args = QueueDeclareArguments::new(queue)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel
            .queue_declare(args)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare queue {}: {}", queue, e),
            })?;
        info!("Queue '{}' declared", queue);
        Ok(())
    }

    async fn start_amqp_consumption(&mut self) -> Result<(), ServiceError> {
        info!("Starting AMQP message consumption...");

        let handler: Arc<dyn MessageHandler> = Arc::new(ServiceMessageHandler::new(
            self.components.commands.clone(),
            self.components.presence.clone(),
            self.publisher.clone(),
        ));
        let metrics = self.metrics_service.collector();

        let inbound = [
            (InboundKind::Command, self.config.amqp.command_queue.clone()),
            (InboundKind::Presence, self.config.amqp.presence_queue.clone()),
        ];
        for (kind, queue) in inbound {
            let channel = Self::open_channel(&self.amqp_connection).await?;
            Self::declare_queue(&channel, &queue).await?;

            let consumer = InboundConsumer::new(handler.clone(), metrics.clone(), channel, kind);
            consumer
                .start_consuming(&queue)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to start consuming {}: {}", queue, e),
                })?;
            self.consumers.push(consumer);
        }

        info!(
            "Listening for commands on '{}' and presence on '{}'",
            self.config.amqp.command_queue, self.config.amqp.presence_queue
        );
        Ok(())
    }

    fn start_background_tasks(&mut self) {
        info!(
            "Starting refresh supervisor ({}ms sweep)...",
            self.config.queue.sweep_interval_ms
        );
        let supervisor = self.components.spawn_supervisor();
        let throttle_pruner = self
            .components
            .spawn_throttle_pruner(THROTTLE_PRUNE_INTERVAL);

        info!("Starting health metrics task (60s interval)...");
        let health_metrics_task = {
            let metrics_collector = self.metrics_service.collector();
            let probe = self.probe.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                info!("Health metrics task started");

                while *is_running.read().await {
                    interval.tick().await;

                    let health = match HealthCheck::check(&probe).await {
                        Ok(health) => health,
                        Err(e) => {
                            warn!("Health check failed: {}", e);
                            continue;
                        }
                    };
                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(health.stats.uptime_seconds as i64);
                    metrics_collector.update_health_status(health.status.gauge());
                    for check in &health.checks {
                        metrics_collector.update_component_health(
                            &check.name,
                            check.status != HealthStatus::Unhealthy,
                        );
                    }
                    debug!(
                        "Health {} - {} guilds, {} entries, {} refresh cycles",
                        health.status,
                        health.stats.active_guilds,
                        health.stats.queued_entries,
                        health.stats.refresh.cycles
                    );
                }

                info!("Health metrics task stopped");
            })
        };

        self.background_tasks.push(supervisor);
        self.background_tasks.push(throttle_pruner);
        self.background_tasks.push(health_metrics_task);
        info!("{} background tasks running", self.background_tasks.len());
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for (i, task) in self.background_tasks.drain(..).enumerate() {
            debug!("Aborting background task {}/{}", i + 1, task_count);
            task.abort();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("✅ All {} background tasks stopped", task_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::MockEventPublisher;
    use crate::config::validate_config;
    use crate::eligibility::PlayerProfile;
    use crate::link::UserLink;
    use crate::types::{QueueCommand, VoiceState};

    fn components() -> (QueueComponents, Arc<MockEventPublisher>, Arc<StaticEligibilityProvider>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = Arc::new(MockEventPublisher::new());
        let provider = Arc::new(StaticEligibilityProvider::new(clock.clone()));
        let mut config = AppConfig::default();
        config.queue.debounce_ms = 10;
        let components = QueueComponents::assemble(
            &config,
            Collaborators {
                clock,
                provider: provider.clone(),
                presenter: events.clone(),
                notifier: events.clone(),
                metrics: Arc::new(MetricsCollector::new().unwrap()),
            },
        );
        (components, events, provider)
    }

    #[tokio::test]
    async fn test_dispatcher_spawns_once() {
        let (mut components, _, _) = components();
        let handle = components.spawn_dispatcher();
        assert!(handle.is_some());
        assert!(components.spawn_dispatcher().is_none());
        components.shutdown();
    }

    #[tokio::test]
    async fn test_message_handler_replies_and_tracks_presence() {
        let (components, events, _) = components();
        components
            .link_store
            .upsert_link(UserLink::new("u1", "ext-1", "Alpha", chrono::Utc::now()))
            .await
            .unwrap();

        let handler = ServiceMessageHandler::new(
            components.commands.clone(),
            components.presence.clone(),
            events.clone(),
        );
        handler
            .handle_command(CommandRequest {
                guild_id: "g1".to_string(),
                user_id: "u1".to_string(),
                is_admin: false,
                command: QueueCommand::Join { voice: None },
            })
            .await
            .unwrap();

        let replies = events.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].success);

        handler
            .handle_presence(PresenceUpdate {
                guild_id: "g1".to_string(),
                user_id: "u1".to_string(),
                voice: VoiceState::disconnected(),
            })
            .await
            .unwrap();
        let entry = components.engine.entry("g1", "u1").await.unwrap();
        assert_eq!(entry.status, crate::types::EntryStatus::Left);

        components.shutdown();
    }

    #[tokio::test]
    async fn test_configured_players_can_link_and_join() {
        let raw = r#"
            [queue]
            debounce_ms = 10

            [[eligibility.players]]
            nickname = "RealPlayer"
            external_id = "ext-real"
            skill_level = 7
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        validate_config(&config).unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider = configured_provider(&config, clock.clone()).unwrap();
        let events = Arc::new(MockEventPublisher::new());
        let components = QueueComponents::assemble(
            &config,
            Collaborators {
                clock,
                provider,
                presenter: events.clone(),
                notifier: events.clone(),
                metrics: Arc::new(MetricsCollector::new().unwrap()),
            },
        );

        let request = |command| CommandRequest {
            guild_id: "g1".to_string(),
            user_id: "u1".to_string(),
            is_admin: false,
            command,
        };
        let linked = components
            .commands
            .handle(request(QueueCommand::Link {
                nickname: "RealPlayer".to_string(),
            }))
            .await;
        assert!(linked.success, "{}", linked.message);

        let joined = components
            .commands
            .handle(request(QueueCommand::Join { voice: None }))
            .await;
        assert!(joined.success, "{}", joined.message);
        assert_eq!(components.engine.position("g1", "u1").await.unwrap(), Some(1));

        components.shutdown();
    }

    #[tokio::test]
    async fn test_link_through_assembled_components() {
        let (components, _, provider) = components();
        provider
            .add_player(
                PlayerProfile {
                    external_id: "ext-7".to_string(),
                    nickname: "Seven".to_string(),
                    elo: 1500,
                    skill_level: 7,
                },
                true,
            )
            .unwrap();

        let outcome = components.links.link("u7", "Seven").await.unwrap();
        assert!(outcome.to_string().contains("Seven"));
        assert!(components.links.whoami("u7").await.unwrap().is_some());
        components.shutdown();
    }
}
