//! AMQP integration for the queue service
//!
//! Inbound commands and voice presence updates are consumed from two queues;
//! rosters, denial notices and command replies are published to one exchange.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{InboundConsumer, InboundKind, MessageHandler, MockMessageHandler};
pub use messages::*;
pub use publisher::{AmqpEventPublisher, EventPublisher, MockEventPublisher, PublisherConfig};
