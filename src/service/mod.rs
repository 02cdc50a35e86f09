//! Service layer for the queue-keeper service
//!
//! Application state, component wiring, health checks and background task
//! management for the production service.

pub mod app;
pub mod health;

pub use app::{AppState, Collaborators, QueueComponents, ServiceError, ServiceMessageHandler};
pub use health::{ComponentCheck, HealthCheck, HealthStatus, ServiceProbe, ServiceStats};
