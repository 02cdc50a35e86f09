//! Queue Keeper - guild waiting-list service
//!
//! Keeps one FIFO waiting list per guild, demotes entries when their owners
//! go AFK or leave voice, prunes them once their grace window runs out, and
//! re-renders each guild's roster through a debounced refresh coordinator.
//! Eligibility against an external match provider is checked after a join,
//! off the request path.

pub mod amqp;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod link;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod refresh;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{QueueError, Result};
pub use types::*;

// Re-export key components
pub use amqp::publisher::EventPublisher;
pub use queue::{CommandHandler, PresenceTracker, QueueEngine};
pub use refresh::{RefreshCoordinator, RosterPresenter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
