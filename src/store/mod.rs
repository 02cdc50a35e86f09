//! Storage collaborators for queue entries, guild policies and user links
//!
//! Each store is an async trait with an in-memory implementation; a durable
//! backend only has to honour the same per-key atomicity.

pub mod link;
pub mod policy;
pub mod queue;

pub use link::{InMemoryLinkStore, LinkStore};
pub use policy::{InMemoryPolicyStore, PolicyStore};
pub use queue::{InMemoryQueueStore, QueueStore};
