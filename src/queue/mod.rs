//! Waiting-list lifecycle
//!
//! [`QueueEngine`] owns the entry state machine, [`PresenceTracker`] maps voice
//! activity onto it and [`CommandHandler`] serves user commands.

pub mod commands;
pub mod engine;
pub mod presence;

pub use commands::CommandHandler;
pub use engine::{describe_roster, EngineSettings, JoinOutcome, LeaveOutcome, QueueEngine};
pub use presence::{AwayReason, PresenceTracker, VoiceClass, VoiceClassifier};
