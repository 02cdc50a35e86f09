//! Configuration management for the queue-keeper service
//!
//! This module handles configuration loading from environment variables and
//! TOML files, validation, default values and the startup-assembled badge table.

pub mod app;
pub mod badges;

// Re-export commonly used types
pub use app::{
    parse_player_seeds, validate_config, AmqpSettings, AppConfig, EligibilitySettings,
    PlayerSeed, PolicyDefaults, QueueSettings, ServiceSettings, VoiceSettings,
};
pub use badges::{BadgeSettings, EmojiRef, LevelBadges};
