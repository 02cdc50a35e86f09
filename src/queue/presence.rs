//! Voice presence translation
//!
//! Raw voice state becomes one of three classes, and each class maps to one
//! presence transition on the engine. Nothing here keeps state between events.

use tracing::debug;

use crate::config::VoiceSettings;
use crate::error::Result;
use crate::refresh::RefreshCoordinator;
use crate::types::{PresenceTransition, VoiceState};

use super::QueueEngine;

/// Why a voice state does not count as being present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwayReason {
    Disconnected,
    OutsideCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceClass {
    Valid,
    Afk,
    Away(AwayReason),
}

impl VoiceClass {
    pub fn transition(&self) -> PresenceTransition {
        match self {
            VoiceClass::Valid => PresenceTransition::TouchValid,
            VoiceClass::Afk => PresenceTransition::MarkAfk,
            VoiceClass::Away(_) => PresenceTransition::MarkLeft,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, VoiceClass::Valid)
    }
}

/// Classifies voice state against the configured AFK channel and category
#[derive(Debug, Clone, Default)]
pub struct VoiceClassifier {
    afk_channel_id: Option<String>,
    allowed_category_id: Option<String>,
    deafened_is_afk: bool,
}

impl VoiceClassifier {
    pub fn new(settings: &VoiceSettings) -> Self {
        Self {
            afk_channel_id: settings.afk_channel_id.clone(),
            allowed_category_id: settings.allowed_category_id.clone(),
            deafened_is_afk: settings.deafened_is_afk,
        }
    }

    pub fn classify(&self, state: &VoiceState) -> VoiceClass {
        let Some(channel) = state.channel_id.as_deref() else {
            return VoiceClass::Away(AwayReason::Disconnected);
        };

        if self.afk_channel_id.as_deref() == Some(channel) {
            return VoiceClass::Afk;
        }

        if let Some(allowed) = self.allowed_category_id.as_deref() {
            if state.category_id.as_deref() != Some(allowed) {
                return VoiceClass::Away(AwayReason::OutsideCategory);
            }
        }

        if self.deafened_is_afk && state.self_deafened {
            return VoiceClass::Afk;
        }

        VoiceClass::Valid
    }
}

/// Applies voice events to the queue and requests a refresh for each
#[derive(Clone)]
pub struct PresenceTracker {
    engine: QueueEngine,
    classifier: VoiceClassifier,
    coordinator: RefreshCoordinator,
}

impl PresenceTracker {
    pub fn new(
        engine: QueueEngine,
        classifier: VoiceClassifier,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            engine,
            classifier,
            coordinator,
        }
    }

    pub fn classifier(&self) -> &VoiceClassifier {
        &self.classifier
    }

    /// Returns whether the user's entry changed
    pub async fn on_voice_state(
        &self,
        guild_id: &str,
        user_id: &str,
        state: &VoiceState,
    ) -> Result<bool> {
        let class = self.classifier.classify(state);
        let transition = class.transition();
        debug!(
            "Voice state for '{}' in guild '{}' classified as {:?}",
            user_id, guild_id, class
        );

        let applied = self
            .engine
            .apply_presence(guild_id, user_id, transition)
            .await;
        self.coordinator.request_refresh(guild_id);
        applied
    }
}
