//! AMQP message definitions and serialization
//!
//! Inbound commands and presence updates arrive as bare JSON. Outbound events
//! are wrapped in a [`MessageEnvelope`] carrying a correlation id.

use crate::error::{QueueError, Result};
use crate::types::{CommandRequest, PresenceUpdate, QueueCommand};
use crate::utils::{current_timestamp, generate_correlation_id};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Routing keys for outbound events
pub const ROSTER_UPDATED_ROUTING_KEY: &str = "roster.updated";
pub const ELIGIBILITY_DENIED_ROUTING_KEY: &str = "eligibility.denied";
pub const COMMAND_REPLY_ROUTING_KEY: &str = "command.reply";

/// Longest nickname accepted by the link command
const MAX_NICKNAME_LEN: usize = 64;

/// Message envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(payload: T, routing_key: impl Into<String>) -> Self {
        Self {
            payload,
            correlation_id: generate_correlation_id(),
            timestamp: current_timestamp(),
            routing_key: routing_key.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            QueueError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            QueueError::InvalidMessage {
                reason: format!("Failed to deserialize envelope: {}", e),
            }
            .into()
        })
    }
}

/// Decoding and validation of inbound messages
pub struct MessageUtils;

impl MessageUtils {
    pub fn decode_command(bytes: &[u8]) -> Result<CommandRequest> {
        let request: CommandRequest = Self::decode(bytes, "command")?;
        Self::validate_command(&request)?;
        Ok(request)
    }

    pub fn decode_presence(bytes: &[u8]) -> Result<PresenceUpdate> {
        let update: PresenceUpdate = Self::decode(bytes, "presence update")?;
        Self::require("guild_id", &update.guild_id)?;
        Self::require("user_id", &update.user_id)?;
        Ok(update)
    }

    pub fn validate_command(request: &CommandRequest) -> Result<()> {
        Self::require("guild_id", &request.guild_id)?;
        Self::require("user_id", &request.user_id)?;

        match &request.command {
            QueueCommand::Kick { target_id } => Self::require("target_id", target_id),
            QueueCommand::Link { nickname } => {
                let nickname = nickname.trim();
                Self::require("nickname", nickname)?;
                if nickname.chars().count() > MAX_NICKNAME_LEN {
                    return Err(QueueError::InvalidMessage {
                        reason: format!("nickname longer than {} characters", MAX_NICKNAME_LEN),
                    }
                    .into());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| {
            QueueError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            QueueError::InvalidMessage {
                reason: format!("Failed to deserialize {}: {}", what, e),
            }
            .into()
        })
    }

    fn require(field: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(QueueError::InvalidMessage {
                reason: format!("{} cannot be empty", field),
            }
            .into());
        }
        Ok(())
    }
}
