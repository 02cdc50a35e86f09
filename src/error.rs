//! Error types for the queue service
//!
//! Typed failures are raised as [`QueueError`] and carried through
//! `anyhow::Result` so callers can downcast when they need to branch on kind.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Failure kinds surfaced by the queue engine and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("User is not linked to an external account: {user_id}")]
    NotLinked { user_id: String },

    #[error("No queue entry for user {user_id} in guild {guild_id}")]
    NotFound { guild_id: String, user_id: String },

    #[error("Policy unavailable for guild {guild_id}: {message}")]
    PolicyUnavailable { guild_id: String, message: String },

    #[error("Eligibility provider timed out during {operation}")]
    ProviderTimeout { operation: String },

    #[error("Eligibility provider failed during {operation}: {message}")]
    ProviderError { operation: String, message: String },

    #[error("Storage constraint violated: {message}")]
    ConstraintViolation { message: String },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl QueueError {
    /// Shorthand for the lock-poisoning failures raised by in-memory stores
    pub fn lock(name: &str) -> Self {
        QueueError::InternalError {
            message: format!("Failed to acquire {} lock", name),
        }
    }

    /// Whether this error came from the external eligibility provider
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            QueueError::ProviderTimeout { .. } | QueueError::ProviderError { .. }
        )
    }
}
