//! Crate-level error types shared across subsystems.
//!
//! Subsystems with richer failure modes (Docker, sessions, sidecar,
//! orchestrator) define their own error enums next to their code.

use thiserror::Error;

/// Configuration resolution errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Missing required configuration {key}: {hint}")]
    MissingRequired {
        /// Variable name.
        key: String,
        /// How to fix it.
        hint: String,
    },

    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Parse failure description.
        message: String,
    },
}

/// Persistence collaborator errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the given id.
    #[error("Sandbox {0} not found")]
    NotFound(uuid::Uuid),

    /// The backing store rejected the operation.
    #[error("Store backend error: {0}")]
    Backend(String),
}
