//! Orchestrator error types.

use thiserror::Error;
use uuid::Uuid;

use crate::archive::ArchiveError;
use crate::docker::DockerError;
use crate::error::StoreError;
use crate::orchestrator::state::TransitionError;
use crate::template::TemplateError;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The requested operation is not legal in the sandbox's current state.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Sandbox {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A provisioning step failed; the message is what lands in `last_error`.
    #[error("{step}: {message}")]
    Step { step: &'static str, message: String },

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The sandbox's worker went away before replying.
    #[error("Sandbox worker for {0} is unavailable")]
    Unavailable(Uuid),
}

impl OrchestratorError {
    pub(crate) fn step(step: &'static str, message: impl ToString) -> Self {
        Self::Step {
            step,
            message: message.to_string(),
        }
    }
}
