//! Error types for sidecar management.

use thiserror::Error;

use crate::docker::DockerError;

/// Result type for sidecar operations.
pub type Result<T> = std::result::Result<T, SidecarError>;

/// Errors that can occur during sidecar management.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// Failed to pull the image.
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed {
        /// Image name.
        image: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to create the state volume.
    #[error("Failed to create volume '{name}': {reason}")]
    VolumeCreationFailed {
        /// Volume name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to create the container.
    #[error("Failed to create container '{name}': {reason}")]
    ContainerCreationFailed {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to start the container.
    #[error("Failed to start container '{name}': {reason}")]
    ContainerStartFailed {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Node did not reach `Running` within the timeout.
    #[error("Container '{name}' failed health check within {timeout:?}: {reason}")]
    HealthCheckFailed {
        /// Container name.
        name: String,
        /// Timeout duration.
        timeout: std::time::Duration,
        /// Reason for failure.
        reason: String,
    },

    /// Container stopped unexpectedly.
    #[error("Container '{name}' stopped unexpectedly")]
    ContainerStopped {
        /// Container name.
        name: String,
    },

    /// `tailscale serve` failed.
    #[error("Failed to configure HTTPS serving on '{name}': {reason}")]
    ServeFailed {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Any other Docker failure.
    #[error(transparent)]
    Docker(#[from] DockerError),
}
