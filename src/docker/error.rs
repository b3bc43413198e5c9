//! Error types for the Docker Engine client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for Docker operations.
pub type Result<T> = std::result::Result<T, DockerError>;

/// Errors raised by the Docker client and the exec stream protocol.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The Unix socket could not be opened.
    #[error("Docker socket {path} unreachable: {reason}")]
    Connect {
        /// Socket path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Reading or writing the connection failed mid-request.
    #[error("Docker transport error during {operation}: {reason}")]
    Transport {
        /// Operation being performed.
        operation: String,
        /// Underlying failure.
        reason: String,
    },

    /// The daemon answered with a non-success status.
    #[error("Docker API error {status} during {operation}: {message}")]
    Api {
        /// Operation being performed.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Decoded `message` from the error body, or the raw body.
        message: String,
    },

    /// The exec upgrade handshake returned something other than 101/200.
    #[error("Exec {exec_id} upgrade rejected with HTTP {status}: {message}")]
    UpgradeRejected {
        /// Exec instance id.
        exec_id: String,
        /// HTTP status code.
        status: u16,
        /// Whatever followed the response head.
        message: String,
    },

    /// The daemon sent bytes that do not parse.
    #[error("Malformed Docker response during {operation}: {reason}")]
    Protocol {
        /// Operation being performed.
        operation: String,
        /// What was wrong.
        reason: String,
    },

    /// The request did not complete in time.
    #[error("Docker {operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation being performed.
        operation: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// A request body could not be encoded.
    #[error("Failed to encode request for {operation}: {reason}")]
    Encode {
        /// Operation being performed.
        operation: String,
        /// Encoder failure.
        reason: String,
    },
}

impl DockerError {
    /// HTTP status for API errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::UpgradeRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the daemon reported the resource as absent.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// True for socket-level failures (as opposed to daemon answers).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Transport { .. } | Self::Timeout { .. }
        )
    }

    pub(crate) fn transport(operation: &str, reason: impl ToString) -> Self {
        Self::Transport {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn protocol(operation: &str, reason: impl ToString) -> Self {
        Self::Protocol {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Map a "not found" error to success. Used by teardown paths where an
/// already-absent resource is the desired end state.
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = DockerError::Api {
            operation: "remove container".to_string(),
            status: 404,
            message: "No such container: abc".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_transport());
        assert!(ignore_not_found(Err(err)).is_ok());
    }

    #[test]
    fn test_other_errors_propagate() {
        let err = DockerError::Api {
            operation: "remove container".to_string(),
            status: 409,
            message: "removal already in progress".to_string(),
        };
        assert!(ignore_not_found(Err(err)).is_err());

        let transport = DockerError::transport("inspect", "broken pipe");
        assert!(transport.is_transport());
        assert!(transport.status().is_none());
    }
}
