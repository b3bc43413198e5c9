//! Proactive Docker detection with platform-specific guidance.
//!
//! Distinguishes a missing socket (Docker not installed, or installed
//! somewhere else) from a socket that exists but whose daemon does not
//! answer `/_ping`, and provides platform-appropriate hints for both.

use std::path::Path;

use crate::docker::api::DockerApi;
use crate::docker::types::VersionInfo;

/// Docker daemon availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerStatus {
    /// Socket present and daemon responding to ping.
    Available,
    /// No socket at the configured path.
    SocketMissing,
    /// Socket present but daemon not responding.
    NotRunning,
}

impl DockerStatus {
    /// Returns true if Docker is available and ready.
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available)
    }

    /// Human-readable status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStatus::Available => "available",
            DockerStatus::SocketMissing => "socket missing",
            DockerStatus::NotRunning => "not running",
        }
    }
}

/// Host platform for install guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    /// Detect the current platform.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    /// Installation instructions for Docker on this platform.
    pub fn install_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/mac-install/"
            }
            Platform::Linux => "Install Docker Engine: https://docs.docker.com/engine/install/",
            Platform::Windows => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/windows-install/"
            }
        }
    }

    /// Instructions to start the Docker daemon on this platform.
    pub fn start_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => "Start Docker Desktop from Applications, or run: open -a Docker",
            Platform::Linux => "Start the Docker daemon: sudo systemctl start docker",
            Platform::Windows => "Start Docker Desktop from the Start menu",
        }
    }
}

/// Result of a Docker detection check.
#[derive(Debug, Clone)]
pub struct DockerDetection {
    pub status: DockerStatus,
    pub platform: Platform,
    /// Daemon version, when it answered.
    pub version: Option<VersionInfo>,
}

impl DockerDetection {
    /// The hint to show for a non-available status.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status {
            DockerStatus::Available => None,
            DockerStatus::SocketMissing => Some(self.platform.install_hint()),
            DockerStatus::NotRunning => Some(self.platform.start_hint()),
        }
    }
}

/// Check whether the daemon behind `socket_path` is reachable.
///
/// 1. Checks the socket file exists
/// 2. Pings the daemon through `docker`
/// 3. Fetches the version for display (failure here is not fatal)
pub async fn check_docker(docker: &dyn DockerApi, socket_path: &Path) -> DockerDetection {
    let platform = Platform::current();

    if !socket_path.exists() {
        return DockerDetection {
            status: DockerStatus::SocketMissing,
            platform,
            version: None,
        };
    }

    if let Err(e) = docker.ping().await {
        tracing::debug!(socket = %socket_path.display(), "Docker ping failed: {}", e);
        return DockerDetection {
            status: DockerStatus::NotRunning,
            platform,
            version: None,
        };
    }

    let version = match docker.version().await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("Docker version lookup failed: {}", e);
            None
        }
    };

    DockerDetection {
        status: DockerStatus::Available,
        platform,
        version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubDocker;

    #[test]
    fn test_install_hint_not_empty() {
        for platform in [Platform::MacOS, Platform::Linux, Platform::Windows] {
            assert!(!platform.install_hint().is_empty());
            assert!(!platform.start_hint().is_empty());
        }
    }

    #[test]
    fn test_docker_status_display() {
        assert_eq!(DockerStatus::Available.as_str(), "available");
        assert_eq!(DockerStatus::SocketMissing.as_str(), "socket missing");
        assert_eq!(DockerStatus::NotRunning.as_str(), "not running");
        assert!(DockerStatus::Available.is_ok());
        assert!(!DockerStatus::NotRunning.is_ok());
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let docker = StubDocker::new();
        let result = check_docker(&docker, &dir.path().join("docker.sock")).await;
        assert_eq!(result.status, DockerStatus::SocketMissing);
        assert_eq!(result.hint(), Some(result.platform.install_hint()));
    }

    #[tokio::test]
    async fn test_unresponsive_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        std::fs::write(&socket, b"").unwrap();

        let docker = StubDocker::new();
        docker.set_daemon_down(true);
        let result = check_docker(&docker, &socket).await;
        assert_eq!(result.status, DockerStatus::NotRunning);
        assert_eq!(result.hint(), Some(result.platform.start_hint()));
    }

    #[tokio::test]
    async fn test_available_daemon_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        std::fs::write(&socket, b"").unwrap();

        let result = check_docker(&StubDocker::new(), &socket).await;
        assert!(result.status.is_ok());
        assert!(result.hint().is_none());
        assert!(result.version.is_some());
    }
}
