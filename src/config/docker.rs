use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Default Docker Engine socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Docker Engine API version prefix used for every request path.
pub const DEFAULT_API_VERSION: &str = "v1.43";

/// Connection settings for the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path to the Engine's Unix domain socket.
    pub socket_path: PathBuf,
    /// API version path prefix, e.g. `v1.43`.
    pub api_version: String,
    /// Upper bound for a regular API request.
    pub request_timeout: Duration,
    /// Upper bound for an image pull.
    pub pull_timeout: Duration,
    /// Upper bound for a non-interactive exec (bootstrap scripts included).
    pub exec_timeout: Duration,
    /// Upper bound for opening a socket and completing the upgrade handshake.
    pub connect_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
            pull_timeout: Duration::from_secs(600),
            exec_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl DockerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_version = optional_env("DOCKER_API_VERSION")?
            .map(|v| normalize_api_version(&v))
            .unwrap_or(defaults.api_version);

        Ok(Self {
            socket_path: optional_env("DOCKER_SOCKET")?
                .map(|raw| PathBuf::from(raw.trim_start_matches("unix://")))
                .unwrap_or(defaults.socket_path),
            api_version,
            request_timeout: Duration::from_secs(parse_optional_env(
                "DOCKER_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            pull_timeout: Duration::from_secs(parse_optional_env(
                "DOCKER_PULL_TIMEOUT_SECS",
                defaults.pull_timeout.as_secs(),
            )?),
            exec_timeout: Duration::from_secs(parse_optional_env(
                "DOCKER_EXEC_TIMEOUT_SECS",
                defaults.exec_timeout.as_secs(),
            )?),
            connect_timeout: Duration::from_secs(parse_optional_env(
                "DOCKER_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
        })
    }
}

/// Accept `1.43`, `v1.43` or `/v1.43` and return `v1.43`.
fn normalize_api_version(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('/');
    if trimmed.starts_with('v') {
        trimmed.to_string()
    } else {
        format!("v{}", trimmed)
    }
}
