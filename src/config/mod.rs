//! Runtime configuration resolved from the environment.
//!
//! Each section resolves independently so a malformed variable reports the
//! exact key that failed. `.env` files are loaded by the binary before
//! [`Config::from_env`] runs.

mod database;
mod docker;
mod editor;
pub(crate) mod helpers;
mod sandbox;
mod sidecar;

pub use database::DatabaseConfig;
pub use docker::{DEFAULT_API_VERSION, DEFAULT_DOCKER_SOCKET, DockerConfig};
pub use editor::EditorConfig;
pub use sandbox::SandboxConfig;
pub use sidecar::SidecarConfig;

use crate::error::ConfigError;

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub docker: DockerConfig,
    pub sandbox: SandboxConfig,
    pub database: DatabaseConfig,
    pub editor: EditorConfig,
    pub sidecar: SidecarConfig,
}

impl Config {
    /// Resolve every section from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            docker: DockerConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
            database: DatabaseConfig::resolve()?,
            editor: EditorConfig::resolve()?,
            sidecar: SidecarConfig::resolve()?,
        })
    }
}
