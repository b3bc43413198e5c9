use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Application container settings shared by every sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image for the application container.
    pub app_image: String,
    /// Prefix for every Docker resource name created for a sandbox.
    pub name_prefix: String,
    /// Port the application listens on inside the container.
    pub service_port: u16,
    /// Working directory for scripts and sessions.
    pub workdir: String,
    /// UID given to the unprivileged sandbox user.
    pub user_uid: u32,
    /// Grace period passed to Docker when stopping containers.
    pub stop_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            app_image: "mcr.microsoft.com/devcontainers/base:ubuntu".to_string(),
            name_prefix: "devsandbox".to_string(),
            service_port: 4000,
            workdir: "/workspace".to_string(),
            user_uid: 1000,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workdir = optional_env("SANDBOX_WORKDIR")?.unwrap_or(defaults.workdir);
        if !workdir.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_WORKDIR".to_string(),
                message: "must be an absolute path".to_string(),
            });
        }

        let name_prefix = optional_env("SANDBOX_NAME_PREFIX")?.unwrap_or(defaults.name_prefix);
        if !name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_NAME_PREFIX".to_string(),
                message: "may only contain letters, digits, '-' and '_'".to_string(),
            });
        }

        Ok(Self {
            app_image: optional_env("SANDBOX_APP_IMAGE")?.unwrap_or(defaults.app_image),
            name_prefix,
            service_port: parse_optional_env("SANDBOX_SERVICE_PORT", defaults.service_port)?,
            workdir,
            user_uid: parse_optional_env("SANDBOX_USER_UID", defaults.user_uid)?,
            stop_timeout: Duration::from_secs(parse_optional_env(
                "SANDBOX_STOP_TIMEOUT_SECS",
                defaults.stop_timeout.as_secs(),
            )?),
        })
    }
}
