use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Tailscale HTTPS sidecar configuration.
///
/// The sidecar is optional: when disabled, or when no auth key is configured,
/// sandboxes are provisioned without tailnet exposure.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Whether sidecars are created at all.
    pub enabled: bool,
    /// Tailscale image.
    pub image: String,
    /// Pre-authorized key used to join the tailnet.
    pub auth_key: Option<SecretString>,
    /// MagicDNS suffix, e.g. `tail1234.ts.net`.
    pub tailnet: Option<String>,
    /// Prefix for node hostnames.
    pub hostname_prefix: String,
    /// Timeout in seconds for the node to come up.
    pub startup_timeout_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "tailscale/tailscale:latest".to_string(),
            auth_key: None,
            tailnet: None,
            hostname_prefix: "sandbox".to_string(),
            startup_timeout_secs: 60,
        }
    }
}

impl SidecarConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let enabled = parse_bool_env("TAILSCALE_ENABLED", defaults.enabled)?;
        let auth_key = optional_env("TAILSCALE_AUTHKEY")?.map(SecretString::from);

        if enabled && auth_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "TAILSCALE_AUTHKEY".to_string(),
                hint: "TAILSCALE_AUTHKEY is required when TAILSCALE_ENABLED=true".to_string(),
            });
        }

        Ok(Self {
            enabled,
            image: optional_env("TAILSCALE_IMAGE")?.unwrap_or(defaults.image),
            auth_key,
            tailnet: optional_env("TAILSCALE_TAILNET")?
                .map(|t| t.trim_start_matches('.').to_string()),
            hostname_prefix: optional_env("TAILSCALE_HOSTNAME_PREFIX")?
                .unwrap_or(defaults.hostname_prefix),
            startup_timeout_secs: parse_optional_env(
                "TAILSCALE_STARTUP_TIMEOUT_SECS",
                defaults.startup_timeout_secs,
            )?,
        })
    }

    /// Build the sidecar manager configuration, or `None` when sidecars are off.
    pub fn to_tailscale_config(&self) -> Option<crate::sidecar::TailscaleConfig> {
        if !self.enabled {
            return None;
        }
        let auth_key = self.auth_key.clone()?;

        Some(crate::sidecar::TailscaleConfig {
            image: self.image.clone(),
            auth_key,
            tailnet: self.tailnet.clone(),
            hostname_prefix: self.hostname_prefix.clone(),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            ..Default::default()
        })
    }
}
