//! Configuration types for the Tailscale sidecar.

use std::time::Duration;

use secrecy::SecretString;

/// Directory inside the sidecar where tailscaled keeps node state.
pub const STATE_DIR: &str = "/var/lib/tailscale";

/// Configuration for Tailscale sidecar containers.
#[derive(Debug, Clone)]
pub struct TailscaleConfig {
    /// Docker image to run.
    pub image: String,
    /// Pre-authorized key used to join the tailnet.
    pub auth_key: SecretString,
    /// MagicDNS suffix, e.g. `tail1234.ts.net`. Without it no URL is reported.
    pub tailnet: Option<String>,
    /// Prefix for node hostnames.
    pub hostname_prefix: String,
    /// Time to wait for the node to report `Running`.
    pub startup_timeout: Duration,
    /// Interval between status polls.
    pub health_poll_interval: Duration,
    /// HTTPS port served on the tailnet.
    pub https_port: u16,
}

impl Default for TailscaleConfig {
    fn default() -> Self {
        Self {
            image: "tailscale/tailscale:latest".to_string(),
            auth_key: SecretString::from(String::new()),
            tailnet: None,
            hostname_prefix: "sandbox".to_string(),
            startup_timeout: Duration::from_secs(60),
            health_poll_interval: Duration::from_millis(500),
            https_port: 443,
        }
    }
}

impl TailscaleConfig {
    /// Node hostname for a sandbox. Only DNS label characters survive.
    pub fn hostname(&self, sandbox_short_id: &str) -> String {
        let raw = format!("{}-{}", self.hostname_prefix, sandbox_short_id).to_ascii_lowercase();
        let label: String = raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        label.trim_matches('-').chars().take(63).collect()
    }

    /// Fully qualified tailnet name for a hostname, when the tailnet is known.
    pub fn fqdn(&self, hostname: &str) -> Option<String> {
        self.tailnet
            .as_deref()
            .map(|tailnet| format!("{}.{}", hostname, tailnet))
    }
}

/// Where a sidecar exposes its sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarEndpoint {
    /// Tailnet node hostname.
    pub hostname: String,
    /// Fully qualified name, if the tailnet is configured.
    pub fqdn: Option<String>,
    pub https_port: u16,
}

impl SidecarEndpoint {
    /// HTTPS URL on the tailnet.
    pub fn https_url(&self) -> Option<String> {
        let fqdn = self.fqdn.as_ref()?;
        if self.https_port == 443 {
            Some(format!("https://{}", fqdn))
        } else {
            Some(format!("https://{}:{}", fqdn, self.https_port))
        }
    }
}

impl std::fmt::Display for SidecarEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fqdn {
            Some(fqdn) => write!(f, "{}", fqdn),
            None => write!(f, "{}", self.hostname),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_is_dns_safe() {
        let config = TailscaleConfig {
            hostname_prefix: "Dev_Box".to_string(),
            ..Default::default()
        };
        assert_eq!(config.hostname("3f2a9c1e"), "dev-box-3f2a9c1e");
    }

    #[test]
    fn test_endpoint_url() {
        let config = TailscaleConfig {
            tailnet: Some("tail1234.ts.net".to_string()),
            ..Default::default()
        };
        let hostname = config.hostname("abcd1234");
        let endpoint = SidecarEndpoint {
            fqdn: config.fqdn(&hostname),
            hostname,
            https_port: 443,
        };
        assert_eq!(
            endpoint.https_url().as_deref(),
            Some("https://sandbox-abcd1234.tail1234.ts.net")
        );
        assert_eq!(endpoint.to_string(), "sandbox-abcd1234.tail1234.ts.net");
    }

    #[test]
    fn test_no_tailnet_no_url() {
        let endpoint = SidecarEndpoint {
            hostname: "sandbox-1".to_string(),
            fqdn: None,
            https_port: 8443,
        };
        assert!(endpoint.https_url().is_none());
        assert_eq!(endpoint.to_string(), "sandbox-1");
    }
}
