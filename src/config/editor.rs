use crate::config::helpers::{optional_env, parse_list_env, parse_optional_env};
use crate::error::ConfigError;

/// Browser IDE (code-server) settings.
#[derive(Debug, Clone)]
pub struct EditorConfig {
    /// Port code-server binds to inside the container.
    pub port: u16,
    /// Install script fetched when the binary is missing.
    pub install_url: String,
    /// Extension identifiers installed once the server reports ready.
    pub extensions: Vec<String>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            install_url: "https://code-server.dev/install.sh".to_string(),
            extensions: Vec::new(),
        }
    }
}

impl EditorConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            port: parse_optional_env("CODE_SERVER_PORT", defaults.port)?,
            install_url: optional_env("CODE_SERVER_INSTALL_URL")?.unwrap_or(defaults.install_url),
            extensions: parse_list_env("CODE_SERVER_EXTENSIONS")?,
        })
    }
}
