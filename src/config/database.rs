use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Database container settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Image for the database container.
    pub image: String,
    /// Superuser name.
    pub user: String,
    /// Superuser password.
    pub password: SecretString,
    /// Service port inside the container.
    pub port: u16,
    /// DNS alias the application container reaches the database by.
    pub alias: String,
    /// How many readiness probes to run before giving up.
    pub ready_attempts: u32,
    /// Fixed delay between readiness probes.
    pub ready_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            image: "postgres:16".to_string(),
            user: "postgres".to_string(),
            password: SecretString::from("postgres"),
            port: 5432,
            alias: "db".to_string(),
            ready_attempts: 30,
            ready_interval: Duration::from_millis(1000),
        }
    }
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ready_attempts = parse_optional_env("SANDBOX_DB_READY_ATTEMPTS", defaults.ready_attempts)?;
        if ready_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_DB_READY_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            image: optional_env("SANDBOX_DB_IMAGE")?.unwrap_or(defaults.image),
            user: optional_env("SANDBOX_DB_USER")?.unwrap_or(defaults.user),
            password: optional_env("SANDBOX_DB_PASSWORD")?
                .map(SecretString::from)
                .unwrap_or(defaults.password),
            port: parse_optional_env("SANDBOX_DB_PORT", defaults.port)?,
            alias: optional_env("SANDBOX_DB_ALIAS")?.unwrap_or(defaults.alias),
            ready_attempts,
            ready_interval: Duration::from_millis(parse_optional_env(
                "SANDBOX_DB_READY_INTERVAL_MS",
                defaults.ready_interval.as_millis() as u64,
            )?),
        })
    }

    /// Connection URL for a database on this server, as seen from the app container.
    pub fn url_for(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user,
            urlencoding::encode(self.password.expose_secret()),
            self.alias,
            self.port,
            database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_escapes_password() {
        let config = DatabaseConfig {
            password: SecretString::from("p@ss/word"),
            ..Default::default()
        };
        assert_eq!(
            config.url_for("app_dev"),
            "postgres://postgres:p%40ss%2Fword@db:5432/app_dev"
        );
    }
}
