//! Server configuration

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Application configuration
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Build the billing service at startup (ENABLE_BILLING, default true)
    pub enable_billing: bool,
    /// Apply bundled migrations at startup (RUN_MIGRATIONS, default false)
    pub run_migrations: bool,
    /// Bearer token for /admin routes. Admin routes are disabled when unset.
    pub admin_api_token: Option<String>,
    pub database_max_connections: u32,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[redacted]")
            .field("bind_address", &self.bind_address)
            .field("enable_billing", &self.enable_billing)
            .field("run_migrations", &self.run_migrations)
            .field(
                "admin_api_token",
                &self.admin_api_token.as_ref().map(|_| "[redacted]"),
            )
            .field("database_max_connections", &self.database_max_connections)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bind_address =
            lookup("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let enable_billing = parse_bool("ENABLE_BILLING", lookup("ENABLE_BILLING"), true)?;
        let run_migrations = parse_bool("RUN_MIGRATIONS", lookup("RUN_MIGRATIONS"), false)?;

        let admin_api_token = lookup("ADMIN_API_TOKEN").filter(|v| !v.is_empty());

        let database_max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw.parse::<u32>().map_err(|_| ConfigError::Invalid {
                name: "DATABASE_MAX_CONNECTIONS",
                value: raw,
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Self {
            database_url,
            bind_address,
            enable_billing,
            run_migrations,
            admin_api_token,
            database_max_connections,
        })
    }
}

fn parse_bool(
    name: &'static str,
    raw: Option<String>,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = raw else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/tradepost")]).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.enable_billing);
        assert!(!config.run_migrations);
        assert!(config.admin_api_token.is_none());
        assert_eq!(config.database_max_connections, 10);
    }

    #[test]
    fn test_database_url_required() {
        assert!(matches!(
            config(&[]),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn test_flags_and_token() {
        let config = config(&[
            ("DATABASE_URL", "postgres://localhost/tradepost"),
            ("ENABLE_BILLING", "false"),
            ("RUN_MIGRATIONS", "1"),
            ("ADMIN_API_TOKEN", "s3cret"),
            ("DATABASE_MAX_CONNECTIONS", "25"),
        ])
        .unwrap();
        assert!(!config.enable_billing);
        assert!(config.run_migrations);
        assert_eq!(config.admin_api_token.as_deref(), Some("s3cret"));
        assert_eq!(config.database_max_connections, 25);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config(&[("DATABASE_URL", "x"), ("ENABLE_BILLING", "maybe")]),
            Err(ConfigError::Invalid { name: "ENABLE_BILLING", .. })
        ));
        assert!(matches!(
            config(&[("DATABASE_URL", "x"), ("DATABASE_MAX_CONNECTIONS", "lots")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = config(&[
            ("DATABASE_URL", "postgres://user:pw@db/tradepost"),
            ("ADMIN_API_TOKEN", "s3cret"),
        ])
        .unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("pw@db"));
        assert!(!rendered.contains("s3cret"));
    }
}
