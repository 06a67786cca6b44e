//! Bus service configuration.
//!
//! Configuration is loaded from environment variables. Numeric values that
//! fail to parse fall back to their defaults; values that parse but are out
//! of range are rejected.

use common::names::{validate_unique_name, validate_well_known_name};
use common::types::SessionPort;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default accept-policy timeout in milliseconds.
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 5_000;

/// Default transport establishment timeout in milliseconds.
pub const DEFAULT_ESTABLISH_TIMEOUT_MS: u64 = 10_000;

/// Default teardown deadline in milliseconds.
pub const DEFAULT_TEARDOWN_DEADLINE_MS: u64 = 2_000;

/// Default number of name table lock shards.
pub const DEFAULT_NAME_TABLE_SHARDS: usize = 16;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default session port hosted by the service binary.
pub const DEFAULT_SESSION_PORT: SessionPort = 42;

/// Tunables the attachment needs at runtime.
#[derive(Debug, Clone)]
pub struct AttachmentConfig {
    /// Unique name of the local attachment (host id for sessions).
    pub unique_name: String,
    /// Bound on awaiting an accept policy.
    pub accept_timeout: Duration,
    /// Bound on awaiting transport establishment.
    pub establish_timeout: Duration,
    /// Bound on the whole teardown sequence.
    pub teardown_deadline: Duration,
    /// Number of name table lock shards.
    pub name_table_shards: usize,
}

impl AttachmentConfig {
    /// Defaults with the given unique name.
    #[must_use]
    pub fn new(unique_name: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            accept_timeout: Duration::from_millis(DEFAULT_ACCEPT_TIMEOUT_MS),
            establish_timeout: Duration::from_millis(DEFAULT_ESTABLISH_TIMEOUT_MS),
            teardown_deadline: Duration::from_millis(DEFAULT_TEARDOWN_DEADLINE_MS),
            name_table_shards: DEFAULT_NAME_TABLE_SHARDS,
        }
    }
}

/// Bus service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application name, used in logs and the status endpoint.
    pub application_name: String,

    /// Unique name of this attachment (default: ":<8 hex>.1").
    pub unique_name: String,

    /// Accept policy timeout in milliseconds (default: 5000).
    pub accept_timeout_ms: u64,

    /// Transport establishment timeout in milliseconds (default: 10000).
    pub establish_timeout_ms: u64,

    /// Teardown deadline in milliseconds (default: 2000).
    pub teardown_deadline_ms: u64,

    /// Name table shard count (default: 16).
    pub name_table_shards: usize,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Session port hosted on startup (default: 42).
    pub session_port: SessionPort,

    /// Well-known name advertised on startup, if any.
    pub advertised_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let application_name = vars
            .get("BUS_APPLICATION_NAME")
            .ok_or_else(|| ConfigError::MissingEnvVar("BUS_APPLICATION_NAME".to_string()))?
            .clone();

        if application_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "BUS_APPLICATION_NAME must not be empty".to_string(),
            ));
        }

        let unique_name = match vars.get("BUS_UNIQUE_NAME") {
            Some(name) => {
                validate_unique_name(name).map_err(|e| {
                    ConfigError::InvalidValue(format!("BUS_UNIQUE_NAME: {e}"))
                })?;
                name.clone()
            }
            None => {
                let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
                let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
                format!(":{short_suffix}.1")
            }
        };

        let accept_timeout_ms = vars
            .get("BUS_ACCEPT_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_ACCEPT_TIMEOUT_MS);

        let establish_timeout_ms = vars
            .get("BUS_ESTABLISH_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_ESTABLISH_TIMEOUT_MS);

        let teardown_deadline_ms = vars
            .get("BUS_TEARDOWN_DEADLINE_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TEARDOWN_DEADLINE_MS);

        let name_table_shards = vars
            .get("BUS_NAME_TABLE_SHARDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_NAME_TABLE_SHARDS);

        if name_table_shards == 0 {
            return Err(ConfigError::InvalidValue(
                "BUS_NAME_TABLE_SHARDS must be greater than 0".to_string(),
            ));
        }

        let health_bind_address = vars
            .get("BUS_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let session_port = vars
            .get("BUS_SESSION_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SESSION_PORT);

        let advertised_name = match vars.get("BUS_ADVERTISED_NAME") {
            Some(name) => {
                validate_well_known_name(name).map_err(|e| {
                    ConfigError::InvalidValue(format!("BUS_ADVERTISED_NAME: {e}"))
                })?;
                Some(name.clone())
            }
            None => None,
        };

        Ok(Config {
            application_name,
            unique_name,
            accept_timeout_ms,
            establish_timeout_ms,
            teardown_deadline_ms,
            name_table_shards,
            health_bind_address,
            session_port,
            advertised_name,
        })
    }

    /// Runtime tunables for the attachment.
    #[must_use]
    pub fn attachment_config(&self) -> AttachmentConfig {
        AttachmentConfig {
            unique_name: self.unique_name.clone(),
            accept_timeout: Duration::from_millis(self.accept_timeout_ms),
            establish_timeout: Duration::from_millis(self.establish_timeout_ms),
            teardown_deadline: Duration::from_millis(self.teardown_deadline_ms),
            name_table_shards: self.name_table_shards,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "BUS_APPLICATION_NAME".to_string(),
            "chat-sample".to_string(),
        )])
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_vars(&base_vars()).expect("config should load");

        assert_eq!(config.application_name, "chat-sample");
        assert_eq!(config.accept_timeout_ms, DEFAULT_ACCEPT_TIMEOUT_MS);
        assert_eq!(config.establish_timeout_ms, DEFAULT_ESTABLISH_TIMEOUT_MS);
        assert_eq!(config.teardown_deadline_ms, DEFAULT_TEARDOWN_DEADLINE_MS);
        assert_eq!(config.name_table_shards, DEFAULT_NAME_TABLE_SHARDS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.session_port, 42);
        assert!(config.advertised_name.is_none());
        assert!(config.unique_name.starts_with(':'));
        assert!(config.unique_name.ends_with(".1"));
        assert!(validate_unique_name(&config.unique_name).is_ok());
    }

    #[test]
    fn test_config_missing_application_name() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "BUS_APPLICATION_NAME"));
    }

    #[test]
    fn test_config_overrides() {
        let mut vars = base_vars();
        vars.insert("BUS_UNIQUE_NAME".to_string(), ":host.7".to_string());
        vars.insert("BUS_ACCEPT_TIMEOUT_MS".to_string(), "250".to_string());
        vars.insert("BUS_ESTABLISH_TIMEOUT_MS".to_string(), "750".to_string());
        vars.insert("BUS_NAME_TABLE_SHARDS".to_string(), "4".to_string());
        vars.insert("BUS_SESSION_PORT".to_string(), "1234".to_string());
        vars.insert(
            "BUS_ADVERTISED_NAME".to_string(),
            "org.example.Chat".to_string(),
        );

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.unique_name, ":host.7");
        assert_eq!(config.session_port, 1234);
        assert_eq!(config.advertised_name.as_deref(), Some("org.example.Chat"));

        let attachment = config.attachment_config();
        assert_eq!(attachment.accept_timeout, Duration::from_millis(250));
        assert_eq!(attachment.establish_timeout, Duration::from_millis(750));
        assert_eq!(attachment.name_table_shards, 4);
    }

    #[test]
    fn test_config_unparsable_numbers_fall_back() {
        let mut vars = base_vars();
        vars.insert("BUS_ACCEPT_TIMEOUT_MS".to_string(), "soon".to_string());
        vars.insert("BUS_SESSION_PORT".to_string(), "70000".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.accept_timeout_ms, DEFAULT_ACCEPT_TIMEOUT_MS);
        assert_eq!(config.session_port, DEFAULT_SESSION_PORT);
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let mut vars = base_vars();
        vars.insert("BUS_NAME_TABLE_SHARDS".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("BUS_ADVERTISED_NAME".to_string(), "nodots".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("BUS_UNIQUE_NAME".to_string(), "no-colon.1".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
