//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use crate::introspection::IdentifierCase;
use crate::snapshot::{SnapshotOptions, DEFAULT_BATCH_SIZE};
use crate::type_mapper::{CanonicalType, TypeMapper};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// Source database configuration
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// `postgres://…`, `sqlite://path` or `sqlite::memory:`
    pub url: String,
    /// Schema searched for tables (PostgreSQL)
    pub schema: String,
    pub max_connections: usize,
}

/// Local snapshot store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Table definitions file preloaded into the schema cache
    pub table_definitions: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./snapshots.db"),
            table_definitions: None,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub snapshot: SnapshotOptions,
    pub cors: CorsConfig,
}

impl Settings {
    /// Load settings from `.env` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server = ServerConfig {
            host: parse_or(var("HOST"), "HOST", ServerConfig::default().host)?,
            port: parse_or(var("PORT"), "PORT", ServerConfig::default().port)?,
        };

        let url = var("SOURCE_URL").ok_or_else(|| ConfigError::MissingVar("SOURCE_URL".to_string()))?;
        validate_source_url(&url)?;
        let source = SourceConfig {
            url,
            schema: var("SOURCE_SCHEMA").unwrap_or_else(|| "public".to_string()),
            max_connections: parse_or(var("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", 10)?,
        };

        let store = StoreConfig {
            path: var("STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| StoreConfig::default().path),
            table_definitions: var("TABLE_DEFINITIONS").map(PathBuf::from),
        };

        let batch_size = parse_or(var("SNAPSHOT_BATCH_SIZE"), "SNAPSHOT_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "SNAPSHOT_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }

        let identifier_case = var("IDENTIFIER_CASE")
            .map(|v| {
                v.parse::<IdentifierCase>()
                    .map_err(|e| ConfigError::InvalidValue(format!("IDENTIFIER_CASE: {}", e)))
            })
            .transpose()?;

        let mut type_overrides = TypeMapper::default_overrides();
        if let Some(spec) = var("TYPE_OVERRIDES") {
            type_overrides.extend(parse_type_overrides(&spec)?);
        }

        let cors = CorsConfig {
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        Ok(Self {
            server,
            source,
            store,
            snapshot: SnapshotOptions {
                batch_size,
                identifier_case,
                type_overrides,
            },
            cors,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, raw))),
        None => Ok(default),
    }
}

fn validate_source_url(url: &str) -> Result<(), ConfigError> {
    if url.starts_with("sqlite:") {
        return Ok(());
    }
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "postgres" | "postgresql") => {
            if parsed.host_str().is_none() {
                return Err(ConfigError::InvalidValue(
                    "Missing host in SOURCE_URL".to_string(),
                ));
            }
            Ok(())
        }
        _ => Err(ConfigError::InvalidValue(
            "Invalid SOURCE_URL format (expected postgres://… or sqlite://…)".to_string(),
        )),
    }
}

/// Parse `NAME=TYPE,NAME=TYPE` into an override table
pub fn parse_type_overrides(spec: &str) -> Result<HashMap<String, CanonicalType>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, ty) = entry.split_once('=').ok_or_else(|| {
                ConfigError::InvalidValue(format!("TYPE_OVERRIDES entry without '=': {}", entry))
            })?;
            let ty = ty
                .trim()
                .parse::<CanonicalType>()
                .map_err(|e| ConfigError::InvalidValue(format!("TYPE_OVERRIDES: {}", e)))?;
            Ok((name.trim().to_ascii_uppercase(), ty))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn defaults_apply_when_only_source_is_set() {
        let settings = Settings::from_lookup(lookup(&[("SOURCE_URL", "sqlite://./app.db")])).unwrap();
        assert_eq!(settings.source.schema, "public");
        assert_eq!(settings.source.max_connections, 10);
        assert_eq!(settings.store.path, PathBuf::from("./snapshots.db"));
        assert_eq!(settings.snapshot.batch_size, 1000);
        assert_eq!(settings.snapshot.identifier_case, None);
        assert_eq!(
            settings.snapshot.type_overrides.get("BINARY_DOUBLE"),
            Some(&CanonicalType::Double)
        );
    }

    #[test]
    fn source_url_is_required() {
        assert!(matches!(
            Settings::from_lookup(lookup(&[])),
            Err(ConfigError::MissingVar(_))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup(&[("SOURCE_URL", "mysql://db/app")])),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = Settings::from_lookup(lookup(&[
            ("SOURCE_URL", "postgres://u:p@localhost/app"),
            ("SNAPSHOT_BATCH_SIZE", "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn overrides_and_case_are_read() {
        let settings = Settings::from_lookup(lookup(&[
            ("SOURCE_URL", "postgres://u:p@localhost/app"),
            ("IDENTIFIER_CASE", "upper"),
            ("TYPE_OVERRIDES", "geometry=clob, mood = varchar"),
        ]))
        .unwrap();
        assert_eq!(settings.snapshot.identifier_case, Some(IdentifierCase::UpperCase));
        assert_eq!(
            settings.snapshot.type_overrides.get("GEOMETRY"),
            Some(&CanonicalType::Clob)
        );
        assert_eq!(
            settings.snapshot.type_overrides.get("MOOD"),
            Some(&CanonicalType::Varchar)
        );
    }

    #[test]
    fn malformed_overrides_fail() {
        assert!(parse_type_overrides("GEOMETRY").is_err());
        assert!(parse_type_overrides("GEOMETRY=shape").is_err());
        assert!(parse_type_overrides("").unwrap().is_empty());
    }
}
