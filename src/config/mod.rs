//! Configuration loading for the tenancy engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `TENANCY_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "TENANCY_";
const TENANT_UUID_LEN: usize = 32;
/// Room left after `{prefix}_{uuid}_` for the app label and model slug.
const MIN_SLUG_ROOM: usize = 12;
const MAX_PREFIX_LEN: usize = 16;

/// Application configuration derived from `TENANCY_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Which installed model is the tenant, as `app_label.ModelName`.
    #[serde(default = "default_tenant_model")]
    pub tenant_model: String,
    /// Leading component of every per-tenant table name and scoped app label.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    /// Identifiers longer than this are truncated with a hash suffix.
    #[serde(default = "default_max_identifier_length")]
    pub max_identifier_length: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            tenant_model: default_tenant_model(),
            table_prefix: default_table_prefix(),
            max_identifier_length: default_max_identifier_length(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (database credentials are hidden).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        config.database_url = redact_url_password(&config.database_url);
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration.
    ///
    /// The tenant model setting is deliberately not checked here: it can only
    /// be resolved against the installed models, see
    /// [`ModelCatalog::tenant_model`](crate::schema::ModelCatalog::tenant_model).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.table_prefix.len() > MAX_PREFIX_LEN || !table_prefix_pattern().is_match(&self.table_prefix) {
            return Err(ConfigError::InvalidTablePrefix {
                value: self.table_prefix.clone(),
            });
        }

        let minimum = self.table_prefix.len() + TENANT_UUID_LEN + 2 + MIN_SLUG_ROOM;
        if self.max_identifier_length < minimum {
            return Err(ConfigError::IdentifierLengthTooSmall {
                value: self.max_identifier_length,
                minimum,
            });
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }

        Ok(())
    }
}

fn table_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Single underscores only: `__` separates the segments of table names.
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*(_[a-z0-9]+)*$").expect("static regex is valid"))
}

fn redact_url_password(url: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"://([^:/@]+):([^@]+)@").expect("static regex is valid"));
    pattern.replace(url, "://$1:[REDACTED]@").into_owned()
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://tenancy.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_tenant_model() -> String {
    "tenancy.Tenant".to_string()
}

fn default_table_prefix() -> String {
    "tenant".to_string()
}

fn default_max_identifier_length() -> usize {
    63
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("database url is missing; set TENANCY_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("invalid log format '{value}'; expected 'json' or 'pretty'")]
    InvalidLogFormat { value: String },
    #[error(
        "invalid table prefix '{value}'; use up to 16 lowercase letters, digits or underscores starting with a letter"
    )]
    InvalidTablePrefix { value: String },
    #[error("max identifier length {value} is too small; at least {minimum} is required for the table prefix")]
    IdentifierLengthTooSmall { value: usize, minimum: usize },
    #[error("db max connections must be greater than 0")]
    InvalidMaxConnections,
}

/// Loads configuration using layered `.env` files and `TENANCY_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`,
    /// then the process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let tenant_model = layered
            .remove("TENANT_MODEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_tenant_model);
        let table_prefix = layered
            .remove("TABLE_PREFIX")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_table_prefix);
        let max_identifier_length = layered
            .remove("MAX_IDENTIFIER_LENGTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_max_identifier_length);

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            tenant_model,
            table_prefix,
            max_identifier_length,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("TENANCY_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
