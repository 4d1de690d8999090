//! Static server configuration, loaded from YAML and environment variables.
//!
//! This covers everything that requires a restart to change: bind
//! addresses, the database path, admin credentials, and logging. The
//! dynamic policy lives in the database and is managed by [`crate::policy`].

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Admin-port authentication settings.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Recorder buffer settings.
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// Network configuration for both listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind both ports to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Proxy (client-facing) port.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Admin port.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout applied to every pooled connection, in milliseconds.
    #[serde(default = "default_db_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

/// Admin authentication configuration.
///
/// The password is never stored; `password_sha256` holds the hex SHA-256 of
/// it. Login compares hashes and issues an HMAC-signed bearer token with a
/// TTL.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Hex SHA-256 of the admin password. Empty disables admin login.
    #[serde(default)]
    pub password_sha256: String,

    /// Secret used to sign admin bearer tokens.
    #[serde(default)]
    pub token_secret: String,

    /// Lifetime of an issued token, in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "pylon_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Recorder buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// In-memory record buffer capacity; the oldest entries are dropped
    /// beyond this.
    #[serde(default = "default_recorder_capacity")]
    pub buffer_capacity: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_proxy_port() -> u16 {
    8000
}

fn default_admin_port() -> u16 {
    8001
}

fn default_db_path() -> String {
    "pylon.db".to_string()
}

fn default_db_busy_timeout_ms() -> u64 {
    5_000
}

fn default_db_max_connections() -> u32 {
    8
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_recorder_capacity() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            proxy_port: default_proxy_port(),
            admin_port: default_admin_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_db_busy_timeout_ms(),
            max_connections: default_db_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// The pool tunables this configuration asks for.
    pub fn pool_settings(&self) -> pylon_db::PoolSettings {
        pylon_db::PoolSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            max_connections: self.max_connections,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            password_sha256: String::new(),
            token_secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_recorder_capacity(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Environment variable value was invalid for the expected type.
    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: &'static str, reason: String },

    /// Configuration value is outside the allowed range.
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

const MIN_TOKEN_TTL_SECS: u64 = 60;
const MAX_TOKEN_TTL_SECS: u64 = 60 * 60 * 24 * 30;
const MIN_RECORDER_CAPACITY: usize = 16;
const MIN_DB_BUSY_TIMEOUT_MS: u64 = 1;
const MAX_DB_BUSY_TIMEOUT_MS: u64 = 60_000;
const MIN_DB_MAX_CONNECTIONS: u32 = 1;
const MAX_DB_MAX_CONNECTIONS: u32 = 64;

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.proxy_port == config.server.admin_port {
        return Err(ConfigError::InvalidValue {
            field: "server.admin_port",
            reason: format!(
                "must differ from server.proxy_port, both are {}",
                config.server.proxy_port
            ),
        });
    }

    if !(MIN_TOKEN_TTL_SECS..=MAX_TOKEN_TTL_SECS).contains(&config.admin.token_ttl_secs) {
        return Err(ConfigError::InvalidValue {
            field: "admin.token_ttl_secs",
            reason: format!(
                "must be in range {MIN_TOKEN_TTL_SECS}..={MAX_TOKEN_TTL_SECS}, got {}",
                config.admin.token_ttl_secs
            ),
        });
    }

    let hash = &config.admin.password_sha256;
    if !hash.is_empty() && (hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit())) {
        return Err(ConfigError::InvalidValue {
            field: "admin.password_sha256",
            reason: "must be 64 hex characters".to_string(),
        });
    }

    if !hash.is_empty() && config.admin.token_secret.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "admin.token_secret",
            reason: "must be set when admin login is enabled".to_string(),
        });
    }

    if config.recorder.buffer_capacity < MIN_RECORDER_CAPACITY {
        return Err(ConfigError::InvalidValue {
            field: "recorder.buffer_capacity",
            reason: format!("must be >= {MIN_RECORDER_CAPACITY}"),
        });
    }

    if !(MIN_DB_BUSY_TIMEOUT_MS..=MAX_DB_BUSY_TIMEOUT_MS)
        .contains(&config.database.busy_timeout_ms)
    {
        return Err(ConfigError::InvalidValue {
            field: "database.busy_timeout_ms",
            reason: format!(
                "must be in range {MIN_DB_BUSY_TIMEOUT_MS}..={MAX_DB_BUSY_TIMEOUT_MS}, got {}",
                config.database.busy_timeout_ms
            ),
        });
    }

    if !(MIN_DB_MAX_CONNECTIONS..=MAX_DB_MAX_CONNECTIONS)
        .contains(&config.database.max_connections)
    {
        return Err(ConfigError::InvalidValue {
            field: "database.max_connections",
            reason: format!(
                "must be in range {MIN_DB_MAX_CONNECTIONS}..={MAX_DB_MAX_CONNECTIONS}, got {}",
                config.database.max_connections
            ),
        });
    }

    Ok(())
}

fn parse_env_var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            let parsed = raw.parse::<T>().map_err(|err| ConfigError::InvalidEnvVar {
                name,
                reason: err.to_string(),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

fn parse_env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            let parsed = match normalized.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
            .ok_or_else(|| ConfigError::InvalidEnvVar {
                name,
                reason: format!("expected one of [true,false,1,0,yes,no,on,off], got '{raw}'"),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

/// Loads configuration from a YAML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PYLON_HOST` overrides `server.host`
/// - `PYLON_PROXY_PORT` overrides `server.proxy_port`
/// - `PYLON_ADMIN_PORT` overrides `server.admin_port`
/// - `PYLON_DB_PATH` overrides `database.path`
/// - `PYLON_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `PYLON_DB_MAX_CONNECTIONS` overrides `database.max_connections`
/// - `PYLON_ADMIN_PASSWORD_SHA256` overrides `admin.password_sha256`
/// - `PYLON_TOKEN_SECRET` overrides `admin.token_secret`
/// - `PYLON_TOKEN_TTL_SECS` overrides `admin.token_ttl_secs`
/// - `PYLON_LOG_LEVEL` overrides `logging.level`
/// - `PYLON_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PYLON_RECORDER_CAPACITY` overrides `recorder.buffer_capacity`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if any value fails validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => serde_yaml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(host) = parse_env_var("PYLON_HOST")? {
        config.server.host = host;
    }
    if let Some(port) = parse_env_var("PYLON_PROXY_PORT")? {
        config.server.proxy_port = port;
    }
    if let Some(port) = parse_env_var("PYLON_ADMIN_PORT")? {
        config.server.admin_port = port;
    }
    if let Some(db_path) = parse_env_var::<String>("PYLON_DB_PATH")? {
        config.database.path = db_path;
    }
    if let Some(timeout) = parse_env_var("PYLON_DB_BUSY_TIMEOUT_MS")? {
        config.database.busy_timeout_ms = timeout;
    }
    if let Some(max) = parse_env_var("PYLON_DB_MAX_CONNECTIONS")? {
        config.database.max_connections = max;
    }
    if let Some(hash) = parse_env_var::<String>("PYLON_ADMIN_PASSWORD_SHA256")? {
        config.admin.password_sha256 = hash;
    }
    if let Some(secret) = parse_env_var::<String>("PYLON_TOKEN_SECRET")? {
        config.admin.token_secret = secret;
    }
    if let Some(ttl) = parse_env_var("PYLON_TOKEN_TTL_SECS")? {
        config.admin.token_ttl_secs = ttl;
    }
    if let Some(level) = parse_env_var::<String>("PYLON_LOG_LEVEL")? {
        config.logging.level = level;
    }
    if let Some(json) = parse_env_bool("PYLON_LOG_JSON")? {
        config.logging.json = json;
    }
    if let Some(capacity) = parse_env_var("PYLON_RECORDER_CAPACITY")? {
        config.recorder.buffer_capacity = capacity;
    }

    validate_config(&config)?;

    Ok(config)
}
