//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Retention tiering and expiry settings.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Audit ledger settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Event-bus tuning.
    #[serde(default)]
    pub bus: BusSettings,

    /// Notifier fan-out settings.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Toggles for middleware handled outside the core.
    #[serde(default)]
    pub features: FeatureToggles,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Bearer-token issuance and verification.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret the signing key is derived from. Override in production.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_expiry_secs")]
    pub token_expiry_secs: i64,

    /// Login credentials accepted by `/auth/login`.
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,
}

/// Retention tier thresholds and cold expiry.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Upper bound (exclusive) of the hot tier, in days.
    #[serde(default = "default_hot_days")]
    pub hot_days: i64,

    /// Upper bound (exclusive) of the warm tier, in days.
    #[serde(default = "default_warm_days")]
    pub warm_days: i64,

    /// Age in days past which cold rows are expired. Zero disables expiry.
    #[serde(default)]
    pub cold_expiry_days: i64,

    /// Seconds between retention sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Audit ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Merkle window size in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,

    /// Seconds between rollover checks.
    #[serde(default = "default_rollover_interval_secs")]
    pub rollover_interval_secs: u64,
}

/// Event-bus tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSettings {
    /// Total delivery attempts before dead-lettering.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u32,

    /// Per-message processing deadline in seconds.
    #[serde(default = "default_handler_deadline_secs")]
    pub handler_deadline_secs: u64,

    /// Publish deadline in seconds.
    #[serde(default = "default_publish_deadline_secs")]
    pub publish_deadline_secs: u64,

    /// Dispatcher fallback poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Notifier fan-out limits.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Rooms above this member count are skipped per event.
    #[serde(default = "default_max_room_size")]
    pub max_room_size: usize,

    /// Cluster adapter channel capacity.
    #[serde(default = "default_adapter_capacity")]
    pub adapter_capacity: usize,
}

/// Middleware handled by the edge proxy; the core only reports the toggles.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureToggles {
    #[serde(default)]
    pub compression: bool,

    #[serde(default)]
    pub rate_limiting: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "docket_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "docket.db".to_string()
}

fn default_busy_timeout_ms() -> u32 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_token_secret() -> String {
    "docket-dev-secret".to_string()
}

fn default_token_expiry_secs() -> i64 {
    3_600
}

fn default_username() -> String {
    "auditor".to_string()
}

fn default_password() -> String {
    "auditor".to_string()
}

fn default_hot_days() -> i64 {
    30
}

fn default_warm_days() -> i64 {
    365
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_window_ms() -> i64 {
    3_600_000
}

fn default_rollover_interval_secs() -> u64 {
    30
}

fn default_max_deliver() -> u32 {
    3
}

fn default_handler_deadline_secs() -> u64 {
    30
}

fn default_publish_deadline_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_max_room_size() -> usize {
    1_000
}

fn default_adapter_capacity() -> usize {
    1_024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: default_token_secret(),
            token_expiry_secs: default_token_expiry_secs(),
            username: default_username(),
            password: default_password(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hot_days: default_hot_days(),
            warm_days: default_warm_days(),
            cold_expiry_days: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            rollover_interval_secs: default_rollover_interval_secs(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_deliver: default_max_deliver(),
            handler_deadline_secs: default_handler_deadline_secs(),
            publish_deadline_secs: default_publish_deadline_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_room_size: default_max_room_size(),
            adapter_capacity: default_adapter_capacity(),
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

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `DOCKET_HOST`, `DOCKET_PORT`
/// - `DOCKET_DB_PATH`
/// - `DOCKET_TOKEN_SECRET`, `DOCKET_TOKEN_EXPIRY_SECS`
/// - `DOCKET_API_USERNAME`, `DOCKET_API_PASSWORD`
/// - `DOCKET_RETENTION_HOT_DAYS`, `DOCKET_RETENTION_WARM_DAYS`
/// - `DOCKET_MERKLE_WINDOW_MS`
/// - `DOCKET_LOG_LEVEL`, `DOCKET_LOG_JSON`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("DOCKET_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("DOCKET_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("DOCKET_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(secret) = std::env::var("DOCKET_TOKEN_SECRET") {
        config.auth.token_secret = secret;
    }
    if let Ok(expiry) = std::env::var("DOCKET_TOKEN_EXPIRY_SECS") {
        if let Ok(parsed) = expiry.parse() {
            config.auth.token_expiry_secs = parsed;
        }
    }
    if let Ok(username) = std::env::var("DOCKET_API_USERNAME") {
        config.auth.username = username;
    }
    if let Ok(password) = std::env::var("DOCKET_API_PASSWORD") {
        config.auth.password = password;
    }
    if let Ok(days) = std::env::var("DOCKET_RETENTION_HOT_DAYS") {
        if let Ok(parsed) = days.parse() {
            config.retention.hot_days = parsed;
        }
    }
    if let Ok(days) = std::env::var("DOCKET_RETENTION_WARM_DAYS") {
        if let Ok(parsed) = days.parse() {
            config.retention.warm_days = parsed;
        }
    }
    if let Ok(window) = std::env::var("DOCKET_MERKLE_WINDOW_MS") {
        if let Ok(parsed) = window.parse() {
            config.audit.window_ms = parsed;
        }
    }
    if let Ok(level) = std::env::var("DOCKET_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("DOCKET_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
