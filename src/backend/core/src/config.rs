//! Configuration management.
//!
//! Values come from an optional config file layered under `STRATUM__*`
//! environment variables (e.g. `STRATUM__JWT__ACCESS_SECRET`).

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, StratumError};
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Environment variable naming an optional config file.
pub const CONFIG_PATH_ENV: &str = "STRATUM_CONFIG";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Token signing configuration
    pub jwt: JwtConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base domain; the tenant is the subdomain in front of it
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            domain: default_domain(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Database name
    #[serde(default = "default_db_name")]
    pub name: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections kept open
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: String::new(),
            name: default_db_name(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Secrets, issuers and lifetimes for the two token kinds.
#[derive(Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,

    #[serde(default = "default_access_issuer")]
    pub access_issuer: String,

    #[serde(default = "default_access_ttl", with = "humantime_serde")]
    pub access_ttl: Duration,

    pub refresh_secret: String,

    #[serde(default = "default_refresh_issuer")]
    pub refresh_issuer: String,

    #[serde(default = "default_refresh_ttl", with = "humantime_serde")]
    pub refresh_ttl: Duration,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("access_secret", &"[REDACTED]")
            .field("access_issuer", &self.access_issuer)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_secret", &"[REDACTED]")
            .field("refresh_issuer", &self.refresh_issuer)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

impl JwtConfig {
    /// Reject configurations that would let one token kind pass for the other.
    pub fn validate(&self) -> Result<()> {
        if self.access_secret.is_empty() || self.refresh_secret.is_empty() {
            return Err(StratumError::configuration("jwt secrets must not be empty"));
        }
        if self.access_secret == self.refresh_secret {
            return Err(StratumError::configuration(
                "jwt access and refresh secrets must differ",
            ));
        }
        if self.access_issuer.is_empty() || self.refresh_issuer.is_empty() {
            return Err(StratumError::configuration("jwt issuers must not be empty"));
        }
        if self.access_issuer == self.refresh_issuer {
            return Err(StratumError::configuration(
                "jwt access and refresh issuers must differ",
            ));
        }
        if self.access_ttl.is_zero() || self.refresh_ttl.is_zero() {
            return Err(StratumError::configuration(
                "jwt token lifetimes must be greater than zero",
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_domain() -> String { "localhost".to_string() }
fn default_request_timeout() -> Duration { Duration::from_secs(30) }
fn default_db_host() -> String { "localhost".to_string() }
fn default_db_port() -> u16 { 5432 }
fn default_db_user() -> String { "postgres".to_string() }
fn default_db_name() -> String { "stratum".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_access_issuer() -> String { "stratum-access".to_string() }
fn default_access_ttl() -> Duration { Duration::from_secs(15 * 60) }
fn default_refresh_issuer() -> String { "stratum-refresh".to_string() }
fn default_refresh_ttl() -> Duration { Duration::from_secs(7 * 24 * 60 * 60) }

impl Config {
    /// Load configuration from `STRATUM_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref())
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load_from(Some(path))
    }

    fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("STRATUM").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.jwt.validate()?;
        if self.database.min_connections > self.database.max_connections {
            return Err(StratumError::configuration(
                "database.min_connections exceeds database.max_connections",
            ));
        }
        if self.server.domain.is_empty() {
            return Err(StratumError::configuration("server.domain must not be empty"));
        }
        Ok(())
    }
}
