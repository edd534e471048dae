//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::federation::Kek;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Server-wide secret from which per-key wrapping keys are derived
    pub key_encryption_secret: Kek,
    /// RSA modulus size for newly generated actor keys
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    /// Accepted clock skew for inbound signature timestamps
    #[serde(default = "default_signature_max_skew")]
    pub signature_max_skew_seconds: u64,
    /// Age after which a cached remote actor is refetched on access
    #[serde(default = "default_actor_refresh")]
    pub actor_refresh_seconds: u64,
    /// Timeout for outbound fetches and deliveries
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    /// Permit remote URLs on loopback/private addresses (development only)
    #[serde(default)]
    pub allow_private_hosts: bool,
}

fn default_key_bits() -> usize {
    2048
}

fn default_signature_max_skew() -> u64 {
    300
}

fn default_actor_refresh() -> u64 {
    86_400
}

fn default_fetch_timeout() -> u64 {
    30
}

impl FederationConfig {
    /// The server secret, handed out by value so callers thread it explicitly.
    pub fn kek(&self) -> Kek {
        self.key_encryption_secret.clone()
    }

    pub fn signature_max_skew(&self) -> Duration {
        Duration::from_secs(self.signature_max_skew_seconds)
    }

    pub fn actor_refresh_after(&self) -> Duration {
        Duration::from_secs(self.actor_refresh_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

/// Delivery queue consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Run the queue consumer inside the server process
    #[serde(default = "default_true")]
    pub worker_enabled: bool,
    /// Attempts before a job is marked dead
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubled per attempt
    #[serde(default = "default_base_backoff")]
    pub base_backoff_seconds: u64,
    /// Upper bound for the retry delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    /// Jobs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Idle poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// How long a claimed job stays invisible to other consumers
    #[serde(default = "default_lease")]
    pub lease_seconds: u64,
    /// How long delivered and dead jobs are kept before pruning
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_backoff() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_batch_size() -> u32 {
    20
}

fn default_poll_interval() -> u64 {
    2
}

fn default_lease() -> u64 {
    300
}

fn default_retention() -> u64 {
    7 * 86_400
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_enabled: default_true(),
            max_attempts: default_max_attempts(),
            base_backoff_seconds: default_base_backoff(),
            max_backoff_seconds: default_max_backoff(),
            batch_size: default_batch_size(),
            poll_interval_seconds: default_poll_interval(),
            lease_seconds: default_lease(),
            retention_seconds: default_retention(),
        }
    }
}

/// Local actors that must exist once the server is up
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountsConfig {
    #[serde(default)]
    pub bootstrap: Vec<BootstrapActor>,
}

/// One `[[accounts.bootstrap]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapActor {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub fn filter_directive(&self) -> String {
        format!("fedcore={},tower_http=debug", self.level.trim().to_ascii_lowercase())
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDCORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("database.path", "data/fedcore.db")?
            .set_default("database.max_connections", 8)?
            .set_default("federation.key_bits", 2048)?
            .set_default("federation.signature_max_skew_seconds", 300)?
            .set_default("federation.actor_refresh_seconds", 86400)?
            .set_default("federation.fetch_timeout_seconds", 30)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("delivery.worker_enabled", true)?
            .set_default("delivery.max_attempts", 10)?
            .set_default("delivery.base_backoff_seconds", 5)?
            .set_default("delivery.max_backoff_seconds", 3600)?
            .set_default("delivery.batch_size", 20)?
            .set_default("delivery.poll_interval_seconds", 2)?
            .set_default("delivery.lease_seconds", 300)?
            .set_default("delivery.retention_seconds", 604_800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDCORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_SECRET_BYTES: usize = 32;

        if self.federation.key_encryption_secret.len() < MIN_SECRET_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "federation.key_encryption_secret must be at least {} bytes",
                MIN_SECRET_BYTES
            )));
        }

        if self.federation.key_bits < crate::federation::MIN_RSA_BITS {
            return Err(crate::error::AppError::Config(format!(
                "federation.key_bits must be at least {}",
                crate::federation::MIN_RSA_BITS
            )));
        }

        if self.delivery.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.delivery.max_backoff_seconds < self.delivery.base_backoff_seconds {
            return Err(crate::error::AppError::Config(
                "delivery.max_backoff_seconds must not be below delivery.base_backoff_seconds"
                    .to_string(),
            ));
        }

        if !matches!(
            self.logging.level.trim().to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(crate::error::AppError::Config(format!(
                "logging.level must be one of trace, debug, info, warn, error (got {})",
                self.logging.level
            )));
        }

        if self.federation.allow_private_hosts && !is_local_server_domain(&self.server.domain) {
            tracing::warn!(
                domain = %self.server.domain,
                "federation.allow_private_hosts is enabled on a public domain"
            );
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
