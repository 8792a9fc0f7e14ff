//! TOML Configuration
//!
//! Configuration is read from `$XDG_CONFIG_HOME/metrics-router/config.toml`
//! (typically `~/.config/metrics-router/config.toml`).
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`METRICS_ROUTER_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [reconcile]
//! workers = 2
//! resync_interval_secs = 60
//! retry_base_delay_ms = 5
//! retry_max_delay_ms = 1000000
//! retry_jitter = 0.1
//!
//! [discovery]
//! request_timeout_secs = 10
//! bearer_token_file = "/var/run/secrets/kubernetes.io/serviceaccount/token"
//! ca_cert_file = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
//!
//! [sources]
//! path = "/etc/metrics-router/backends.toml"
//! poll_interval_secs = 10
//!
//! [daemon]
//! heartbeat_interval_secs = 30
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {}: {source}", .path.display())]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the effective configuration last came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in defaults
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// `[reconcile]` section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Concurrent reconcile workers
    pub workers: usize,
    /// Seconds between full resyncs
    pub resync_interval_secs: u64,
    /// First retry delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling in milliseconds
    pub retry_max_delay_ms: u64,
    /// Random slack added to retry delays, as a fraction of the delay
    pub retry_jitter: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            resync_interval_secs: 60,
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 1_000_000,
            retry_jitter: 0.1,
        }
    }
}

/// `[discovery]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Per-request timeout against backends
    pub request_timeout_secs: u64,
    /// File holding the bearer token sent to backends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token_file: Option<PathBuf>,
    /// PEM root certificate used to verify backends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            bearer_token_file: None,
            ca_cert_file: None,
        }
    }
}

/// `[sources]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Backends file
    pub path: PathBuf,
    /// Seconds between polls of the backends file
    pub poll_interval_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("backends.toml"),
            poll_interval_secs: 10,
        }
    }
}

/// `[daemon]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between heartbeat log lines
    pub heartbeat_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
        }
    }
}

/// Complete router configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Reconcile controller tuning
    pub reconcile: ReconcileConfig,
    /// Backend client settings
    pub discovery: DiscoveryConfig,
    /// Registration source settings
    pub sources: SourcesConfig,
    /// Daemon settings
    pub daemon: DaemonConfig,

    /// Config file that was loaded, if any
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
    #[serde(skip)]
    source: ConfigSource,
}

impl RouterConfig {
    /// Where the configuration last came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Override values from `METRICS_ROUTER_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Override values using `lookup` in place of the process environment
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
            let parsed = value.trim().parse().ok();
            if parsed.is_none() {
                tracing::warn!(variable = name, value = value, "Ignoring unparseable value");
            }
            parsed
        }

        let mut touched = false;

        if let Some(value) = lookup("METRICS_ROUTER_WORKERS") {
            if let Some(n) = parsed("METRICS_ROUTER_WORKERS", &value) {
                self.reconcile.workers = n;
                touched = true;
            }
        }
        if let Some(value) = lookup("METRICS_ROUTER_RESYNC_SECS") {
            if let Some(secs) = parsed("METRICS_ROUTER_RESYNC_SECS", &value) {
                self.reconcile.resync_interval_secs = secs;
                touched = true;
            }
        }
        if let Some(value) = lookup("METRICS_ROUTER_SOURCES") {
            self.sources.path = PathBuf::from(value);
            touched = true;
        }
        if let Some(value) = lookup("METRICS_ROUTER_REQUEST_TIMEOUT_SECS") {
            if let Some(secs) = parsed("METRICS_ROUTER_REQUEST_TIMEOUT_SECS", &value) {
                self.discovery.request_timeout_secs = secs;
                touched = true;
            }
        }
        if let Some(value) = lookup("METRICS_ROUTER_BEARER_TOKEN_FILE") {
            self.discovery.bearer_token_file = Some(PathBuf::from(value));
            touched = true;
        }

        if touched {
            self.source = ConfigSource::Env;
        }
    }

    /// Check that every value is usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.reconcile.workers == 0 {
            return invalid("reconcile.workers must be at least 1");
        }
        if self.reconcile.resync_interval_secs == 0 {
            return invalid("reconcile.resync_interval_secs must be non-zero");
        }
        if self.reconcile.retry_base_delay_ms == 0 {
            return invalid("reconcile.retry_base_delay_ms must be non-zero");
        }
        if self.reconcile.retry_base_delay_ms > self.reconcile.retry_max_delay_ms {
            return invalid("reconcile.retry_base_delay_ms must not exceed retry_max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.reconcile.retry_jitter) {
            return invalid("reconcile.retry_jitter must be between 0 and 1");
        }
        if self.discovery.request_timeout_secs == 0 {
            return invalid("discovery.request_timeout_secs must be non-zero");
        }
        if self.sources.poll_interval_secs == 0 {
            return invalid("sources.poll_interval_secs must be non-zero");
        }
        if self.daemon.heartbeat_interval_secs == 0 {
            return invalid("daemon.heartbeat_interval_secs must be non-zero");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("metrics-router").join("config.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RouterConfig, ConfigError> {
    let mut config = load_config_from_path(default_config_path())?;
    config.apply_env();
    Ok(config)
}

/// Load configuration from a specific file
///
/// `None` or a missing file yields the defaults. Environment variables are
/// not applied.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RouterConfig, ConfigError> {
    let Some(config_path) = path else {
        return Ok(RouterConfig::default());
    };

    if !config_path.exists() {
        tracing::debug!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return Ok(RouterConfig::default());
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;
    let mut config: RouterConfig = toml::from_str(&content)?;
    config.source = ConfigSource::File;

    tracing::info!(
        path = %config_path.display(),
        "Loaded configuration from file"
    );
    config.config_file_path = Some(config_path);
    Ok(config)
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after file and environment
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Backends file override
    pub sources_path: Option<PathBuf>,
    /// Worker count override
    pub workers: Option<usize>,
    /// Resync interval override (seconds)
    pub resync_interval_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backends file
    #[must_use]
    pub fn with_sources_path(mut self, path: PathBuf) -> Self {
        self.sources_path = Some(path);
        self
    }

    /// Set the worker count
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set the resync interval
    #[must_use]
    pub fn with_resync_interval_secs(mut self, secs: u64) -> Self {
        self.resync_interval_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RouterConfig) {
        if self.sources_path.is_some()
            || self.workers.is_some()
            || self.resync_interval_secs.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref path) = self.sources_path {
            config.sources.path = path.clone();
        }
        if let Some(workers) = self.workers {
            config.reconcile.workers = workers;
        }
        if let Some(secs) = self.resync_interval_secs {
            config.reconcile.resync_interval_secs = secs;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
