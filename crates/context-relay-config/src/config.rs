// crates/context-relay-config/src/config.rs
// ============================================================================
// Module: Relay Configuration
// Description: TOML configuration for upstream, cache, connection, server.
// Purpose: Load and validate relay configuration with fail-closed limits.
// Dependencies: serde, toml, url, directories
// ============================================================================

//! ## Overview
//! One TOML file configures the four relay surfaces: the upstream transport
//! (child-process, event-stream, or http), the cache directory and
//! dynamic-tier budget, the connection supervisor's probe and backoff
//! timing, and the front-side server. Every knob has a default; validation
//! enforces mode-specific requirements and hard limits and fails closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "context-relay.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "CONTEXT_RELAY_CONFIG";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Database filename inside the cache directory.
const DATABASE_FILE_NAME: &str = "cache.db";

/// Default dynamic-tier budget (100 MiB).
const DEFAULT_MAX_DYNAMIC_BYTES: u64 = 100 * 1024 * 1024;
/// Minimum dynamic-tier budget.
const MIN_MAX_DYNAMIC_BYTES: u64 = 1024 * 1024;
/// Default upstream request timeout in milliseconds.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Bounds for the upstream request timeout.
const MIN_REQUEST_TIMEOUT_MS: u64 = 500;
const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;
/// Default maximum upstream response size in bytes (8 MiB).
const DEFAULT_MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;
/// Default periodic probe interval while connected.
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
/// Bounds for the periodic probe interval.
const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 1_000;
const MAX_HEALTH_CHECK_INTERVAL_MS: u64 = 600_000;
/// Default probe timeout.
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
/// Bounds for the probe timeout.
const MIN_PROBE_TIMEOUT_MS: u64 = 100;
const MAX_PROBE_TIMEOUT_MS: u64 = 60_000;
/// Default reconnect attempt budget.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Maximum reconnect attempt budget.
const MAX_MAX_RECONNECT_ATTEMPTS: u32 = 1_000;
/// Default first reconnect delay.
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
/// Bounds for the first reconnect delay.
const MIN_BACKOFF_INITIAL_MS: u64 = 100;
const MAX_BACKOFF_INITIAL_MS: u64 = 600_000;
/// Default backoff multiplier.
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Bounds for the backoff multiplier.
const MIN_BACKOFF_MULTIPLIER: f64 = 1.0;
const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
/// Default reconnect delay cap.
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
/// Default maximum front-side request body size.
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem error while loading the config.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid or inconsistent configuration.
    #[error("config invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Upstream
// ============================================================================

/// Upstream transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamMode {
    /// Local child process speaking framed JSON-RPC over stdio.
    ChildProcess,
    /// HTTP transport with SSE-framed responses; enables push invalidation.
    EventStream,
    /// Plain request/response HTTP transport.
    Http,
}

/// Upstream client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Transport selection.
    pub mode: UpstreamMode,
    /// Base URL for event-stream or http modes.
    #[serde(default)]
    pub url: Option<String>,
    /// Command to spawn for child-process mode.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for the spawned command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Hard limit on upstream response bodies in bytes.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl UpstreamConfig {
    /// Validates mode-specific requirements.
    fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            UpstreamMode::EventStream | UpstreamMode::Http => {
                let Some(raw) = &self.url else {
                    return Err(ConfigError::Invalid(
                        "upstream.url is required for event-stream and http modes".to_string(),
                    ));
                };
                let url = Url::parse(raw)
                    .map_err(|err| ConfigError::Invalid(format!("upstream.url invalid: {err}")))?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ConfigError::Invalid(format!(
                        "upstream.url must be http or https, got {}",
                        url.scheme()
                    )));
                }
            }
            UpstreamMode::ChildProcess => {
                let missing = self.command.as_ref().is_none_or(|value| value.trim().is_empty());
                if missing {
                    return Err(ConfigError::Invalid(
                        "upstream.command is required for child-process mode".to_string(),
                    ));
                }
            }
        }
        check_range(
            "upstream.request_timeout_ms",
            self.request_timeout_ms,
            MIN_REQUEST_TIMEOUT_MS,
            MAX_REQUEST_TIMEOUT_MS,
        )?;
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid(
                "upstream.max_response_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default upstream request timeout.
const fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// Returns the default response-size limit.
const fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

// ============================================================================
// SECTION: Cache
// ============================================================================

/// Cache directory, budget, and preload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache directory; defaults to the per-user data directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Dynamic-tier size budget in bytes.
    #[serde(default = "default_max_dynamic_bytes")]
    pub max_dynamic_bytes: u64,
    /// Document-type kinds preloaded after reconnect.
    #[serde(default = "default_preload")]
    pub preload: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_dynamic_bytes: DEFAULT_MAX_DYNAMIC_BYTES,
            preload: default_preload(),
        }
    }
}

impl CacheConfig {
    /// Resolves the database file path under the cache directory.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.cache_dir().join(DATABASE_FILE_NAME)
    }

    /// Resolves the cache directory, falling back to the working directory
    /// when no per-user data directory is available.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        ProjectDirs::from("", "", "context-relay").map_or_else(
            || PathBuf::from(".context-relay"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }

    /// Validates the cache budget and preload kinds.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_dynamic_bytes < MIN_MAX_DYNAMIC_BYTES {
            return Err(ConfigError::Invalid(format!(
                "cache.max_dynamic_bytes must be at least {MIN_MAX_DYNAMIC_BYTES}"
            )));
        }
        for kind in &self.preload {
            if preload_doc_type(kind).is_none() {
                return Err(ConfigError::Invalid(format!("cache.preload kind unknown: {kind}")));
            }
        }
        Ok(())
    }
}

/// Returns the default dynamic-tier budget.
const fn default_max_dynamic_bytes() -> u64 {
    DEFAULT_MAX_DYNAMIC_BYTES
}

/// Returns the default preload kinds.
fn default_preload() -> Vec<String> {
    vec!["workflows".to_string(), "rules".to_string()]
}

/// Maps a plural preload kind to the document type it loads.
#[must_use]
pub fn preload_doc_type(kind: &str) -> Option<&'static str> {
    match kind {
        "workflows" => Some("workflow"),
        "rules" => Some("rule"),
        "agents" => Some("agent"),
        "templates" => Some("template"),
        _ => None,
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffConfig {
    /// First reconnect delay in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    /// Multiplier applied per failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Upper bound on the reconnect delay in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

/// Connection supervisor configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConnectionConfig {
    /// Periodic probe interval while connected, in milliseconds.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive failures tolerated before going offline.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Reconnect backoff settings.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Validates probe and backoff timing.
    fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "connection.health_check_interval_ms",
            self.health_check_interval_ms,
            MIN_HEALTH_CHECK_INTERVAL_MS,
            MAX_HEALTH_CHECK_INTERVAL_MS,
        )?;
        check_range(
            "connection.probe_timeout_ms",
            self.probe_timeout_ms,
            MIN_PROBE_TIMEOUT_MS,
            MAX_PROBE_TIMEOUT_MS,
        )?;
        if self.max_reconnect_attempts == 0
            || self.max_reconnect_attempts > MAX_MAX_RECONNECT_ATTEMPTS
        {
            return Err(ConfigError::Invalid(format!(
                "connection.max_reconnect_attempts must be in 1..={MAX_MAX_RECONNECT_ATTEMPTS}"
            )));
        }
        check_range(
            "connection.backoff.initial_ms",
            self.backoff.initial_ms,
            MIN_BACKOFF_INITIAL_MS,
            MAX_BACKOFF_INITIAL_MS,
        )?;
        if !(MIN_BACKOFF_MULTIPLIER ..= MAX_BACKOFF_MULTIPLIER).contains(&self.backoff.multiplier)
        {
            return Err(ConfigError::Invalid(format!(
                "connection.backoff.multiplier must be in \
                 {MIN_BACKOFF_MULTIPLIER}..={MAX_BACKOFF_MULTIPLIER}"
            )));
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            return Err(ConfigError::Invalid(
                "connection.backoff.max_ms must be >= initial_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default periodic probe interval.
const fn default_health_check_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

/// Returns the default probe timeout.
const fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

/// Returns the default reconnect attempt budget.
const fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

/// Returns the default first reconnect delay.
const fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}

/// Returns the default backoff multiplier.
const fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

/// Returns the default reconnect delay cap.
const fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

// ============================================================================
// SECTION: Server
// ============================================================================

/// Front-side transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerTransport {
    /// Framed JSON-RPC over the relay's stdio.
    #[default]
    Stdio,
    /// JSON-RPC over HTTP POST /rpc.
    Http,
}

/// Front-side server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Transport selection.
    #[serde(default)]
    pub transport: ServerTransport,
    /// Bind address for the http transport.
    #[serde(default)]
    pub bind: Option<String>,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: ServerTransport::default(),
            bind: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ServerConfig {
    /// Validates transport-specific requirements.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.transport == ServerTransport::Http {
            let Some(bind) = &self.bind else {
                return Err(ConfigError::Invalid(
                    "server.bind is required for the http transport".to_string(),
                ));
            };
            bind.parse::<SocketAddr>().map_err(|_| {
                ConfigError::Invalid(format!("server.bind is not a socket address: {bind}"))
            })?;
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default front-side body-size limit.
const fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

// ============================================================================
// SECTION: Relay Config
// ============================================================================

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Upstream transport configuration.
    pub upstream: UpstreamConfig,
    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Connection supervisor configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Front-side server configuration.
    #[serde(default)]
    pub server: ServerConfig,
}

impl RelayConfig {
    /// Loads configuration from disk using the default resolution rules:
    /// explicit path, then `CONTEXT_RELAY_CONFIG`, then the default name in
    /// the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path);
        let bytes = fs::read(&resolved)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", resolved.display())))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream.validate()?;
        self.cache.validate()?;
        self.connection.validate()?;
        self.server.validate()?;
        Ok(())
    }
}

/// Resolves the config path from the flag, environment, or default name.
fn resolve_path(path: Option<&Path>) -> PathBuf {
    if let Some(path) = path {
        return path.to_path_buf();
    }
    if let Some(value) = env::var_os(CONFIG_ENV_VAR)
        && !value.is_empty()
    {
        return PathBuf::from(value);
    }
    PathBuf::from(DEFAULT_CONFIG_NAME)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Checks a numeric field against inclusive bounds.
fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!("{field} must be in {min}..={max}")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
