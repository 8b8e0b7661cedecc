//! Configuration management for the tenant limiter.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{LimiterError, Result};

/// Prefix of environment variables that override file configuration,
/// e.g. `TENANT_LIMITER__REDIS__URL`.
pub const ENV_PREFIX: &str = "TENANT_LIMITER";

/// Main configuration for the tenant limiter service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis window store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Relational rule store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL. When unset, an in-process window store is used.
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix of every key written by the limiter
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

/// Relational store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. When unset, rules live in memory.
    #[serde(default)]
    pub url: Option<String>,

    /// YAML rule file used to seed the in-memory rule store
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

/// What to do when the window store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the request and log the error
    FailOpen,
    /// Reject the request with 503
    FailClosed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// How long resolved rules stay cached, in seconds
    #[serde(default = "default_rule_cache_ttl")]
    pub rule_cache_ttl_secs: u64,

    /// Upper bound on cached rule resolutions
    #[serde(default = "default_rule_cache_capacity")]
    pub rule_cache_capacity: usize,

    /// Checks slower than this are logged, in milliseconds
    #[serde(default = "default_latency_budget")]
    pub latency_budget_ms: u64,

    /// Failure policy for the general request path
    #[serde(default = "default_request_failure_policy")]
    pub request_failure_policy: FailurePolicy,

    /// Failure policy for authentication routes
    #[serde(default = "default_auth_failure_policy")]
    pub auth_failure_policy: FailurePolicy,

    /// Path prefix identifying authentication routes
    #[serde(default = "default_auth_path_prefix")]
    pub auth_path_prefix: String,

    /// How often aggregated metrics are flushed, in seconds
    #[serde(default = "default_metrics_flush_interval")]
    pub metrics_flush_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rule_cache_ttl_secs: default_rule_cache_ttl(),
            rule_cache_capacity: default_rule_cache_capacity(),
            latency_budget_ms: default_latency_budget(),
            request_failure_policy: default_request_failure_policy(),
            auth_failure_policy: default_auth_failure_policy(),
            auth_path_prefix: default_auth_path_prefix(),
            metrics_flush_interval_secs: default_metrics_flush_interval(),
        }
    }
}

impl RateLimitingConfig {
    pub fn rule_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rule_cache_ttl_secs)
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    pub fn metrics_flush_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_interval_secs.max(1))
    }

    /// Failure policy that applies to a request path.
    pub fn failure_policy_for(&self, path: &str) -> FailurePolicy {
        if !self.auth_path_prefix.is_empty() && path.starts_with(&self.auth_path_prefix) {
            self.auth_failure_policy
        } else {
            self.request_failure_policy
        }
    }
}

fn default_rule_cache_ttl() -> u64 {
    300
}

fn default_rule_cache_capacity() -> usize {
    crate::ratelimit::DEFAULT_CACHE_CAPACITY
}

fn default_latency_budget() -> u64 {
    5
}

fn default_request_failure_policy() -> FailurePolicy {
    FailurePolicy::FailOpen
}

fn default_auth_failure_policy() -> FailurePolicy {
    FailurePolicy::FailClosed
}

fn default_auth_path_prefix() -> String {
    "/api/v1/auth".to_string()
}

fn default_metrics_flush_interval() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl LimiterConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load configuration from an optional file layered under
    /// `TENANT_LIMITER__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))
    }
}
