//! Node configuration.
//!
//! Loaded in layers with the following precedence (lowest to highest):
//! 1. Environment variables (`TANDEM_*`)
//! 2. TOML configuration file
//! 3. Command-line arguments
//!
//! ```toml
//! http_addr = "0.0.0.0:8080"
//! key_prefix = "rl"
//! failure_policy = "closed"
//! store_timeout_ms = 2000
//! store = "redis"
//! redis_url = "redis://localhost:6379/0"
//!
//! [policies.chat-send]
//! capacity = 10
//! refill_rate = 0.5
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;
use tandem_ratelimit::DEFAULT_KEY_PREFIX;
use tandem_ratelimit::DEFAULT_STORE_TIMEOUT_MS;
use tandem_ratelimit::FailurePolicy;
use tandem_ratelimit::RedisBucketStore;
use tandem_ratelimit::TokenBucketConfig;
use tandem_ratelimit::validate_scope;

/// Scope guarding chat message sends.
pub const CHAT_SEND_SCOPE: &str = "chat-send";

/// Scope guarding general API calls.
pub const API_SCOPE: &str = "api";

/// Redis used by the `redis` backend when no URL is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Where bucket state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process map with a single owner lock.
    #[default]
    Local,
    /// Compare-and-swap transactions over the in-process key-value store.
    /// Buckets are not shared with other processes.
    Kv,
    /// Server-side script on Redis. Every node pointed at the same server
    /// shares one bucket per key.
    Redis,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(StoreBackend::Local),
            "kv" | "cas" => Ok(StoreBackend::Kv),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(ConfigError::Validation {
                message: format!("unknown store backend '{other}', expected 'local', 'kv' or 'redis'"),
            }),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Local => f.write_str("local"),
            StoreBackend::Kv => f.write_str("kv"),
            StoreBackend::Redis => f.write_str("redis"),
        }
    }
}

/// Capacity and refill rate for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopePolicy {
    pub capacity: u64,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl ScopePolicy {
    pub const fn new(capacity: u64, refill_rate: f64) -> Self {
        Self { capacity, refill_rate }
    }
}

impl FromStr for ScopePolicy {
    type Err = ConfigError;

    /// Parse `capacity/refill_rate`, e.g. `10/0.5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Validation {
            message: format!("invalid scope policy '{s}', expected capacity/refill_rate"),
        };
        let (capacity, refill_rate) = s.split_once('/').ok_or_else(invalid)?;
        Ok(Self {
            capacity: capacity.trim().parse().map_err(|_| invalid())?,
            refill_rate: refill_rate.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Built-in scope policies, overridable per scope.
pub fn default_policies() -> BTreeMap<String, ScopePolicy> {
    BTreeMap::from([
        (CHAT_SEND_SCOPE.to_string(), ScopePolicy::new(10, 0.5)),
        (API_SCOPE.to_string(), ScopePolicy::new(60, 1.0)),
    ])
}

/// Configuration for a `tandem-node` process.
///
/// Every scalar is optional so a layer can tell "not set" apart from "set to
/// the default". The accessors resolve unset fields to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address for the HTTP API.
    #[serde(default)]
    pub http_addr: Option<SocketAddr>,

    /// Namespace prepended to every bucket key.
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Behavior on store failure. Defaults to fail-closed.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,

    /// Bound on one store call, in milliseconds.
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,

    /// Identify anonymous callers by the first `x-forwarded-for` hop.
    #[serde(default)]
    pub trust_forwarded_for: Option<bool>,

    /// Bucket state backend.
    #[serde(default)]
    pub store: Option<StoreBackend>,

    /// Server for the `redis` backend.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Per-scope overrides of [`default_policies`].
    #[serde(default)]
    pub policies: BTreeMap<String, ScopePolicy>,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_toml_str(&content).context(ParseTomlSnafu { path })
    }

    fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from variables resolved by `lookup`.
    ///
    /// `TANDEM_POLICIES` holds `scope=capacity/refill_rate` pairs separated by commas.
    pub fn from_env_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("TANDEM_HTTP_ADDR") {
            config.http_addr = Some(addr.trim().parse().map_err(|_| ConfigError::Validation {
                message: format!("TANDEM_HTTP_ADDR '{addr}' is not a socket address"),
            })?);
        }
        if let Some(prefix) = lookup("TANDEM_KEY_PREFIX") {
            config.key_prefix = Some(prefix);
        }
        if let Some(policy) = lookup("TANDEM_FAILURE_POLICY") {
            config.failure_policy = Some(policy.parse::<FailurePolicy>().context(InvalidLimiterSnafu { scope: "*" })?);
        }
        if let Some(timeout) = lookup("TANDEM_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = Some(timeout.trim().parse().map_err(|_| ConfigError::Validation {
                message: format!("TANDEM_STORE_TIMEOUT_MS '{timeout}' is not a number"),
            })?);
        }
        if let Some(trust) = lookup("TANDEM_TRUST_FORWARDED_FOR") {
            config.trust_forwarded_for = Some(parse_bool(&trust).ok_or_else(|| ConfigError::Validation {
                message: format!("TANDEM_TRUST_FORWARDED_FOR '{trust}' is not a boolean"),
            })?);
        }
        if let Some(store) = lookup("TANDEM_STORE") {
            config.store = Some(store.parse::<StoreBackend>()?);
        }
        if let Some(url) = lookup("TANDEM_REDIS_URL") {
            config.redis_url = Some(url);
        }
        if let Some(policies) = lookup("TANDEM_POLICIES") {
            for entry in policies.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (scope, policy) = entry.split_once('=').ok_or_else(|| ConfigError::Validation {
                    message: format!("TANDEM_POLICIES entry '{entry}' must be scope=capacity/refill_rate"),
                })?;
                config.policies.insert(scope.trim().to_string(), policy.parse::<ScopePolicy>()?);
            }
        }

        Ok(config)
    }

    /// Merge configuration from a higher-precedence source.
    ///
    /// Every field set in `other` overrides `self`, even when it equals the
    /// default. Policies merge per scope.
    pub fn merge(&mut self, other: Self) {
        if other.http_addr.is_some() {
            self.http_addr = other.http_addr;
        }
        if other.key_prefix.is_some() {
            self.key_prefix = other.key_prefix;
        }
        if other.failure_policy.is_some() {
            self.failure_policy = other.failure_policy;
        }
        if other.store_timeout_ms.is_some() {
            self.store_timeout_ms = other.store_timeout_ms;
        }
        if other.trust_forwarded_for.is_some() {
            self.trust_forwarded_for = other.trust_forwarded_for;
        }
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.redis_url.is_some() {
            self.redis_url = other.redis_url;
        }
        self.policies.extend(other.policies);
    }

    /// Validate the configuration, including every limiter it would build.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (scope, config) in self.limiter_configs() {
            validate_scope(&scope).map_err(|e| ConfigError::Validation {
                message: format!("policy scope: {e}"),
            })?;
            config.validate().context(InvalidLimiterSnafu { scope })?;
        }
        if self.store_backend() == StoreBackend::Redis {
            RedisBucketStore::open(self.redis_url()).map_err(|e| ConfigError::Validation {
                message: format!("redis_url: {e}"),
            })?;
        }
        Ok(())
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr.unwrap_or_else(default_http_addr)
    }

    pub fn key_prefix(&self) -> &str {
        self.key_prefix.as_deref().unwrap_or(DEFAULT_KEY_PREFIX)
    }

    pub fn store_timeout_ms(&self) -> u64 {
        self.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS)
    }

    pub fn redis_url(&self) -> &str {
        self.redis_url.as_deref().unwrap_or(DEFAULT_REDIS_URL)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy.unwrap_or_default()
    }

    pub fn trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for.unwrap_or(false)
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.store.unwrap_or_default()
    }

    /// Built-in policies overlaid with the configured ones.
    pub fn effective_policies(&self) -> BTreeMap<String, ScopePolicy> {
        let mut policies = default_policies();
        policies.extend(self.policies.iter().map(|(scope, policy)| (scope.clone(), *policy)));
        policies
    }

    /// One limiter config per scope.
    pub fn limiter_configs(&self) -> BTreeMap<String, TokenBucketConfig> {
        self.effective_policies()
            .into_iter()
            .map(|(scope, policy)| {
                let config = TokenBucketConfig {
                    capacity: policy.capacity,
                    refill_rate: policy.refill_rate,
                    key_prefix: self.key_prefix().to_string(),
                    failure_policy: self.failure_policy(),
                    store_timeout_ms: self.store_timeout_ms(),
                };
                (scope, config)
            })
            .collect()
    }
}

/// Load configuration with precedence env < TOML < `overrides`, then validate it.
pub fn load_config(toml_path: Option<&Path>, overrides: NodeConfig) -> Result<NodeConfig, ConfigError> {
    let mut config = NodeConfig::from_env()?;

    if let Some(path) = toml_path {
        config.merge(NodeConfig::from_toml_file(path)?);
    }

    config.merge(overrides);
    config.validate()?;
    Ok(config)
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("invalid rate limit configuration for scope '{scope}': {source}"))]
    InvalidLimiter {
        scope: String,
        source: tandem_ratelimit::ConfigError,
    },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}
