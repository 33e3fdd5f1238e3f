//! Configuration management for Gatekeeper.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `GATEKEEPER_*` environment variables (`__` separates nesting levels, e.g.
//! `GATEKEEPER_RATE_LIMITING__MAX_REQUESTS=20`). Per-token overrides can also
//! be given as `TOKEN_LIMIT_<TOKEN>=<max>:<duration>`, e.g.
//! `TOKEN_LIMIT_ABC123=100:5m`.
//!
//! The unprefixed names `RATE_LIMIT_MAX_REQUESTS`, `RATE_LIMIT_BLOCK_DURATION`,
//! `RATE_LIMIT_TOKEN_HEADER`, `REDIS_ADDR`, `REDIS_PASSWORD` and `REDIS_DB`
//! are accepted as aliases; a `GATEKEEPER_*` setting wins over its alias.
//! Variables may also come from a `.env` file, and the process environment
//! wins over it.

use ::config::builder::{ConfigBuilder, DefaultState};
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{
    IdentityResolver, LimitConfig, TokenLimit, DEFAULT_BLOCK_DURATION, DEFAULT_MAX_REQUESTS,
    DEFAULT_TOKEN_HEADER,
};

/// Prefix of layered environment settings.
pub const ENV_PREFIX: &str = "GATEKEEPER";
/// Prefix of per-token override variables.
pub const TOKEN_LIMIT_PREFIX: &str = "TOKEN_LIMIT_";

/// Unprefixed variables and the layered settings they stand for.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("RATE_LIMIT_MAX_REQUESTS", "GATEKEEPER_RATE_LIMITING__MAX_REQUESTS"),
    ("RATE_LIMIT_BLOCK_DURATION", "GATEKEEPER_RATE_LIMITING__BLOCK_DURATION"),
    ("RATE_LIMIT_TOKEN_HEADER", "GATEKEEPER_RATE_LIMITING__TOKEN_HEADER"),
];
const REDIS_URL_VAR: &str = "GATEKEEPER_STORAGE__REDIS_URL";
const DEFAULT_REDIS_ADDR: &str = "localhost:6379";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Add `x-ratelimit-remaining` to admitted responses
    #[serde(default)]
    pub rate_limit_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            rate_limit_headers: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per one-second window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// How long an identity stays blocked after exceeding its limit
    #[serde(default = "default_block_duration", with = "humantime_duration")]
    pub block_duration: Duration,

    /// Header carrying the API token
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Per-token overrides. Later entries for the same token win.
    #[serde(default)]
    pub token_limits: Vec<TokenLimitConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            block_duration: default_block_duration(),
            token_header: default_token_header(),
            token_limits: Vec::new(),
        }
    }
}

fn default_max_requests() -> u64 {
    DEFAULT_MAX_REQUESTS
}

fn default_block_duration() -> Duration {
    DEFAULT_BLOCK_DURATION
}

fn default_token_header() -> String {
    DEFAULT_TOKEN_HEADER.to_string()
}

/// Limits for one token.
///
/// Tokens are listed rather than used as map keys so their case survives
/// layered loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimitConfig {
    pub token: String,
    pub max_requests: u64,
    #[serde(with = "humantime_duration")]
    pub block_duration: Duration,
}

impl RateLimitingConfig {
    /// Build the limiter's limit configuration.
    pub fn to_limit_config(&self) -> LimitConfig {
        let token_limits = self
            .token_limits
            .iter()
            .map(|t| (t.token.clone(), TokenLimit::new(t.max_requests, t.block_duration)))
            .collect();

        LimitConfig {
            default_max_requests: self.max_requests,
            default_block_duration: self.block_duration,
            identity_header: self.token_header.clone(),
            token_limits,
        }
    }
}

/// Which storage backend holds counters and blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for connecting to Redis at startup
    #[serde(default = "default_connect_timeout", with = "humantime_duration")]
    pub connect_timeout: Duration,

    /// Upper bound for each Redis round trip
    #[serde(default = "default_operation_timeout", with = "humantime_duration")]
    pub operation_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            connect_timeout: default_connect_timeout(),
            operation_timeout: default_operation_timeout(),
        }
    }
}

fn default_key_prefix() -> String {
    "gatekeeper:".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(500)
}

impl ServiceConfig {
    /// Load configuration from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let mut env = dotenv_vars();
        env.extend(std::env::vars());

        Self::from_layers(builder, env)
    }

    /// Finish loading: apply `env` over `builder`, then validate.
    fn from_layers(
        builder: ConfigBuilder<DefaultState>,
        mut env: ::config::Map<String, String>,
    ) -> Result<Self> {
        apply_env_aliases(&mut env)?;

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env.clone())),
            )
            .build()
            .map_err(|e| GatekeeperError::Config(format!("Failed to load configuration: {}", e)))?;

        let mut config: ServiceConfig = settings
            .try_deserialize()
            .map_err(|e| GatekeeperError::Config(format!("Invalid configuration: {}", e)))?;

        let mut from_env: Vec<_> = token_limits_from_env(&env).into_iter().collect();
        from_env.sort_by(|a, b| a.0.cmp(&b.0));
        config
            .rate_limiting
            .token_limits
            .extend(from_env.into_iter().map(|(token, limit)| TokenLimitConfig {
                token,
                max_requests: limit.max_requests,
                block_duration: limit.block_duration,
            }));

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without environment layering.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;

        if limits.max_requests == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.max_requests must be positive".to_string(),
            ));
        }
        if limits.block_duration.is_zero() {
            return Err(GatekeeperError::Config(
                "rate_limiting.block_duration must be positive".to_string(),
            ));
        }
        IdentityResolver::new(&limits.token_header)?;

        for token_limit in &limits.token_limits {
            if token_limit.max_requests == 0 {
                return Err(GatekeeperError::Config(format!(
                    "token limit for {:?}: max_requests must be positive",
                    token_limit.token
                )));
            }
            if token_limit.block_duration.is_zero() {
                return Err(GatekeeperError::Config(format!(
                    "token limit for {:?}: block_duration must be positive",
                    token_limit.token
                )));
            }
        }

        if self.storage.backend == StorageBackend::Redis && self.storage.redis_url.is_none() {
            return Err(GatekeeperError::Config(
                "storage.redis_url is required for the redis backend".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read variables from a `.env` file in the working directory or a parent.
///
/// A missing file yields nothing. The process environment is left untouched.
fn dotenv_vars() -> ::config::Map<String, String> {
    match dotenvy::dotenv_iter() {
        Ok(iter) => collect_dotenv(iter),
        Err(e) if e.not_found() => ::config::Map::new(),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable .env file");
            ::config::Map::new()
        }
    }
}

fn collect_dotenv<I>(iter: I) -> ::config::Map<String, String>
where
    I: Iterator<Item = dotenvy::Result<(String, String)>>,
{
    let mut vars = ::config::Map::new();
    for item in iter {
        match item {
            Ok((name, value)) => {
                vars.insert(name, value);
            }
            Err(e) => warn!(error = %e, "Skipping malformed .env entry"),
        }
    }
    debug!(count = vars.len(), "Read variables from .env");
    vars
}

/// Rewrite unprefixed variables onto their `GATEKEEPER_*` names.
fn apply_env_aliases(env: &mut ::config::Map<String, String>) -> Result<()> {
    for &(alias, name) in ENV_ALIASES {
        if env.contains_key(name) {
            continue;
        }
        if let Some(value) = env.get(alias).filter(|value| !value.is_empty()).cloned() {
            env.insert(name.to_string(), value);
        }
    }

    if !env.contains_key(REDIS_URL_VAR) {
        if let Some(url) = redis_url_from_parts(env)? {
            env.insert(REDIS_URL_VAR.to_string(), url);
        }
    }

    Ok(())
}

/// Assemble a Redis URL from `REDIS_ADDR`, `REDIS_PASSWORD` and `REDIS_DB`.
fn redis_url_from_parts(env: &::config::Map<String, String>) -> Result<Option<String>> {
    let part = |name: &str| env.get(name).map(String::as_str).filter(|v| !v.is_empty());
    let (addr, password, db) = (part("REDIS_ADDR"), part("REDIS_PASSWORD"), part("REDIS_DB"));
    if addr.is_none() && password.is_none() && db.is_none() {
        return Ok(None);
    }

    let addr = addr.unwrap_or(DEFAULT_REDIS_ADDR);
    let mut url = Url::parse(&format!("redis://{}", addr))
        .map_err(|e| GatekeeperError::Config(format!("invalid REDIS_ADDR {:?}: {}", addr, e)))?;

    if let Some(password) = password {
        url.set_password(Some(password))
            .map_err(|_| GatekeeperError::Config(format!("invalid REDIS_ADDR {:?}", addr)))?;
    }

    if let Some(db) = db {
        let db: u32 = db
            .parse()
            .map_err(|e| GatekeeperError::Config(format!("invalid REDIS_DB {:?}: {}", db, e)))?;
        url.set_path(&format!("/{}", db));
    }

    Ok(Some(url.to_string()))
}

/// Collect `TOKEN_LIMIT_<TOKEN>=<max>:<duration>` overrides.
///
/// Malformed entries are skipped with a warning.
pub fn token_limits_from_env<I, K, V>(vars: I) -> HashMap<String, TokenLimit>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut limits = HashMap::new();

    for (name, value) in vars {
        let Some(token) = name.as_ref().strip_prefix(TOKEN_LIMIT_PREFIX) else {
            continue;
        };
        if token.is_empty() {
            continue;
        }

        match parse_token_limit(value.as_ref()) {
            Some(limit) => {
                limits.insert(token.to_string(), limit);
            }
            None => warn!(
                variable = %name.as_ref(),
                "Ignoring token limit, expected <max_requests>:<duration>"
            ),
        }
    }

    limits
}

fn parse_token_limit(value: &str) -> Option<TokenLimit> {
    let (max_requests, duration) = value.split_once(':')?;
    let max_requests = max_requests.trim().parse().ok()?;
    let block_duration = humantime::parse_duration(duration.trim()).ok()?;
    Some(TokenLimit::new(max_requests, block_duration))
}

/// Serde adapter for human-readable durations such as `500ms` or `5m`.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
