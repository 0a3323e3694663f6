//! Configuration management for Ratekeeper.
//!
//! Configuration is layered: an optional YAML file, then `RATEKEEPER__`-prefixed
//! environment variables (e.g. `RATEKEEPER__SERVER__LISTEN_ADDR`), then the
//! `RATE_LIMIT_*` / `REDIS_*` variables understood by earlier deployments.
//! Durations are written in human form: `"1s"`, `"5m"`, `"250ms"`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{ScopeConfig, ScopeRegistry};
use crate::store::RedisStore;

const ENV_PREFIX: &str = "RATEKEEPER";
const TOKEN_ENV_PREFIX: &str = "RATE_LIMIT_TOKEN_";
const TOKEN_ENV_SUFFIX: &str = "_REQUESTS";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit scopes
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Request header carrying the access token
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Whether `X-Forwarded-For` / `X-Real-IP` are trusted for the client address
    #[serde(default = "default_trust_forwarded_headers")]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            token_header: default_token_header(),
            trust_forwarded_headers: default_trust_forwarded_headers(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

fn default_trust_forwarded_headers() -> bool {
    true
}

/// Which counter store backend to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is lost on restart and not shared between instances
    #[default]
    Memory,
    /// Redis store shared by every instance pointing at the same server
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// How often the memory store drops expired records
    #[serde(default = "default_purge_interval", with = "human_duration")]
    pub purge_interval: Duration,

    /// Redis connection settings, used when `backend` is `redis`
    #[serde(default)]
    pub redis: RedisSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            purge_interval: default_purge_interval(),
            redis: RedisSettings::default(),
        }
    }
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(60)
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// `host:port` of the Redis server
    #[serde(default = "default_redis_addr")]
    pub addr: String,

    /// Password; empty for none
    #[serde(default)]
    pub password: String,

    /// Database number
    #[serde(default)]
    pub db: i64,

    /// Prefix for every key written
    #[serde(default)]
    pub key_prefix: String,

    /// Timeout for a single Redis operation
    #[serde(default = "default_redis_timeout", with = "human_duration")]
    pub timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: String::new(),
            db: 0,
            key_prefix: String::new(),
            timeout: default_redis_timeout(),
        }
    }
}

impl RedisSettings {
    /// Connection URL for these settings.
    pub fn url(&self) -> String {
        RedisStore::url(&self.addr, &self.password, self.db)
    }
}

fn default_redis_addr() -> String {
    "localhost:6379".to_string()
}

fn default_redis_timeout() -> Duration {
    Duration::from_secs(2)
}

/// The address scope and any token scopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Scope applied per client address
    #[serde(default)]
    pub address: ScopeSettings,

    /// Scopes keyed by access token
    #[serde(default)]
    pub tokens: HashMap<String, ScopeSettings>,
}

/// Unvalidated scope settings as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSettings {
    /// Requests allowed per window
    #[serde(default = "default_requests")]
    pub requests: u64,

    /// Counting window
    #[serde(default = "default_window", with = "human_duration")]
    pub window: Duration,

    /// Block applied once the limit is exceeded
    #[serde(default = "default_block_time", with = "human_duration")]
    pub block_time: Duration,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            window: default_window(),
            block_time: default_block_time(),
        }
    }
}

impl ScopeSettings {
    /// Validate these settings into a [`ScopeConfig`].
    pub fn to_scope(&self) -> Result<ScopeConfig> {
        ScopeConfig::new(self.requests, self.window, self.block_time)
    }
}

fn default_requests() -> u64 {
    10
}

fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_block_time() -> Duration {
    Duration::from_secs(300)
}

impl RatekeeperConfig {
    /// Load configuration from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, std::env::vars().collect())
    }

    /// Load configuration from an optional YAML file and the given environment.
    ///
    /// The file is parsed with `serde_yaml` so token keys keep their case.
    /// `RATEKEEPER__` overrides are layered through the `config` crate, which
    /// lowercases keys and splits them on `.`; tokens that would not survive that
    /// bypass the layer and are restored unchanged afterwards.
    pub fn load_with_env(path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        let mut base = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration file");
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        let (layered, verbatim): (HashMap<_, _>, HashMap<_, _>) = base
            .limits
            .tokens
            .drain()
            .partition(|(token, _)| is_layerable_key(token));
        base.limits.tokens = layered;

        let mut config: RatekeeperConfig = Config::builder()
            .add_source(Config::try_from(&base)?)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env.clone())),
            )
            .build()?
            .try_deserialize()?;

        for (token, settings) in verbatim {
            config.limits.tokens.entry(token).or_insert(settings);
        }

        config.with_legacy_env(env)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Apply the `RATE_LIMIT_*` and `REDIS_*` variables on top of this configuration.
    ///
    /// Token scopes come from `RATE_LIMIT_TOKEN_<TOKEN>_REQUESTS` with optional
    /// `_WINDOW` and `_BLOCK_TIME` companions; the token keeps its case. Empty
    /// values count as unset, and unparsable counts are ignored. Unparsable
    /// durations are errors.
    pub fn with_legacy_env<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();

        if let Some(requests) = parse_count(&vars, "RATE_LIMIT_IP_REQUESTS") {
            self.limits.address.requests = requests;
        }
        if let Some(window) = parse_env_duration(&vars, "RATE_LIMIT_IP_WINDOW")? {
            self.limits.address.window = window;
        }
        if let Some(block_time) = parse_env_duration(&vars, "RATE_LIMIT_IP_BLOCK_TIME")? {
            self.limits.address.block_time = block_time;
        }

        for name in vars.keys() {
            let Some(token) = name
                .strip_prefix(TOKEN_ENV_PREFIX)
                .and_then(|rest| rest.strip_suffix(TOKEN_ENV_SUFFIX))
                .filter(|token| !token.is_empty())
            else {
                continue;
            };

            let requests = parse_count(&vars, name).unwrap_or(0);
            if requests == 0 {
                warn!(token = %token, "Ignoring token scope without a request count");
                continue;
            }

            let window = parse_env_duration(&vars, &format!("{TOKEN_ENV_PREFIX}{token}_WINDOW"))?
                .unwrap_or_else(default_window);
            let block_time =
                parse_env_duration(&vars, &format!("{TOKEN_ENV_PREFIX}{token}_BLOCK_TIME"))?
                    .unwrap_or_else(default_block_time);

            self.limits.tokens.insert(
                token.to_string(),
                ScopeSettings {
                    requests,
                    window,
                    block_time,
                },
            );
        }

        if let Some(addr) = vars.get("REDIS_ADDR") {
            self.store.redis.addr.clone_from(addr);
        }
        if let Some(password) = vars.get("REDIS_PASSWORD") {
            self.store.redis.password.clone_from(password);
        }
        if let Some(db) = vars.get("REDIS_DB").and_then(|v| v.trim().parse().ok()) {
            self.store.redis.db = db;
        }

        Ok(self)
    }

    /// Validate every scope and build the registry the rate limiter runs on.
    pub fn registry(&self) -> Result<ScopeRegistry> {
        let address_scope = self.limits.address.to_scope().map_err(|e| {
            RatekeeperError::InvalidScope(format!("address scope: {}", e))
        })?;
        let mut registry = ScopeRegistry::new(address_scope);

        let tokens: BTreeMap<_, _> = self.limits.tokens.iter().collect();
        for (token, settings) in tokens {
            if token.is_empty() {
                return Err(RatekeeperError::InvalidScope(
                    "token scope with an empty token".to_string(),
                ));
            }
            let scope = settings.to_scope().map_err(|e| {
                RatekeeperError::InvalidScope(format!("token scope '{}': {}", token, e))
            })?;
            registry.register(token.clone(), scope);
        }

        Ok(registry)
    }
}

/// Whether `key` passes through the `config` crate unchanged.
fn is_layerable_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn parse_count(vars: &HashMap<String, String>, name: &str) -> Option<u64> {
    vars.get(name).and_then(|value| value.trim().parse().ok())
}

fn parse_env_duration(vars: &HashMap<String, String>, name: &str) -> Result<Option<Duration>> {
    vars.get(name)
        .map(|value| {
            humantime::parse_duration(value.trim()).map_err(|e| {
                RatekeeperError::Config(format!("Invalid duration for {}: {}", name, e))
            })
        })
        .transpose()
}

/// Serde adapter for durations written as `"1s"`, `"5m"`, `"1h 30m"`.
mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
