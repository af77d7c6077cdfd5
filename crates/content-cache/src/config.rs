use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    /// Redis configuration (distributed tier)
    #[serde(default)]
    pub redis: RedisConfig,
    /// Per content class TTLs
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Warm-up of static reference data
    #[serde(default)]
    pub warmup: WarmupConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.max_memory_items == 0 {
            return Err("cache.max_memory_items must be > 0".into());
        }
        if self.cache.health_check_interval_ms == 0 {
            return Err("cache.health_check_interval_ms must be > 0".into());
        }
        if self.cache.max_reconnect_backoff_ms < self.cache.health_check_interval_ms {
            return Err(
                "cache.max_reconnect_backoff_ms must be >= cache.health_check_interval_ms".into(),
            );
        }
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.enabled=true requires redis.url".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
        }
        for (name, secs) in [
            ("ttl.static_reference_secs", self.ttl.static_reference_secs),
            ("ttl.catalog_secs", self.ttl.catalog_secs),
            ("ttl.user_data_secs", self.ttl.user_data_secs),
        ] {
            if secs == 0 {
                return Err(format!("{name} must be > 0"));
            }
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.cache.health_check_interval_ms)
    }

    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.cache.max_reconnect_backoff_ms)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.timeout_ms)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory tier (L1) max entries
    #[serde(default = "default_max_memory_items")]
    pub max_memory_items: usize,

    /// How often the distributed tier is probed while healthy
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Upper bound for the reconnect backoff while degraded
    #[serde(default = "default_max_reconnect_backoff_ms")]
    pub max_reconnect_backoff_ms: u64,

    /// Broadcast invalidations to other instances over Redis pub/sub
    #[serde(default = "default_pubsub_invalidation")]
    pub pubsub_invalidation: bool,
}

fn default_max_memory_items() -> usize {
    10000
}

fn default_health_check_interval_ms() -> u64 {
    5000
}

fn default_max_reconnect_backoff_ms() -> u64 {
    30000
}

fn default_pubsub_invalidation() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_items: default_max_memory_items(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_reconnect_backoff_ms: default_max_reconnect_backoff_ms(),
            pubsub_invalidation: default_pubsub_invalidation(),
        }
    }
}

/// Redis configuration for the shared distributed tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (the cache runs memory-only without it)
    /// Default: false
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-call timeout in milliseconds. Kept short: a slow Redis should cost
    /// at most this much latency per request.
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace prepended to every key written to Redis
    #[serde(default)]
    pub key_prefix: Option<String>,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    250
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: None,
        }
    }
}

/// TTL and stale-while-revalidate grace per content class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Taxonomy, competency and code tables
    #[serde(default = "default_static_reference_secs")]
    pub static_reference_secs: u64,
    #[serde(default = "default_static_reference_grace_secs")]
    pub static_reference_grace_secs: u64,

    /// Scenario/program catalogs and listings
    #[serde(default = "default_catalog_secs")]
    pub catalog_secs: u64,
    #[serde(default = "default_catalog_grace_secs")]
    pub catalog_grace_secs: u64,

    /// Per-user or frequently mutated records
    #[serde(default = "default_user_data_secs")]
    pub user_data_secs: u64,
    #[serde(default)]
    pub user_data_grace_secs: u64,

    /// When false, user data bypasses both tiers
    #[serde(default = "default_user_data_cacheable")]
    pub user_data_cacheable: bool,
}

fn default_static_reference_secs() -> u64 {
    6 * 3600
}

fn default_static_reference_grace_secs() -> u64 {
    600
}

fn default_catalog_secs() -> u64 {
    1800
}

fn default_catalog_grace_secs() -> u64 {
    60
}

fn default_user_data_secs() -> u64 {
    120
}

fn default_user_data_cacheable() -> bool {
    true
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            static_reference_secs: default_static_reference_secs(),
            static_reference_grace_secs: default_static_reference_grace_secs(),
            catalog_secs: default_catalog_secs(),
            catalog_grace_secs: default_catalog_grace_secs(),
            user_data_secs: default_user_data_secs(),
            user_data_grace_secs: 0,
            user_data_cacheable: default_user_data_cacheable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log line layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

/// Warm-up configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarmupConfig {
    /// Directory of `{contentType}.{scope}.{language}.json` documents
    #[serde(default)]
    pub dir: Option<String>,

    /// Languages to load; empty means all
    #[serde(default)]
    pub languages: Vec<String>,
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "content-cache.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., CONTENT_CACHE__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("CONTENT_CACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
