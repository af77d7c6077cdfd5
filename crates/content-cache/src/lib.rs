pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod warmup;

use std::sync::Arc;
use std::time::Duration;

pub use cache::{
    CacheKey, CacheLookup, CacheSource, CacheStats, ContentCache, ContentCacheBuilder,
    ContentClass, DistributedStore, InProcessStore, RedisStore, TtlPolicy,
};
pub use config::{AppConfig, CacheConfig, RedisConfig, TtlConfig};
pub use error::{CacheError, CacheResult};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_config};

/// Create the content cache from configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: memory tier only, permanently degraded
/// - **Redis enabled**: memory tier + Redis, with pub/sub invalidation when
///   `cache.pubsub_invalidation` is on
///
/// ## Graceful Degradation
///
/// If the Redis pool can't be created the cache starts memory-only. If Redis
/// doesn't answer the first ping the cache starts degraded and the health
/// check picks it up once it comes back, so the process never fails to start
/// because of Redis.
pub async fn create_content_cache(config: &AppConfig) -> Arc<ContentCache> {
    let builder = ContentCacheBuilder::from_config(config);
    let redis = &config.redis;

    if !redis.enabled {
        tracing::info!("Redis disabled, using memory tier only");
        return builder.build();
    }

    tracing::info!(url = %redis.url, "Connecting to Redis");

    let redis_config = redis_pool_config(redis);
    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to memory tier only."
            );
            return builder.build();
        }
    };

    let mut store = RedisStore::new(pool.clone());
    if let Some(prefix) = &redis.key_prefix {
        store = store.with_key_prefix(prefix.clone());
    }
    let mut builder = builder.distributed(Arc::new(store));

    if config.cache.pubsub_invalidation {
        let mut settings = cache::PubSubSettings::new(pool, redis.url.clone());
        if let Some(prefix) = &redis.key_prefix {
            settings = settings.with_channel(format!("{prefix}:{}", cache::INVALIDATION_CHANNEL));
        }
        builder = builder.pubsub(settings);
    }

    let cache = builder.build();
    if cache.check_distributed().await {
        tracing::info!("Connected to Redis");
    } else {
        tracing::warn!("Redis not reachable, starting in degraded mode");
    }
    cache
}

/// Pool settings for `redis`. `Config::from_url` leaves `pool` unset, so the
/// size and timeouts are filled in here.
fn redis_pool_config(redis: &RedisConfig) -> deadpool_redis::Config {
    let timeout = Some(Duration::from_millis(redis.timeout_ms));
    let mut pool_config = deadpool_redis::PoolConfig::new(redis.pool_size);
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let mut redis_config = deadpool_redis::Config::from_url(&redis.url);
    redis_config.pool = Some(pool_config);
    redis_config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_pool_config_applies_size_and_timeouts() {
        let mut cfg = AppConfig::default();
        cfg.redis.url = "redis://127.0.0.1:6379".to_string();
        cfg.redis.pool_size = 7;
        cfg.redis.timeout_ms = 150;

        let redis_config = redis_pool_config(&cfg.redis);
        let pool = redis_config.pool.expect("pool settings set");
        assert_eq!(pool.max_size, 7);
        assert_eq!(pool.timeouts.wait, Some(Duration::from_millis(150)));
        assert_eq!(pool.timeouts.create, Some(Duration::from_millis(150)));
        assert_eq!(pool.timeouts.recycle, Some(Duration::from_millis(150)));
        assert_eq!(redis_config.url.as_deref(), Some("redis://127.0.0.1:6379"));
    }

    #[tokio::test]
    async fn test_redis_disabled_builds_memory_only_cache() {
        let mut cfg = AppConfig::default();
        cfg.redis.enabled = false;

        let cache = create_content_cache(&cfg).await;
        assert!(cache.is_degraded());
        cache.close().await;
    }
}
