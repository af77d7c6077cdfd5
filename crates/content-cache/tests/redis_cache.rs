//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up Redis and are ignored by default;
//! run them with `cargo test -- --ignored` where docker is available.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use content_cache::{AppConfig, CacheSource, ContentClass, create_content_cache};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

/// Config for one test; `namespace` keeps tests from seeing each other's keys.
async fn redis_config(namespace: &str) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.enabled = true;
    cfg.redis.url = get_redis_url().await;
    cfg.redis.pool_size = 5;
    cfg.redis.timeout_ms = 2000;
    cfg.redis.key_prefix = Some(namespace.to_string());
    cfg
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_connection() {
    let cfg = redis_config("conn").await;
    let cache = create_content_cache(&cfg).await;

    assert!(!cache.is_degraded());
    assert!(cache.check_distributed().await);
    cache.close().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_shared_between_instances() {
    let cfg = redis_config("shared").await;
    let first = create_content_cache(&cfg).await;
    let second = create_content_cache(&cfg).await;

    first
        .set("ksa:all:en", vec![1u32, 2, 3], ContentClass::StaticReference)
        .await;

    let value = second
        .get("ksa:all:en", ContentClass::StaticReference, || async {
            Ok::<Vec<u32>, anyhow::Error>(vec![])
        })
        .await
        .unwrap();
    assert_eq!(value.source, CacheSource::Distributed);
    assert_eq!(*value, vec![1, 2, 3]);

    let value = second
        .get("ksa:all:en", ContentClass::StaticReference, || async {
            Ok::<Vec<u32>, anyhow::Error>(vec![])
        })
        .await
        .unwrap();
    assert_eq!(value.source, CacheSource::Memory);

    first.close().await;
    second.close().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_prefix_invalidation() {
    let cfg = redis_config("prefix").await;
    let cache = create_content_cache(&cfg).await;
    let other = create_content_cache(&cfg).await;
    let calls = Arc::new(AtomicUsize::new(0));

    for lang in ["en", "zh", "ar"] {
        cache
            .set(&format!("scenario:12:{lang}"), lang.to_string(), ContentClass::Catalog)
            .await;
    }
    cache
        .set("scenario:120:en", "kept".to_string(), ContentClass::Catalog)
        .await;

    cache.invalidate_by_prefix("scenario:12:").await;

    let counted = calls.clone();
    let reloaded = other
        .get("scenario:12:zh", ContentClass::Catalog, move || async move {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok::<String, anyhow::Error>("reloaded".to_string())
        })
        .await
        .unwrap();
    assert_eq!(reloaded.source, CacheSource::Origin);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let kept = other
        .get("scenario:120:en", ContentClass::Catalog, || async {
            Ok::<String, anyhow::Error>(String::new())
        })
        .await
        .unwrap();
    assert_eq!(kept.source, CacheSource::Distributed);
    assert_eq!(kept.as_str(), "kept");

    cache.close().await;
    other.close().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_pubsub_invalidates_other_instance_memory() {
    let cfg = redis_config("pubsub").await;
    let writer = create_content_cache(&cfg).await;
    let reader = create_content_cache(&cfg).await;

    // give both listeners time to subscribe
    tokio::time::sleep(Duration::from_millis(500)).await;

    writer
        .set("catalog:all:en", "v1".to_string(), ContentClass::Catalog)
        .await;
    let cached = reader
        .get("catalog:all:en", ContentClass::Catalog, || async {
            Ok::<String, anyhow::Error>(String::new())
        })
        .await
        .unwrap();
    assert_eq!(cached.as_str(), "v1");

    writer.invalidate("catalog:all:en").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fresh = reader
        .get("catalog:all:en", ContentClass::Catalog, || async {
            Ok::<String, anyhow::Error>("v2".to_string())
        })
        .await
        .unwrap();
    assert_eq!(fresh.source, CacheSource::Origin);
    assert_eq!(fresh.as_str(), "v2");

    writer.close().await;
    reader.close().await;
}
