//! The cache facade: the only entry point request handlers use.
//!
//! ## Lookup Order
//!
//! 1. Memory tier. Fresh hit: return. Stale hit: return and refresh in the background.
//! 2. Distributed tier. Hit: backfill the memory tier and return.
//! 3. Stampede guard. One loader call per key, result written to both tiers.
//!
//! Tier problems never reach the caller. A corrupt entry, an unreachable
//! Redis or a timeout all read as a miss. The only error `get` returns is
//! [`CacheError::OriginUnavailable`].
//!
//! ## Invalidation
//!
//! `invalidate` deletes from the memory tier first, so a reader that starts
//! after it returns can't see the old value in this process. Loads that
//! started before the invalidation still answer their waiters but don't write
//! their result into either tier.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::distributed::{DistributedStore, DistributedTier, prefix_pattern, spawn_health_check};
use super::memory::{MemoryLookup, MemoryTier, Payload};
use super::policy::{ClassPolicy, ContentClass, TtlPolicy};
use super::pubsub::{
    Invalidation, InvalidationListener, InvalidationPublisher, PubSubSettings,
};
use super::stampede::{FlightRole, SharedLoad, StampedeGuard};
use crate::config::AppConfig;
use crate::error::{CacheError, CacheResult};
use crate::metrics;

/// Where a value returned by [`ContentCache::get`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSource {
    Memory,
    Distributed,
    /// Expired memory entry served inside its grace window
    Stale,
    /// Freshly loaded
    Origin,
}

impl CacheSource {
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheSource::Origin)
    }

    /// Value for a diagnostic response header such as `X-Cache`.
    pub fn header_value(&self) -> &'static str {
        match self {
            CacheSource::Memory | CacheSource::Distributed => "HIT",
            CacheSource::Stale => "STALE",
            CacheSource::Origin => "MISS",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Memory => "memory",
            CacheSource::Distributed => "distributed",
            CacheSource::Stale => "stale",
            CacheSource::Origin => "origin",
        }
    }
}

/// A value plus the tier that produced it.
#[derive(Debug)]
pub struct CacheLookup<T> {
    pub value: Arc<T>,
    pub source: CacheSource,
}

impl<T> CacheLookup<T> {
    fn new(value: Arc<T>, source: CacheSource) -> Self {
        Self { value, source }
    }

    pub fn is_hit(&self) -> bool {
        self.source.is_hit()
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }
}

impl<T> Clone for CacheLookup<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            source: self.source,
        }
    }
}

impl<T> Deref for CacheLookup<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Loader invocations, including background refreshes
    pub loads: u64,
    /// Callers that joined an in-flight load
    pub coalesced: u64,
    pub evictions: u64,
    /// Memory entries dropped after their stale window
    pub expirations: u64,
    pub degraded: bool,
}

impl CacheStats {
    /// Hit rate as a fraction in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
}

/// Builder for [`ContentCache`].
pub struct ContentCacheBuilder {
    max_memory_items: usize,
    policy: TtlPolicy,
    store: Option<Arc<dyn DistributedStore>>,
    timeout: Duration,
    health_check_interval: Duration,
    max_reconnect_backoff: Duration,
    pubsub: Option<PubSubSettings>,
}

impl ContentCacheBuilder {
    pub fn new() -> Self {
        Self {
            max_memory_items: 10_000,
            policy: TtlPolicy::default(),
            store: None,
            timeout: Duration::from_millis(250),
            health_check_interval: Duration::from_secs(5),
            max_reconnect_backoff: Duration::from_secs(30),
            pubsub: None,
        }
    }

    /// Sizes, intervals and TTLs from configuration. The store is wired separately.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new()
            .max_memory_items(cfg.cache.max_memory_items)
            .policy(TtlPolicy::from_config(&cfg.ttl))
            .timeout(cfg.redis_timeout())
            .health_check_interval(cfg.health_check_interval())
            .max_reconnect_backoff(cfg.max_reconnect_backoff())
    }

    pub fn max_memory_items(mut self, max_items: usize) -> Self {
        self.max_memory_items = max_items;
        self
    }

    pub fn policy(mut self, policy: TtlPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn distributed(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Upper bound on every distributed tier call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn max_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.max_reconnect_backoff = backoff;
        self
    }

    /// Publish invalidations and listen for those of other instances.
    pub fn pubsub(mut self, settings: PubSubSettings) -> Self {
        self.pubsub = Some(settings);
        self
    }

    /// Build the cache and start its background tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Arc<ContentCache> {
        let memory = Arc::new(MemoryTier::new(self.max_memory_items));
        let guard = Arc::new(StampedeGuard::new());
        let cancel = CancellationToken::new();
        let mut background = vec![spawn_janitor(
            Arc::clone(&memory),
            self.health_check_interval.max(MIN_SWEEP_INTERVAL),
            cancel.clone(),
        )];

        let distributed = match self.store {
            Some(store) => {
                let name = store.name();
                let tier = Arc::new(DistributedTier::new(store, self.timeout));
                background.push(spawn_health_check(
                    Arc::clone(&tier),
                    self.health_check_interval,
                    self.max_reconnect_backoff,
                    cancel.clone(),
                ));
                tracing::info!(store = name, "content cache using distributed tier");
                tier
            }
            None => {
                tracing::info!("no distributed store configured, memory tier only");
                Arc::new(DistributedTier::absent())
            }
        };
        metrics::set_degraded(distributed.is_degraded());

        let publisher = self.pubsub.map(|settings| {
            let instance_id = Uuid::new_v4();
            let listener = InvalidationListener {
                redis_url: settings.redis_url.clone(),
                channel: settings.channel.clone(),
                instance_id,
                memory: Arc::clone(&memory),
                guard: Arc::clone(&guard),
            };
            background.push(listener.start(cancel.clone()));
            InvalidationPublisher::new(&settings, instance_id)
        });

        Arc::new(ContentCache {
            memory,
            distributed,
            guard,
            policy: self.policy,
            publisher,
            counters: Counters::default(),
            cancel,
            background: Mutex::new(background),
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for ContentCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Multi-tier read cache for content records.
///
/// Construct once with [`ContentCacheBuilder`], share as `Arc<ContentCache>`
/// and call [`close`](ContentCache::close) at shutdown.
pub struct ContentCache {
    memory: Arc<MemoryTier>,
    distributed: Arc<DistributedTier>,
    guard: Arc<StampedeGuard>,
    policy: TtlPolicy,
    publisher: Option<InvalidationPublisher>,
    counters: Counters,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ContentCache {
    pub fn builder() -> ContentCacheBuilder {
        ContentCacheBuilder::new()
    }

    /// Get `key`, calling `loader` only when no tier has it.
    ///
    /// Concurrent misses for the same key share one `loader` call; every
    /// caller gets its value or its error. Loader errors are returned as
    /// [`CacheError::OriginUnavailable`]. Nothing else is.
    pub async fn get<T, F, Fut, E>(
        &self,
        key: &str,
        class: ContentClass,
        loader: F,
    ) -> CacheResult<CacheLookup<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let policy = self.policy.for_class(class);
        if !policy.cacheable {
            self.record_miss(key);
            self.counters.loads.fetch_add(1, Ordering::Relaxed);
            let value = loader().await.map_err(|e| CacheError::origin(key, e))?;
            return Ok(CacheLookup::new(Arc::new(value), CacheSource::Origin));
        }

        match self.memory.get(key) {
            MemoryLookup::Fresh(payload) => {
                if let Some(value) = self.downcast_memory::<T>(key, payload) {
                    self.record_hit(key, CacheSource::Memory);
                    return Ok(CacheLookup::new(value, CacheSource::Memory));
                }
            }
            MemoryLookup::Stale(payload) => {
                if let Some(value) = self.downcast_memory::<T>(key, payload) {
                    self.record_hit(key, CacheSource::Stale);
                    self.refresh(key, policy, loader);
                    return Ok(CacheLookup::new(value, CacheSource::Stale));
                }
            }
            MemoryLookup::Miss => {}
        }

        if let Some(value) = self.read_distributed::<T>(key, policy).await {
            self.record_hit(key, CacheSource::Distributed);
            return Ok(CacheLookup::new(value, CacheSource::Distributed));
        }

        self.record_miss(key);
        let (load, _) = self.start_load(key, policy, loader);
        let payload = load.await?;
        let value = payload
            .downcast::<T>()
            .map_err(|_| CacheError::OriginUnavailable {
                key: key.to_string(),
                message: format!(
                    "in-flight load produced a value other than {}",
                    std::any::type_name::<T>()
                ),
            })?;
        Ok(CacheLookup::new(value, CacheSource::Origin))
    }

    /// Write `value` to both tiers with the TTL of `class`.
    ///
    /// The distributed write is attempted even while degraded. Failures are
    /// logged and absorbed.
    pub async fn set<T>(&self, key: &str, value: T, class: ContentClass)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let policy = self.policy.for_class(class);
        if !policy.cacheable {
            tracing::debug!(key = %key, class = %class, "class is not cacheable, set ignored");
            return;
        }

        let value = Arc::new(value);
        self.memory.put(
            key,
            Arc::clone(&value) as Payload,
            policy.ttl,
            policy.stale_grace,
        );
        match rmp_serde::to_vec_named(value.as_ref()) {
            Ok(bytes) => {
                self.distributed.set(key, &bytes, policy.ttl).await;
            }
            Err(e) => {
                let err = CacheError::from(e);
                tracing::warn!(key = %key, error = %err, "value not written to distributed tier");
            }
        }
        metrics::set_memory_entries(self.memory.len());
    }

    /// Remove `key` from both tiers.
    ///
    /// The memory tier is cleared first. The distributed delete is attempted
    /// even while degraded; if it fails it is logged and replayed once the
    /// store answers a health check again.
    pub async fn invalidate(&self, key: &str) {
        self.memory.delete(key);
        self.guard.detach(key);
        metrics::record_invalidation("key");

        if self.distributed.is_configured() {
            if let Err(e) = self.distributed.delete(key).await {
                self.report_partial_failure(key, e);
            }
        }

        if let Some(publisher) = &self.publisher {
            publisher.publish(Invalidation::Key(key.to_string()));
        }
        metrics::set_memory_entries(self.memory.len());
        tracing::debug!(key = %key, "invalidated");
    }

    /// Remove every key starting with `prefix` from both tiers.
    pub async fn invalidate_by_prefix(&self, prefix: &str) {
        let removed = self.memory.delete_prefix(prefix);
        self.guard.detach_prefix(prefix);
        metrics::record_invalidation("prefix");

        let mut distributed_removed = 0;
        if self.distributed.is_configured() {
            match self.distributed.delete_matching(&prefix_pattern(prefix)).await {
                Ok(n) => distributed_removed = n,
                Err(e) => self.report_partial_failure(prefix, e),
            }
        }

        if let Some(publisher) = &self.publisher {
            publisher.publish(Invalidation::Prefix(prefix.to_string()));
        }
        metrics::set_memory_entries(self.memory.len());
        tracing::debug!(
            prefix = %prefix,
            memory_removed = removed,
            distributed_removed,
            "invalidated by prefix"
        );
    }

    /// True while the distributed tier is unreachable or not configured.
    pub fn is_degraded(&self) -> bool {
        self.distributed.is_degraded()
    }

    /// Ping the distributed tier now and update the degraded flag.
    ///
    /// Returns whether it answered. Suited to readiness probes.
    pub async fn check_distributed(&self) -> bool {
        self.distributed.probe().await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len(),
            memory_capacity: self.memory.capacity(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            coalesced: self.guard.coalesced(),
            evictions: self.memory.evictions(),
            expirations: self.memory.expirations(),
            degraded: self.is_degraded(),
        }
    }

    /// Stop background tasks, wait for running loads and drop the memory tier.
    ///
    /// Idempotent. The cache still answers reads afterwards, without the
    /// health check or cross-instance invalidation.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "cache background task ended abnormally");
            }
        }
        self.guard.shutdown().await;
        self.memory.clear();
        metrics::set_memory_entries(0);

        tracing::info!("content cache closed");
    }

    fn downcast_memory<T>(&self, key: &str, payload: Payload) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        match payload.downcast::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                let err = CacheError::CorruptEntry {
                    key: key.to_string(),
                    reason: format!("memory entry is not a {}", std::any::type_name::<T>()),
                };
                tracing::warn!(key = %key, error = %err, "dropping corrupt memory entry");
                metrics::record_tier_error("memory", err.kind());
                self.memory.delete(key);
                None
            }
        }
    }

    async fn read_distributed<T>(&self, key: &str, policy: ClassPolicy) -> Option<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let generation = self.memory.generation();
        let bytes = self.distributed.get(key).await?;

        match rmp_serde::from_slice::<T>(&bytes) {
            Ok(value) => {
                let value = Arc::new(value);
                self.memory.put_if_generation(
                    key,
                    Arc::clone(&value) as Payload,
                    policy.ttl,
                    policy.stale_grace,
                    generation,
                );
                Some(value)
            }
            Err(e) => {
                let err = CacheError::CorruptEntry {
                    key: key.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(key = %key, error = %err, "dropping corrupt distributed entry");
                metrics::record_tier_error("distributed", err.kind());
                if let Err(e) = self.distributed.delete(key).await {
                    tracing::debug!(key = %key, error = %e, "corrupt entry not deleted");
                }
                None
            }
        }
    }

    /// Serve stale, refresh once in the background. A caller that finds a
    /// refresh already running just joins it.
    fn refresh<T, F, Fut, E>(&self, key: &str, policy: ClassPolicy, loader: F)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let (_, role) = self.start_load(key, policy, loader);
        if role == FlightRole::Leader {
            tracing::debug!(key = %key, "refreshing stale entry in background");
        }
    }

    fn start_load<T, F, Fut, E>(
        &self,
        key: &str,
        policy: ClassPolicy,
        loader: F,
    ) -> (SharedLoad, FlightRole)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let memory = Arc::clone(&self.memory);
        let distributed = Arc::clone(&self.distributed);
        // read before the loader runs so a concurrent invalidate is noticed
        let generation = memory.generation();
        let owned_key = key.to_string();

        let (load, role) = self.guard.join_or_start(key, move || {
            async move {
                let started = Instant::now();
                let value = match loader().await {
                    Ok(value) => Arc::new(value),
                    Err(e) => {
                        let err = CacheError::origin(&owned_key, e);
                        metrics::record_load("error");
                        tracing::warn!(key = %owned_key, error = %err, "loader failed");
                        return Err(err);
                    }
                };
                metrics::record_load("ok");
                tracing::debug!(
                    key = %owned_key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "loaded from origin"
                );

                populate(&memory, &distributed, &owned_key, &value, policy, generation).await;
                Ok(value as Payload)
            }
            .boxed()
        });

        if role == FlightRole::Leader {
            self.counters.loads.fetch_add(1, Ordering::Relaxed);
        }
        (load, role)
    }

    fn record_hit(&self, key: &str, source: CacheSource) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_hit(source.as_str());
        tracing::debug!(key = %key, tier = source.as_str(), "cache hit");
    }

    fn record_miss(&self, key: &str) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_miss();
        tracing::debug!(key = %key, "cache miss");
    }

    fn report_partial_failure(&self, target: &str, cause: CacheError) {
        let err = CacheError::InvalidationPartialFailure {
            target: target.to_string(),
            reason: cause.to_string(),
        };
        metrics::record_tier_error("distributed", err.kind());
        tracing::warn!(
            invalidated = %target,
            error = %err,
            "memory tier cleared, distributed delete queued for retry"
        );
    }
}

/// Periodically drop memory entries past their stale window so idle keys
/// don't hold slots until LRU pressure pushes them out.
fn spawn_janitor(
    memory: Arc<MemoryTier>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let purged = memory.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "purged expired memory entries");
            }
            metrics::set_memory_entries(memory.len());
        }
    })
}

/// Write a fresh load into both tiers unless `key` was invalidated since
/// `generation` was read.
async fn populate<T>(
    memory: &MemoryTier,
    distributed: &DistributedTier,
    key: &str,
    value: &Arc<T>,
    policy: ClassPolicy,
    generation: u64,
) where
    T: Serialize + Send + Sync + 'static,
{
    if memory.deleted_since(key, generation) {
        tracing::debug!(key = %key, "invalidated while loading, result not cached");
        return;
    }

    match rmp_serde::to_vec_named(value.as_ref()) {
        Ok(bytes) => {
            let written = distributed.set(key, &bytes, policy.ttl).await;
            if written && memory.deleted_since(key, generation) {
                // invalidated during the write; undo it
                if let Err(e) = distributed.delete(key).await {
                    tracing::debug!(key = %key, error = %e, "could not undo distributed write");
                }
                return;
            }
        }
        Err(e) => {
            let err = CacheError::from(e);
            tracing::warn!(key = %key, error = %err, "loaded value not written to distributed tier");
        }
    }

    if !memory.put_if_generation(
        key,
        Arc::clone(value) as Payload,
        policy.ttl,
        policy.stale_grace,
        generation,
    ) {
        tracing::debug!(key = %key, "invalidated while loading, result not cached");
    }
    metrics::set_memory_entries(memory.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_header_values() {
        assert_eq!(CacheSource::Memory.header_value(), "HIT");
        assert_eq!(CacheSource::Distributed.header_value(), "HIT");
        assert_eq!(CacheSource::Stale.header_value(), "STALE");
        assert_eq!(CacheSource::Origin.header_value(), "MISS");
        assert!(CacheSource::Stale.is_hit());
        assert!(!CacheSource::Origin.is_hit());
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_memory_only_cache_is_degraded() {
        let cache = ContentCache::builder().max_memory_items(4).build();
        assert!(cache.is_degraded());

        let first = cache
            .get("catalog:all:en", ContentClass::Catalog, || async {
                Ok::<_, anyhow::Error>(vec![1u32, 2])
            })
            .await
            .unwrap();
        assert_eq!(first.source, CacheSource::Origin);

        let second = cache
            .get("catalog:all:en", ContentClass::Catalog, || async {
                Ok::<_, anyhow::Error>(vec![9u32])
            })
            .await
            .unwrap();
        assert_eq!(second.source, CacheSource::Memory);
        assert_eq!(*second, vec![1, 2]);

        cache.close().await;
        assert_eq!(cache.stats().memory_entries, 0);
    }
}
