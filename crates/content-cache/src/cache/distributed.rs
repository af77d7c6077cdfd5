//! Distributed tier: shared key/value store with native TTL.
//!
//! ## Failure Handling
//!
//! The [`DistributedTier`] adapter wraps every store call in a short timeout.
//! Any connection, pool or timeout error is logged, recorded and turned into a
//! miss (reads) or a no-op (writes) so the facade can always fall through.
//! The first failure flips the tier into degraded mode. While degraded, reads
//! skip the store and only the background health check reads from it. Writes
//! and deletes are still attempted, each bounded by the same timeout, so an
//! invalidation issued during a short blip still reaches the store. Deletes
//! that fail are remembered and replayed after the next successful probe,
//! which also clears degraded mode.
//!
//! ```text
//!   healthy ──(call fails / times out)──▶ degraded
//!      ▲                                     │
//!      └────────(health check PING ok)───────┘
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};
use crate::metrics;

/// Batch size hint for SCAN during pattern invalidation.
const SCAN_COUNT: usize = 500;

/// Failed deletes kept for replay. Beyond this they expire with their TTL.
const MAX_PENDING_DELETES: usize = 10_000;

/// Operations the cache needs from a shared key/value store.
///
/// Implementations report failures as errors; the [`DistributedTier`] adapter
/// is the layer that absorbs them.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a value. `ttl` is always set; entries never live unbounded.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> CacheResult<u64>;

    /// Keys matching a glob-style pattern (`*`, `?`, `\` escapes).
    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Cheap liveness probe used by the health check.
    async fn ping(&self) -> CacheResult<()>;

    fn name(&self) -> &'static str {
        "distributed"
    }
}

/// Redis-backed store using a deadpool connection pool.
pub struct RedisStore {
    pool: Pool,
    key_prefix: Option<String>,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            key_prefix: None,
        }
    }

    /// Namespace every key with `{prefix}:` so several deployments can share one Redis.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.key_prefix = (!prefix.is_empty()).then(|| format!("{prefix}:"));
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[inline]
    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix(&self, key: String) -> String {
        match &self.key_prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .map(str::to_string)
                .unwrap_or(key),
            None => key,
        }
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let data = conn.get::<_, Option<Vec<u8>>>(self.full_key(key)).await?;
        Ok(data)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        // SETEX rejects 0; sub-second TTLs round up to one second
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.full_key(key), value, ttl_secs)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let removed = conn.del::<_, u64>(full).await?;
        Ok(removed)
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let pattern = match &self.key_prefix {
            Some(prefix) => format!("{}{pattern}", escape_glob(prefix)),
            None => pattern.to_string(),
        };

        // SCAN instead of KEYS so a large keyspace doesn't block Redis
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch.into_iter().map(|k| self.strip_prefix(k)));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Escape glob metacharacters so `s` matches literally.
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Glob pattern matching every key that starts with `prefix`.
pub fn prefix_pattern(prefix: &str) -> String {
    format!("{}*", escape_glob(prefix))
}

/// Deletes that did not reach the store.
#[derive(Default)]
struct PendingDeletes {
    keys: HashSet<String>,
    patterns: HashSet<String>,
}

impl PendingDeletes {
    fn len(&self) -> usize {
        self.keys.len() + self.patterns.len()
    }
}

/// Adapter that makes the distributed store safe to call from the read path.
pub struct DistributedTier {
    store: Option<Arc<dyn DistributedStore>>,
    timeout: Duration,
    degraded: AtomicBool,
    failures: AtomicU64,
    pending: Mutex<PendingDeletes>,
}

impl DistributedTier {
    /// Wrap a store. Every call is bounded by `timeout`.
    pub fn new(store: Arc<dyn DistributedStore>, timeout: Duration) -> Self {
        Self {
            store: Some(store),
            timeout,
            degraded: AtomicBool::new(false),
            failures: AtomicU64::new(0),
            pending: Mutex::new(PendingDeletes::default()),
        }
    }

    /// No store configured: permanently degraded, every call is a miss/no-op.
    pub fn absent() -> Self {
        Self {
            store: None,
            timeout: Duration::ZERO,
            degraded: AtomicBool::new(true),
            failures: AtomicU64::new(0),
            pending: Mutex::new(PendingDeletes::default()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of failed calls since start.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deletes waiting for the store to come back.
    pub fn pending_deletes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Store to use for a foreground read, or `None` when degraded.
    fn readable(&self) -> Option<&Arc<dyn DistributedStore>> {
        if self.is_degraded() {
            return None;
        }
        self.store.as_ref()
    }

    /// Read a key. Failures and degraded mode both read as a miss.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let store = self.readable()?;
        match self.guarded("get", store.get(key)).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "distributed GET failed, treating as miss");
                None
            }
        }
    }

    /// Write a key. Returns whether the write reached the store.
    ///
    /// Attempted even while degraded.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match self.guarded("set", store.set(key, value, ttl)).await {
            Ok(()) => {
                self.pending.lock().keys.remove(key);
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "distributed SET failed");
                false
            }
        }
    }

    /// Delete one key. Attempted even while degraded.
    ///
    /// Errors are returned (not swallowed) so invalidation can report a
    /// partial failure. A failed delete is queued for replay.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let result = self.try_delete(key).await;
        if result.is_err() && self.is_configured() {
            self.queue_pending(|pending| pending.keys.insert(key.to_string()));
        }
        result
    }

    /// Delete every key matching a glob pattern. Returns how many were removed.
    ///
    /// Attempted even while degraded; a failure is queued for replay.
    pub async fn delete_matching(&self, pattern: &str) -> CacheResult<u64> {
        let result = self.try_delete_matching(pattern).await;
        if result.is_err() && self.is_configured() {
            self.queue_pending(|pending| pending.patterns.insert(pattern.to_string()));
        }
        result
    }

    async fn try_delete(&self, key: &str) -> CacheResult<()> {
        let store = self.require()?;
        self.guarded("delete", store.delete(&[key.to_string()]))
            .await
            .map(|_| ())
    }

    async fn try_delete_matching(&self, pattern: &str) -> CacheResult<u64> {
        let store = self.require()?;
        let keys = self
            .guarded("keys_matching", store.keys_matching(pattern))
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.guarded("delete", store.delete(&keys)).await
    }

    fn require(&self) -> CacheResult<&Arc<dyn DistributedStore>> {
        self.store.as_ref().ok_or_else(|| {
            CacheError::TierUnavailable("no distributed store configured".to_string())
        })
    }

    fn queue_pending(&self, insert: impl FnOnce(&mut PendingDeletes) -> bool) {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING_DELETES {
            tracing::warn!(
                pending = pending.len(),
                "too many deletes waiting for the distributed tier, entry expires with its TTL"
            );
            return;
        }
        insert(&mut pending);
    }

    /// Probe the store regardless of degraded state and update the flag.
    ///
    /// After a successful ping, queued deletes are replayed before degraded
    /// mode is cleared.
    pub async fn probe(&self) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        if self.guarded("ping", store.ping()).await.is_err() {
            return false;
        }
        // queued deletes land before reads go back to the store
        if !self.replay_pending().await {
            return false;
        }
        self.mark_healthy();
        true
    }

    /// Retry deletes that failed earlier. Ones that fail again stay queued.
    ///
    /// Returns whether every queued delete went through.
    async fn replay_pending(&self) -> bool {
        let PendingDeletes { keys, patterns } = std::mem::take(&mut *self.pending.lock());
        if keys.is_empty() && patterns.is_empty() {
            return true;
        }
        tracing::info!(
            keys = keys.len(),
            patterns = patterns.len(),
            "replaying deletes queued while the distributed tier was unreachable"
        );
        let mut replayed = true;
        for key in keys {
            if let Err(e) = self.delete(&key).await {
                tracing::debug!(key = %key, error = %e, "queued delete failed again");
                replayed = false;
            }
        }
        for pattern in patterns {
            if let Err(e) = self.delete_matching(&pattern).await {
                tracing::debug!(pattern = %pattern, error = %e, "queued delete failed again");
                replayed = false;
            }
        }
        replayed
    }

    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::TierUnavailable(format!(
                "{op} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };
        if let Err(ref e) = result {
            self.mark_failed(op, e);
        }
        result
    }

    fn mark_failed(&self, op: &'static str, err: &CacheError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_tier_error("distributed", err.kind());
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                op,
                error = %err,
                "distributed tier unreachable, entering degraded mode (memory tier only)"
            );
            metrics::set_degraded(true);
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!("distributed tier reachable again, leaving degraded mode");
            metrics::set_degraded(false);
        }
    }
}

/// Start the background health check.
///
/// While healthy the store is probed every `interval`. While degraded, probes
/// back off exponentially from `interval` up to `max_backoff`; the first
/// successful probe clears degraded mode and resets the backoff. The task never
/// touches foreground calls and stops when `cancel` fires.
pub fn spawn_health_check(
    tier: Arc<DistributedTier>,
    interval: Duration,
    max_backoff: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let max_backoff = max_backoff.max(interval);
    tokio::spawn(async move {
        let mut backoff = interval;

        loop {
            let delay = if tier.is_degraded() { backoff } else { interval };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let was_degraded = tier.is_degraded();
            if tier.probe().await {
                backoff = interval;
            } else if was_degraded {
                backoff = (backoff * 2).min(max_backoff);
                tracing::debug!(
                    backoff_ms = backoff.as_millis() as u64,
                    "distributed tier still unreachable"
                );
            }
        }

        tracing::debug!("distributed tier health check stopped");
    })
}
