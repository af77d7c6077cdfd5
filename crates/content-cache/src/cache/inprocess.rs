//! In-process [`DistributedStore`] implementation.
//!
//! Useful for single-instance development and for exercising the facade
//! without a Redis server. It honors TTLs and glob patterns the same way Redis
//! does, and can simulate an outage (`set_failing`) or a slow network
//! (`set_latency`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use glob::Pattern;
use parking_lot::{Mutex, RwLock};

use super::distributed::DistributedStore;
use crate::error::{CacheError, CacheResult};

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InProcessStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    failing: AtomicBool,
    latency: RwLock<Option<Duration>>,
    calls: AtomicU64,
}

impl InProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `TierUnavailable` until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = Some(latency);
    }

    /// Total calls received, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Write raw bytes, bypassing the failure switch.
    pub fn insert_raw(&self, key: &str, data: Vec<u8>, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Whether a live (unexpired) entry exists, bypassing the failure switch.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|v| v.expires_at > now)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|v| v.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> CacheResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::TierUnavailable(
                "in-process store offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedStore for InProcessStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.enter().await?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(v) if v.expires_at > now => Ok(Some(v.data.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.enter().await?;
        self.insert_raw(key, value.to_vec(), ttl);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        self.enter().await?;
        let mut entries = self.entries.lock();
        let removed = keys.iter().filter(|k| entries.remove(*k).is_some()).count();
        Ok(removed as u64)
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.enter().await?;
        let pattern = redis_pattern(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(k, v)| v.expires_at > now && pattern.matches(k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> CacheResult<()> {
        self.enter().await
    }

    fn name(&self) -> &'static str {
        "in_process"
    }
}

/// Translate a Redis glob (`*`, `?`, backslash escapes) into a
/// [`glob::Pattern`]. Character classes are matched literally.
fn redis_pattern(pattern: &str) -> CacheResult<Pattern> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    let mut after_star = false;
    while let Some(c) = chars.next() {
        match c {
            // runs of `*` mean the same as one
            '*' if after_star => continue,
            '*' => translated.push('*'),
            '?' => translated.push('?'),
            '\\' => {
                let literal = chars.next().unwrap_or('\\');
                translated.push_str(&Pattern::escape(literal.encode_utf8(&mut [0; 4])));
            }
            other => translated.push_str(&Pattern::escape(other.encode_utf8(&mut [0; 4]))),
        }
        after_star = c == '*';
    }
    Pattern::new(&translated)
        .map_err(|e| CacheError::Config(format!("invalid key pattern {pattern:?}: {e}")))
}
