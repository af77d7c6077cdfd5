//! Memory tier: bounded, strict-LRU, per-process cache.
//!
//! Values are stored as `Arc<dyn Any + Send + Sync>`, so a hit costs one
//! reference-count increment and no deserialization. The owner downcasts to
//! the type it asked for.
//!
//! Each entry carries its own expiry plus an optional stale window. A lookup
//! inside the stale window returns [`MemoryLookup::Stale`]; past it the entry
//! is dropped and the lookup is a miss.
//!
//! Every delete bumps a generation counter and records what it removed, under
//! the same lock. Writers that started before a delete use
//! [`MemoryTier::put_if_generation`] so they cannot resurrect a value that was
//! invalidated while they were loading it. Only deletes that cover the
//! writer's own key block it.

use std::any::Any;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Type-erased cached value.
pub type Payload = Arc<dyn Any + Send + Sync>;

struct MemoryEntry {
    value: Payload,
    expires_at: Instant,
    stale_until: Instant,
}

impl MemoryEntry {
    fn new(value: Payload, ttl: Duration, stale_grace: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now + ttl;
        Self {
            value,
            expires_at,
            stale_until: expires_at + stale_grace,
        }
    }
}

/// Result of a memory tier lookup.
pub enum MemoryLookup {
    Fresh(Payload),
    /// Past its TTL but inside the stale-while-revalidate window
    Stale(Payload),
    Miss,
}

impl MemoryLookup {
    pub fn is_miss(&self) -> bool {
        matches!(self, MemoryLookup::Miss)
    }
}

/// Deletes remembered for racing writers. Older ones are forgotten and
/// writers that started before them are refused.
const DELETE_LOG_CAPACITY: usize = 1024;

enum Deleted {
    Key(String),
    Prefix(String),
    All,
}

impl Deleted {
    fn covers(&self, key: &str) -> bool {
        match self {
            Deleted::Key(k) => k == key,
            Deleted::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Deleted::All => true,
        }
    }
}

struct LruState {
    entries: LruCache<String, MemoryEntry>,
    generation: u64,
    deletes: VecDeque<(u64, Deleted)>,
    /// Highest generation dropped from `deletes`
    forgotten: u64,
}

impl LruState {
    fn record_delete(&mut self, deleted: Deleted) {
        self.generation += 1;
        self.deletes.push_back((self.generation, deleted));
        if self.deletes.len() > DELETE_LOG_CAPACITY {
            if let Some((generation, _)) = self.deletes.pop_front() {
                self.forgotten = generation;
            }
        }
    }

    fn deleted_since(&self, key: &str, generation: u64) -> bool {
        if self.forgotten > generation {
            return true;
        }
        self.deletes
            .iter()
            .rev()
            .take_while(|(g, _)| *g > generation)
            .any(|(_, deleted)| deleted.covers(key))
    }
}

/// Bounded LRU memory tier.
///
/// A single mutex guards the LRU list; every operation under it is O(1)
/// except prefix deletion and expiry sweeps.
pub struct MemoryTier {
    state: Mutex<LruState>,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl MemoryTier {
    /// Create a memory tier holding at most `max_items` entries (minimum 1).
    pub fn new(max_items: usize) -> Self {
        let capacity = NonZeroUsize::new(max_items).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(LruState {
                entries: LruCache::new(capacity),
                generation: 0,
                deletes: VecDeque::new(),
                forgotten: 0,
            }),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a key, marking it most-recently-used on a hit.
    pub fn get(&self, key: &str) -> MemoryLookup {
        let now = Instant::now();
        let mut state = self.state.lock();

        let lookup = match state.entries.get(key) {
            None => return MemoryLookup::Miss,
            Some(entry) if now < entry.expires_at => MemoryLookup::Fresh(Arc::clone(&entry.value)),
            Some(entry) if now < entry.stale_until => MemoryLookup::Stale(Arc::clone(&entry.value)),
            Some(_) => MemoryLookup::Miss,
        };

        if lookup.is_miss() {
            state.entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        lookup
    }

    /// Insert or overwrite an entry.
    ///
    /// When the tier is full the least-recently-used entry is evicted before
    /// the new one is stored, so the bound is never exceeded.
    pub fn put(&self, key: &str, value: Payload, ttl: Duration, stale_grace: Duration) {
        let mut state = self.state.lock();
        self.insert_locked(&mut state, key, value, ttl, stale_grace);
    }

    /// Insert only if `key` was not deleted since `generation` was read.
    ///
    /// Returns `false` when the write was dropped.
    pub fn put_if_generation(
        &self,
        key: &str,
        value: Payload,
        ttl: Duration,
        stale_grace: Duration,
        generation: u64,
    ) -> bool {
        let mut state = self.state.lock();
        if state.deleted_since(key, generation) {
            return false;
        }
        self.insert_locked(&mut state, key, value, ttl, stale_grace);
        true
    }

    fn insert_locked(
        &self,
        state: &mut LruState,
        key: &str,
        value: Payload,
        ttl: Duration,
        stale_grace: Duration,
    ) {
        let entry = MemoryEntry::new(value, ttl, stale_grace);
        if let Some((evicted, _)) = state.entries.push(key.to_string(), entry) {
            // push hands back the old value on overwrite; only a different key is an eviction
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %evicted, "evicted least-recently-used entry");
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.record_delete(Deleted::Key(key.to_string()));
        state.entries.pop(key).is_some()
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        state.record_delete(Deleted::Prefix(prefix.to_string()));
        let matching: Vec<String> = state
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matching {
            state.entries.pop(key);
        }
        matching.len()
    }

    /// Drop entries that are past their stale window.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.stale_until <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.entries.pop(key);
        }
        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.record_delete(Deleted::All);
        state.entries.clear();
    }

    /// Current delete generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Whether a delete covering `key` happened since `generation` was read.
    pub fn deleted_since(&self, key: &str, generation: u64) -> bool {
        self.state.lock().deleted_since(key, generation)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().entries.cap().get()
    }

    /// Entries evicted to respect the size bound.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries dropped because they outlived their stale window.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn payload(v: u32) -> Payload {
        Arc::new(v)
    }

    fn value_of(lookup: MemoryLookup) -> Option<u32> {
        match lookup {
            MemoryLookup::Fresh(p) => p.downcast_ref::<u32>().copied(),
            _ => None,
        }
    }

    #[test]
    fn test_put_and_get() {
        let tier = MemoryTier::new(4);
        tier.put("a", payload(1), HOUR, Duration::ZERO);

        assert_eq!(value_of(tier.get("a")), Some(1));
        assert!(tier.get("b").is_miss());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let tier = MemoryTier::new(3);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            tier.put(key, payload(i as u32), HOUR, Duration::ZERO);
        }

        tier.put("d", payload(3), HOUR, Duration::ZERO);

        assert_eq!(tier.len(), 3);
        assert!(!tier.contains("a"));
        assert!(tier.contains("b") && tier.contains("c") && tier.contains("d"));
        assert_eq!(tier.evictions(), 1);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let tier = MemoryTier::new(3);
        tier.put("a", payload(1), HOUR, Duration::ZERO);
        tier.put("b", payload(2), HOUR, Duration::ZERO);
        tier.put("c", payload(3), HOUR, Duration::ZERO);

        // touching "a" makes "b" the eviction candidate
        assert_eq!(value_of(tier.get("a")), Some(1));
        tier.put("d", payload(4), HOUR, Duration::ZERO);

        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
    }

    #[test]
    fn test_overwrite_is_not_an_eviction() {
        let tier = MemoryTier::new(2);
        tier.put("a", payload(1), HOUR, Duration::ZERO);
        tier.put("a", payload(2), HOUR, Duration::ZERO);

        assert_eq!(value_of(tier.get("a")), Some(2));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.evictions(), 0);
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_removed() {
        let tier = MemoryTier::new(4);
        tier.put("a", payload(1), Duration::from_millis(10), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(20));

        assert!(tier.get("a").is_miss());
        assert!(!tier.contains("a"));
        assert_eq!(tier.expirations(), 1);
    }

    #[test]
    fn test_stale_window() {
        let tier = MemoryTier::new(4);
        tier.put(
            "a",
            payload(1),
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        std::thread::sleep(Duration::from_millis(20));

        match tier.get("a") {
            MemoryLookup::Stale(p) => assert_eq!(p.downcast_ref::<u32>(), Some(&1)),
            _ => panic!("expected stale hit"),
        }
        assert!(tier.contains("a"));
    }

    #[test]
    fn test_delete_prefix_only_touches_matching_keys() {
        let tier = MemoryTier::new(8);
        tier.put("scenario:1:en", payload(1), HOUR, Duration::ZERO);
        tier.put("scenario:1:zh", payload(2), HOUR, Duration::ZERO);
        tier.put("scenario:12:en", payload(3), HOUR, Duration::ZERO);
        tier.put("program:1:en", payload(4), HOUR, Duration::ZERO);

        assert_eq!(tier.delete_prefix("scenario:1:"), 2);
        assert!(tier.contains("scenario:12:en"));
        assert!(tier.contains("program:1:en"));
    }

    #[test]
    fn test_generation_blocks_late_writes() {
        let tier = MemoryTier::new(4);
        let generation = tier.generation();

        tier.delete("a");

        assert!(!tier.put_if_generation("a", payload(1), HOUR, Duration::ZERO, generation));
        assert!(!tier.contains("a"));

        let generation = tier.generation();
        assert!(tier.put_if_generation("a", payload(2), HOUR, Duration::ZERO, generation));
        assert_eq!(value_of(tier.get("a")), Some(2));
    }

    #[test]
    fn test_unrelated_delete_does_not_block_writes() {
        let tier = MemoryTier::new(4);
        let generation = tier.generation();

        tier.delete("scenario:99:zh");
        tier.delete_prefix("program:");

        assert!(!tier.deleted_since("ksa:all:en", generation));
        assert!(tier.put_if_generation("ksa:all:en", payload(1), HOUR, Duration::ZERO, generation));
        assert!(tier.deleted_since("program:3:en", generation));
        assert!(!tier.put_if_generation("program:3:en", payload(2), HOUR, Duration::ZERO, generation));
    }

    #[test]
    fn test_clear_blocks_every_earlier_writer() {
        let tier = MemoryTier::new(4);
        let generation = tier.generation();
        tier.clear();
        assert!(!tier.put_if_generation("a", payload(1), HOUR, Duration::ZERO, generation));
    }

    #[test]
    fn test_forgotten_deletes_refuse_old_writers() {
        let tier = MemoryTier::new(4);
        let generation = tier.generation();
        for i in 0..=DELETE_LOG_CAPACITY {
            tier.delete(&format!("other:{i}:en"));
        }

        // the log no longer reaches back to `generation`
        assert!(tier.deleted_since("a", generation));
        let recent = tier.generation();
        assert!(tier.put_if_generation("a", payload(1), HOUR, Duration::ZERO, recent));
    }

    #[test]
    fn test_purge_expired() {
        let tier = MemoryTier::new(4);
        tier.put("short", payload(1), Duration::from_millis(5), Duration::ZERO);
        tier.put("long", payload(2), HOUR, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(tier.purge_expired(), 1);
        assert!(tier.contains("long"));
        assert!(!tier.contains("short"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let tier = MemoryTier::new(0);
        assert_eq!(tier.capacity(), 1);
    }
}
