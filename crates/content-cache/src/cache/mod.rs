//! Multi-tier read cache for content records.
//!
//! ## Architecture
//!
//! - **Memory tier (LRU)**: in-process, bounded by item count, per-instance
//! - **Distributed tier (Redis)**: shared across instances, native TTL
//! - **Stampede guard**: one origin load per key, however many callers miss
//! - **Pub/Sub**: cross-instance memory tier invalidation
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get(key) → Memory (LRU) → Distributed (Redis) → Stampede guard → Loader
//!                ↓                  ↓                                  ↓
//!           <1µs latency      ~1ms latency               origin latency, once per key
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is unreachable or disabled the cache runs memory-tier only and
//! [`ContentCache::is_degraded`] reports `true`. A background health check
//! clears degraded mode once Redis answers again. Callers only notice
//! slower responses, never errors.

pub mod distributed;
pub mod facade;
pub mod inprocess;
pub mod memory;
pub mod policy;
pub mod pubsub;
pub mod stampede;

pub use distributed::{DistributedStore, DistributedTier, RedisStore};
pub use facade::{CacheLookup, CacheSource, CacheStats, ContentCache, ContentCacheBuilder};
pub use inprocess::InProcessStore;
pub use memory::{MemoryLookup, MemoryTier};
pub use policy::{CacheKey, ClassPolicy, ContentClass, TtlPolicy};
pub use pubsub::{INVALIDATION_CHANNEL, Invalidation, PubSubSettings};
pub use stampede::{FlightRole, StampedeGuard};
