//! Stampede guard: coalesces concurrent misses for the same key into one load.
//!
//! ## How It Works
//!
//! 1. The first caller for a key registers an in-flight entry holding a
//!    [`Shared`] future and spawns the load on the runtime.
//! 2. Later callers for the same key clone the shared future and await it.
//! 3. When the load finishes (success, failure, panic or abort) the in-flight
//!    entry is removed, so the next miss starts a fresh load instead of
//!    replaying a stale failure.
//!
//! ```text
//! caller 1 ──┐
//! caller 2 ──┼──▶ in-flight["scenario:7:en"] ──▶ one loader call ──▶ all callers
//! caller N ──┘
//! ```
//!
//! The load runs in its own task, so it completes even if the caller that
//! started it is dropped. If the task dies without producing a result every
//! waiter receives `OriginUnavailable("loader cancelled")`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use super::memory::Payload;
use crate::error::CacheError;
use crate::metrics;

/// Outcome of one load, shared by every waiter.
pub type LoadResult = Result<Payload, CacheError>;

/// Future handed to every caller of one in-flight load.
pub type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Whether the caller started the load or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

struct InFlight {
    id: u64,
    load: SharedLoad,
}

/// Single-flight registry keyed by cache key.
///
/// Sized by the number of distinct keys currently loading, not by request volume.
pub struct StampedeGuard {
    in_flight: DashMap<String, InFlight>,
    next_id: AtomicU64,
    coalesced: AtomicU64,
    tasks: TaskTracker,
}

impl StampedeGuard {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(1),
            coalesced: AtomicU64::new(0),
            tasks: TaskTracker::new(),
        }
    }

    /// Join the in-flight load for `key`, or start one with `start`.
    ///
    /// `start` is only invoked by the leader. Its future runs on a spawned
    /// task and the returned [`SharedLoad`] resolves to its result.
    pub fn join_or_start<F>(self: &Arc<Self>, key: &str, start: F) -> (SharedLoad, FlightRole)
    where
        F: FnOnce() -> BoxFuture<'static, LoadResult>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel::<LoadResult>();

        let load = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                metrics::record_coalesced();
                tracing::debug!(key = %key, "joining in-flight load");
                return (existing.get().load.clone(), FlightRole::Follower);
            }
            Entry::Vacant(slot) => {
                let owned_key = key.to_string();
                let load = async move {
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(CacheError::cancelled(&owned_key)),
                    }
                }
                .boxed()
                .shared();
                slot.insert(InFlight {
                    id,
                    load: load.clone(),
                });
                load
            }
        };

        // spawned after the map entry is released
        let work = start();
        let flight = FlightGuard {
            guard: Arc::clone(self),
            key: key.to_string(),
            id,
        };
        self.tasks.spawn(async move {
            let _flight = flight;
            let result = work.await;
            let _ = tx.send(result);
        });

        (load, FlightRole::Leader)
    }

    /// Forget the in-flight load for `key` so the next miss starts a new one.
    ///
    /// Callers already waiting on the detached load still get its result.
    pub fn detach(&self, key: &str) -> bool {
        self.in_flight.remove(key).is_some()
    }

    /// Detach every in-flight load whose key starts with `prefix`.
    pub fn detach_prefix(&self, prefix: &str) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|k, _| !k.starts_with(prefix));
        before.saturating_sub(self.in_flight.len())
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of keys currently loading.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Callers that joined an existing load instead of starting one.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Wait for every spawned load to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn finish(&self, key: &str, id: u64) {
        self.in_flight.remove_if(key, |_, flight| flight.id == id);
    }
}

impl Default for StampedeGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry when the load task ends, including on panic.
struct FlightGuard {
    guard: Arc<StampedeGuard>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.finish(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_load(
        calls: Arc<AtomicUsize>,
        value: u32,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, LoadResult> {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(Arc::new(value) as Payload)
            }
            .boxed()
        }
    }

    fn unwrap_u32(result: LoadResult) -> u32 {
        *result.unwrap().downcast_ref::<u32>().unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let guard = Arc::new(StampedeGuard::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut loads = Vec::new();
        let mut leaders = 0;
        for _ in 0..16 {
            let (load, role) = guard.join_or_start(
                "catalog:all:en",
                counting_load(calls.clone(), 7, Duration::from_millis(50)),
            );
            if role == FlightRole::Leader {
                leaders += 1;
            }
            loads.push(load);
        }

        for load in loads {
            assert_eq!(unwrap_u32(load.await), 7);
        }
        assert_eq!(leaders, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.coalesced(), 15);
    }

    #[tokio::test]
    async fn test_entry_removed_after_completion() {
        let guard = Arc::new(StampedeGuard::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let (load, _) = guard.join_or_start("k", counting_load(calls.clone(), 1, Duration::ZERO));
        assert_eq!(unwrap_u32(load.await), 1);
        guard.shutdown().await;

        assert!(!guard.is_in_flight("k"));
        assert_eq!(guard.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_all_waiters_and_is_not_sticky() {
        let guard = Arc::new(StampedeGuard::new());

        let failing = || {
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<Payload, _>(CacheError::origin("k", anyhow::anyhow!("db down")))
            }
            .boxed()
        };
        let (first, _) = guard.join_or_start("k", failing);
        let (second, role) = guard.join_or_start("k", failing);
        assert_eq!(role, FlightRole::Follower);

        assert!(first.await.unwrap_err().is_origin());
        assert!(second.await.unwrap_err().is_origin());

        // the failed load is gone; the next caller retries
        tokio::time::sleep(Duration::from_millis(10)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let (retry, role) = guard.join_or_start("k", counting_load(calls.clone(), 2, Duration::ZERO));
        assert_eq!(role, FlightRole::Leader);
        assert_eq!(unwrap_u32(retry.await), 2);
    }

    #[tokio::test]
    async fn test_panicking_loader_reports_cancellation() {
        let guard = Arc::new(StampedeGuard::new());
        let (load, _) = guard.join_or_start("k", || {
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let value: Option<u32> = None;
                Ok(Arc::new(value.expect("loader exploded")) as Payload)
            }
            .boxed()
        });

        let err = load.await.unwrap_err();
        assert!(err.to_string().contains("loader cancelled"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!guard.is_in_flight("k"));
    }

    #[tokio::test]
    async fn test_detach_starts_new_flight() {
        let guard = Arc::new(StampedeGuard::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let (old, _) = guard.join_or_start(
            "scenario:1:en",
            counting_load(calls.clone(), 1, Duration::from_millis(50)),
        );
        assert!(guard.detach("scenario:1:en"));

        let (new, role) = guard.join_or_start(
            "scenario:1:en",
            counting_load(calls.clone(), 2, Duration::ZERO),
        );
        assert_eq!(role, FlightRole::Leader);
        assert_eq!(unwrap_u32(new.await), 2);
        assert_eq!(unwrap_u32(old.await), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_detach_prefix() {
        let guard = Arc::new(StampedeGuard::new());
        let calls = Arc::new(AtomicUsize::new(0));
        for key in ["scenario:1:en", "scenario:1:zh", "scenario:2:en"] {
            let _ = guard.join_or_start(key, counting_load(calls.clone(), 0, Duration::from_millis(50)));
        }

        assert_eq!(guard.detach_prefix("scenario:1:"), 2);
        assert!(guard.is_in_flight("scenario:2:en"));
        guard.shutdown().await;
    }
}
