//! Redis Pub/Sub for cross-instance memory tier invalidation.
//!
//! Invalidations clear the local memory tier and the shared Redis tier, but the
//! memory tiers of other instances would keep serving the old value until
//! their TTL runs out. Publishing each invalidation lets every instance drop
//! its copy right away.
//!
//! ```text
//! Instance 1: cache.invalidate("scenario:7:en")
//!   ↓
//! PUBLISH content-cache:invalidate {"origin":"<id1>","invalidation":{"scope":"key","target":"scenario:7:en"}}
//!   ↓
//! Instance 2: listener → memory.delete("scenario:7:en")
//! Instance 1: listener → ignores its own message
//! ```
//!
//! Delivery is best effort. A missed message only widens staleness up to the
//! memory tier TTL.

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::memory::MemoryTier;
use super::stampede::StampedeGuard;
use crate::error::{CacheError, CacheResult};

/// Default pub/sub channel.
pub const INVALIDATION_CHANNEL: &str = "content-cache:invalidate";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What to drop from the memory tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "target", rename_all = "snake_case")]
pub enum Invalidation {
    Key(String),
    Prefix(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct InvalidationMessage {
    origin: Uuid,
    invalidation: Invalidation,
}

/// Pub/sub wiring shared by the publisher and the listener.
#[derive(Clone)]
pub struct PubSubSettings {
    pub pool: Pool,
    pub redis_url: String,
    pub channel: String,
}

impl PubSubSettings {
    pub fn new(pool: Pool, redis_url: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            channel: INVALIDATION_CHANNEL.to_string(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

/// Publishes invalidations to the other instances.
pub struct InvalidationPublisher {
    pool: Pool,
    channel: String,
    instance_id: Uuid,
}

impl InvalidationPublisher {
    pub fn new(settings: &PubSubSettings, instance_id: Uuid) -> Self {
        Self {
            pool: settings.pool.clone(),
            channel: settings.channel.clone(),
            instance_id,
        }
    }

    /// Fire-and-forget publish; failures are logged.
    pub fn publish(&self, invalidation: Invalidation) {
        let message = InvalidationMessage {
            origin: self.instance_id,
            invalidation,
        };
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode invalidation message");
                return;
            }
        };

        let pool = self.pool.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = publish_raw(&pool, &channel, &payload).await {
                tracing::warn!(error = %e, channel = %channel, "failed to publish invalidation");
            }
        });
    }
}

async fn publish_raw(pool: &Pool, channel: &str, payload: &str) -> CacheResult<()> {
    let mut conn = pool.get().await?;
    conn.publish::<_, _, ()>(channel, payload).await?;
    tracing::debug!(channel = %channel, "published cache invalidation");
    Ok(())
}

/// Subscribes to invalidations from other instances and applies them locally.
pub struct InvalidationListener {
    pub redis_url: String,
    pub channel: String,
    pub instance_id: Uuid,
    pub memory: Arc<MemoryTier>,
    pub guard: Arc<StampedeGuard>,
}

impl InvalidationListener {
    /// Spawn the listener. It reconnects with exponential backoff until `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);

            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.run() => result,
                };

                match result {
                    Ok(()) => {
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Cache invalidation listener error, reconnecting..."
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }

            tracing::debug!("cache invalidation listener stopped");
        })
    }

    async fn run(&self) -> CacheResult<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        tracing::info!(channel = %self.channel, "Subscribed to cache invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(payload) => self.handle(&payload),
                Err(e) => tracing::warn!(error = %e, "failed to read invalidation payload"),
            }
        }
        Err(CacheError::TierUnavailable(
            "pub/sub connection closed".to_string(),
        ))
    }

    fn handle(&self, payload: &str) {
        let message: InvalidationMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse invalidation message");
                return;
            }
        };
        if message.origin == self.instance_id {
            return;
        }
        apply_invalidation(&self.memory, &self.guard, &message.invalidation);
    }
}

/// Drop an invalidated key or prefix from the local memory tier.
pub(crate) fn apply_invalidation(
    memory: &MemoryTier,
    guard: &StampedeGuard,
    invalidation: &Invalidation,
) {
    match invalidation {
        Invalidation::Key(key) => {
            memory.delete(key);
            guard.detach(key);
            tracing::debug!(key = %key, "received cache invalidation");
        }
        Invalidation::Prefix(prefix) => {
            let removed = memory.delete_prefix(prefix);
            guard.detach_prefix(prefix);
            tracing::debug!(prefix = %prefix, removed, "received prefix invalidation");
        }
    }
}
