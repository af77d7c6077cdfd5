//! Error types for the content cache.
//!
//! Only [`CacheError::OriginUnavailable`] ever reaches a caller of
//! [`ContentCache::get`](crate::ContentCache::get). Every other variant is
//! produced inside the tiers, logged, counted, and absorbed.

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur inside the cache layers.
///
/// The type is `Clone` so that a single loader failure can be handed to every
/// caller waiting on the same in-flight load.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Distributed tier connection, pool or timeout failure
    #[error("distributed tier unavailable: {0}")]
    TierUnavailable(String),

    /// Stored value could not be decoded into the requested type
    #[error("corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// The loader failed (or was cancelled) while fetching from origin
    #[error("origin unavailable for {key}: {message}")]
    OriginUnavailable { key: String, message: String },

    /// Memory tier was cleared but the distributed delete did not go through
    #[error("invalidation of {target} only partially applied: {reason}")]
    InvalidationPartialFailure { target: String, reason: String },

    /// Value could not be encoded for the distributed tier
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Build an origin failure from whatever the loader returned.
    pub fn origin(key: &str, err: impl Into<anyhow::Error>) -> Self {
        let err: anyhow::Error = err.into();
        CacheError::OriginUnavailable {
            key: key.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn cancelled(key: &str) -> Self {
        CacheError::OriginUnavailable {
            key: key.to_string(),
            message: "loader cancelled".to_string(),
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::TierUnavailable(_) => "tier_unavailable",
            CacheError::CorruptEntry { .. } => "corrupt_entry",
            CacheError::OriginUnavailable { .. } => "origin_unavailable",
            CacheError::InvalidationPartialFailure { .. } => "invalidation_partial_failure",
            CacheError::Serialization(_) => "serialization",
            CacheError::Config(_) => "config",
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, CacheError::OriginUnavailable { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::TierUnavailable(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        CacheError::TierUnavailable(format!("failed to get Redis connection: {e}"))
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_keeps_error_chain() {
        let err = anyhow::anyhow!("connection refused").context("query scenario 42");
        let e = CacheError::origin("scenario:42:en", err);

        assert!(e.is_origin());
        assert_eq!(e.kind(), "origin_unavailable");
        let text = e.to_string();
        assert!(text.contains("scenario:42:en"));
        assert!(text.contains("query scenario 42"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_cancelled_is_origin_failure() {
        let e = CacheError::cancelled("ksa:en");
        assert!(e.is_origin());
        assert!(e.to_string().contains("loader cancelled"));
    }

    #[test]
    fn test_tier_errors_are_not_origin() {
        assert!(!CacheError::TierUnavailable("timeout".into()).is_origin());
        assert!(
            !CacheError::CorruptEntry {
                key: "k".into(),
                reason: "bad".into()
            }
            .is_origin()
        );
    }
}
