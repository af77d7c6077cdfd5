//! TTL policy per content class and the cache key space.
//!
//! ## Key Format
//!
//! `{contentType}:{scope}:{language}`, e.g. `scenario:123:en`.
//!
//! Language is part of the key so that two translations of the same content
//! never overwrite each other, and invalidating one language leaves the others
//! untouched. All languages of one item share the prefix `{contentType}:{scope}:`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TtlConfig;

/// Volatility class of a cache key, used to pick its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    /// Taxonomy, competency and code tables. Changes with deployments.
    StaticReference,
    /// Scenario/program catalogs and other listings.
    Catalog,
    /// Per-user or frequently mutated records.
    UserData,
}

impl ContentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::StaticReference => "static_reference",
            ContentClass::Catalog => "catalog",
            ContentClass::UserData => "user_data",
        }
    }
}

impl fmt::Display for ContentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caching rules for one content class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassPolicy {
    /// Time an entry is served as fresh
    pub ttl: Duration,
    /// Extra time an expired memory entry may be served while it is refreshed
    pub stale_grace: Duration,
    /// When false, reads go straight to the loader and nothing is stored
    pub cacheable: bool,
}

impl ClassPolicy {
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_grace: Duration::ZERO,
            cacheable: true,
        }
    }

    pub const fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    pub const fn uncached() -> Self {
        Self {
            ttl: Duration::ZERO,
            stale_grace: Duration::ZERO,
            cacheable: false,
        }
    }
}

/// TTL policy for all content classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    static_reference: ClassPolicy,
    catalog: ClassPolicy,
    user_data: ClassPolicy,
}

impl TtlPolicy {
    pub fn from_config(cfg: &TtlConfig) -> Self {
        let user_data = if cfg.user_data_cacheable {
            ClassPolicy::new(Duration::from_secs(cfg.user_data_secs))
                .with_stale_grace(Duration::from_secs(cfg.user_data_grace_secs))
        } else {
            ClassPolicy::uncached()
        };

        Self {
            static_reference: ClassPolicy::new(Duration::from_secs(cfg.static_reference_secs))
                .with_stale_grace(Duration::from_secs(cfg.static_reference_grace_secs)),
            catalog: ClassPolicy::new(Duration::from_secs(cfg.catalog_secs))
                .with_stale_grace(Duration::from_secs(cfg.catalog_grace_secs)),
            user_data,
        }
    }

    /// Replace the rules for one class.
    pub fn with_class(mut self, class: ContentClass, policy: ClassPolicy) -> Self {
        match class {
            ContentClass::StaticReference => self.static_reference = policy,
            ContentClass::Catalog => self.catalog = policy,
            ContentClass::UserData => self.user_data = policy,
        }
        self
    }

    #[inline]
    pub fn for_class(&self, class: ContentClass) -> ClassPolicy {
        match class {
            ContentClass::StaticReference => self.static_reference,
            ContentClass::Catalog => self.catalog,
            ContentClass::UserData => self.user_data,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&TtlConfig::default())
    }
}

/// Composite cache key: `{contentType}:{scope}:{language}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(content_type: &str, scope: &str, language: &str) -> Self {
        Self(format!("{content_type}:{scope}:{language}"))
    }

    /// Prefix matching every language variant of one item.
    pub fn item_prefix(content_type: &str, scope: &str) -> String {
        format!("{content_type}:{scope}:")
    }

    /// Prefix matching every key of one content type.
    pub fn type_prefix(content_type: &str) -> String {
        format!("{content_type}:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Language segment (everything after the last `:`).
    pub fn language(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}
