//! Prometheus metrics for the content cache.
//!
//! Recording is always safe: without an installed recorder the `metrics`
//! macros are no-ops, so library users that don't call [`init_metrics`] pay
//! nothing.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "content_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "content_cache_misses_total";
    pub const CACHE_LOADS_TOTAL: &str = "content_cache_loads_total";
    pub const CACHE_COALESCED_TOTAL: &str = "content_cache_coalesced_total";
    pub const CACHE_TIER_ERRORS_TOTAL: &str = "content_cache_tier_errors_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "content_cache_invalidations_total";
    pub const CACHE_DEGRADED: &str = "content_cache_degraded";
    pub const CACHE_MEMORY_ENTRIES: &str = "content_cache_memory_entries";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit served by `tier` ("memory", "distributed", "stale").
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a miss in every tier.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record a loader invocation with its outcome ("ok", "error").
pub fn record_load(outcome: &'static str) {
    counter!(names::CACHE_LOADS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a caller that joined an in-flight load.
pub fn record_coalesced() {
    counter!(names::CACHE_COALESCED_TOTAL).increment(1);
}

/// Record an absorbed tier failure.
pub fn record_tier_error(tier: &'static str, kind: &'static str) {
    counter!(names::CACHE_TIER_ERRORS_TOTAL, "tier" => tier, "kind" => kind).increment(1);
}

/// Record an invalidation ("key" or "prefix").
pub fn record_invalidation(scope: &'static str) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL, "scope" => scope).increment(1);
}

pub fn set_degraded(degraded: bool) {
    gauge!(names::CACHE_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
}

pub fn set_memory_entries(count: usize) {
    gauge!(names::CACHE_MEMORY_ENTRIES).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_cache_hit("memory");
        record_cache_miss();
        record_load("ok");
        record_tier_error("distributed", "tier_unavailable");
        set_degraded(true);
        set_memory_entries(3);
    }

    #[test]
    fn test_render_after_init() {
        init_metrics();
        record_cache_hit("memory");
        let text = render_metrics().expect("metrics initialized");
        assert!(text.contains(names::CACHE_HITS_TOTAL));
    }
}
