//! Tracing setup for the cache binary and for services embedding the cache.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::{LogFormat, LoggingConfig};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_config(&LoggingConfig::default());
}

/// Install the global subscriber. `RUST_LOG` wins over `cfg.level` when set.
/// Calling this twice is harmless; the second subscriber is ignored.
pub fn init_tracing_with_config(cfg: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&cfg.level));

    let (filter_layer, handle) = reload::Layer::new(filter);
    let _ = FILTER_HANDLE.set(handle);

    let registry = tracing_subscriber::registry().with(filter_layer);
    let _ = match cfg.format {
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(false)).try_init(),
        LogFormat::Full => registry.with(fmt::layer()).try_init(),
    };
}

/// Swap the active level filter, e.g. after a config reload.
pub fn apply_logging_level(level: &str) {
    let Some(handle) = FILTER_HANDLE.get() else {
        tracing::debug!(level, "tracing not initialized, ignoring level change");
        return;
    };
    if let Err(e) = handle.modify(|f| *f = EnvFilter::new(level)) {
        tracing::warn!(error = %e, level, "failed to apply logging level");
    }
}
