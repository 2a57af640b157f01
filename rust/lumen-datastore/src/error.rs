//! Recoverable errors.
//!
//! Capacity and invariant violations inside the store are fatal and panic;
//! only configuration problems are reported as values.

use thiserror::Error;

/// Errors raised while loading or validating an [`ArrayStoreConfig`](crate::ArrayStoreConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse array store config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("max_clusters must be > 0")]
    ZeroMaxClusters,
    #[error("alloc_grow_factor must be finite and >= 0, got {0}")]
    InvalidGrowFactor(f64),
    #[error("{types} buffer types need more buffers than the {limit} the handle encoding allows")]
    TooManyTypes { types: usize, limit: usize },
}
