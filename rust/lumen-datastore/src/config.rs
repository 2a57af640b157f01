//! Array store configuration.
//!
//! ```toml
//! max_small_array_size = 4
//! min_clusters = 256
//! max_clusters = 65536
//! alloc_grow_factor = 0.2
//! ```
//!
//! Missing fields take their defaults. Cluster bounds are clamped to the
//! handle encoding when the store is built.

use crate::entry_ref::RefType;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Default lower bound on clusters per new buffer.
pub const DEFAULT_MIN_CLUSTERS: usize = 1024;

/// Default growth factor applied to a type's live clusters.
pub const DEFAULT_ALLOC_GROW_FACTOR: f64 = 0.2;

const DEFAULT_MAX_SMALL_ARRAY_SIZE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArrayStoreConfig {
    /// Arrays up to this length are packed into size-classed buffers.
    pub max_small_array_size: u32,
    /// Minimum clusters allocated for a new buffer.
    pub min_clusters: usize,
    /// Maximum clusters in one buffer. `None` means as many as the handle
    /// encoding can address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_clusters: Option<usize>,
    /// Extra clusters to allocate, as a fraction of the type's live clusters.
    pub alloc_grow_factor: f64,
}

impl Default for ArrayStoreConfig {
    fn default() -> Self {
        Self {
            max_small_array_size: DEFAULT_MAX_SMALL_ARRAY_SIZE,
            min_clusters: DEFAULT_MIN_CLUSTERS,
            max_clusters: None,
            alloc_grow_factor: DEFAULT_ALLOC_GROW_FACTOR,
        }
    }
}

impl ArrayStoreConfig {
    pub fn new(max_small_array_size: u32) -> Self {
        Self {
            max_small_array_size,
            ..Self::default()
        }
    }

    pub fn with_clusters(mut self, min_clusters: usize, max_clusters: usize) -> Self {
        self.min_clusters = min_clusters;
        self.max_clusters = Some(max_clusters);
        self
    }

    pub fn with_alloc_grow_factor(mut self, factor: f64) -> Self {
        self.alloc_grow_factor = factor;
        self
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that cannot be fixed by clamping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clusters == Some(0) {
            return Err(ConfigError::ZeroMaxClusters);
        }
        if !self.alloc_grow_factor.is_finite() || self.alloc_grow_factor < 0.0 {
            return Err(ConfigError::InvalidGrowFactor(self.alloc_grow_factor));
        }
        Ok(())
    }

    /// Validate against a handle encoding: every type needs one buffer.
    pub fn validate_for<R: RefType>(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let types = self.max_small_array_size as usize + 1;
        let limit = R::num_buffers() as usize;
        if types > limit {
            return Err(ConfigError::TooManyTypes { types, limit });
        }
        Ok(())
    }

    /// `(min_clusters, max_clusters)` clamped so that
    /// `max_clusters <= offset_size` and `min_clusters <= max_clusters`.
    pub fn clamped_clusters<R: RefType>(&self) -> (usize, usize) {
        let max = self
            .max_clusters
            .map_or(R::offset_size(), |max| max.min(R::offset_size()));
        let min = self.min_clusters.min(max);
        (min, max)
    }
}
