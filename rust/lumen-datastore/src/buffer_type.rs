//! Per-type buffer sizing.
//!
//! Every buffer type stores fixed-size clusters: `array_size` elements for a
//! small-array class, or one heap-backed cell for the large-array type.
//! Capacity is always allocated in whole clusters.

/// What a buffer type stores in its slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Densely packed arrays of exactly `array_size` elements.
    SmallArray { array_size: u32 },
    /// One heap-backed, variable-length cell per slot.
    LargeArray,
}

/// Sizing policy for one buffer type.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferTypeConfig {
    kind: BufferKind,
    min_clusters: usize,
    max_clusters: usize,
    alloc_grow_factor: f64,
}

impl BufferTypeConfig {
    /// # Panics
    /// Panics if `max_clusters` is 0, `min_clusters > max_clusters`, the grow
    /// factor is negative or not finite, or a small-array class has size 0.
    pub fn new(
        kind: BufferKind,
        min_clusters: usize,
        max_clusters: usize,
        alloc_grow_factor: f64,
    ) -> Self {
        assert!(max_clusters > 0, "max_clusters must be > 0");
        assert!(
            min_clusters <= max_clusters,
            "min_clusters ({min_clusters}) exceeds max_clusters ({max_clusters})"
        );
        assert!(
            alloc_grow_factor.is_finite() && alloc_grow_factor >= 0.0,
            "alloc_grow_factor must be finite and >= 0"
        );
        if let BufferKind::SmallArray { array_size } = kind {
            assert!(array_size > 0, "small array class must have size > 0");
        }
        Self {
            kind,
            min_clusters,
            max_clusters,
            alloc_grow_factor,
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Elements per cluster: the array length for small arrays, 1 cell for
    /// large arrays.
    pub fn cluster_size(&self) -> usize {
        match self.kind {
            BufferKind::SmallArray { array_size } => array_size as usize,
            BufferKind::LargeArray => 1,
        }
    }

    pub fn min_clusters(&self) -> usize {
        self.min_clusters
    }

    pub fn max_clusters(&self) -> usize {
        self.max_clusters
    }

    /// Number of clusters to allocate for a new buffer.
    ///
    /// `used_clusters` counts live clusters already held by this type and
    /// drives growth; `needed_clusters` is what the pending append requires.
    ///
    /// # Panics
    /// Panics if `needed_clusters` exceeds `max_clusters`.
    pub fn clusters_to_alloc(&self, used_clusters: usize, needed_clusters: usize) -> usize {
        assert!(
            needed_clusters <= self.max_clusters,
            "request for {needed_clusters} clusters exceeds max_clusters {}",
            self.max_clusters
        );
        let grow = (used_clusters as f64 * self.alloc_grow_factor) as usize;
        let wanted = needed_clusters
            .saturating_add(grow)
            .max(self.min_clusters)
            .max(needed_clusters);
        wanted.min(self.max_clusters)
    }
}
