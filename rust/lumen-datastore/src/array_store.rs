//! Variable-length arrays packed into size-classed buffers.
//!
//! Arrays of length `1..=max_small_array_size` are stored back-to-back in a
//! buffer of type id equal to their length, with no per-array header; the
//! handle offset is the array index within the buffer. Longer arrays are
//! stored as one heap-backed cell each in buffers of type id 0. Empty arrays
//! are never stored and map to [`EntryRef::INVALID`].
//!
//! [`ArrayStore`] is the single writer. Any number of [`ArrayStoreReader`]s
//! may read concurrently without locking, each under a
//! [`GenerationGuard`].

use crate::buffer_state::BufferStats;
use crate::buffer_type::{BufferKind, BufferTypeConfig};
use crate::compaction::CompactionContext;
use crate::config::{ArrayStoreConfig, DEFAULT_MIN_CLUSTERS};
use crate::datastore::DataStore;
use crate::entry_ref::{DefaultRefType, EntryRef, RefType};
use crate::generation::{Generation, GenerationGuard, GenerationHandler};
use crate::memory_usage::{AddressSpace, MemoryUsage};
use crate::raw_buffer::SharedBuffers;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

/// Type id reserved for large arrays.
pub const LARGE_ARRAY_TYPE_ID: u32 = 0;

/// Writer side of an array store.
pub struct ArrayStore<T, R = DefaultRefType> {
    store: DataStore<T, R>,
    max_small_array_size: u32,
}

impl<T, R> ArrayStore<T, R>
where
    T: Copy + Send + Sync + 'static,
    R: RefType,
{
    /// Build a store with its own generation handler.
    ///
    /// # Panics
    /// Panics if the config is invalid for the handle encoding `R`.
    pub fn new(config: ArrayStoreConfig) -> Self {
        Self::with_generation_handler(config, Arc::new(GenerationHandler::new()))
    }

    /// Build a store that shares `generations` with other stores.
    ///
    /// # Panics
    /// Panics if the config is invalid for the handle encoding `R`.
    pub fn with_generation_handler(
        config: ArrayStoreConfig,
        generations: Arc<GenerationHandler>,
    ) -> Self {
        if let Err(err) = config.validate_for::<R>() {
            panic!("invalid array store config: {err}");
        }
        let (min_clusters, max_clusters) = config.clamped_clusters::<R>();
        let mut store = DataStore::new(generations);

        let large = BufferTypeConfig::new(
            BufferKind::LargeArray,
            DEFAULT_MIN_CLUSTERS.min(R::offset_size()),
            R::offset_size(),
            config.alloc_grow_factor,
        );
        let large_type_id = store.add_type(large);
        assert_eq!(large_type_id, LARGE_ARRAY_TYPE_ID);

        for array_size in 1..=config.max_small_array_size {
            let small = BufferTypeConfig::new(
                BufferKind::SmallArray { array_size },
                min_clusters,
                max_clusters,
                config.alloc_grow_factor,
            );
            let type_id = store.add_type(small);
            // Type ids and small array sizes map 1:1.
            assert_eq!(type_id, array_size, "type id does not match array size");
        }
        store.init_active_buffers();

        Self {
            store,
            max_small_array_size: config.max_small_array_size,
        }
    }

    pub fn max_small_array_size(&self) -> u32 {
        self.max_small_array_size
    }

    /// Type id used for arrays of length `len` (which must be > 0).
    pub fn type_id_for_len(&self, len: usize) -> u32 {
        assert!(len > 0, "empty arrays have no type");
        if len <= self.max_small_array_size as usize {
            len as u32
        } else {
            LARGE_ARRAY_TYPE_ID
        }
    }

    /// Store a copy of `array` and return its handle.
    ///
    /// Empty arrays are not stored and yield [`EntryRef::INVALID`].
    pub fn add(&mut self, array: &[T]) -> EntryRef {
        if array.is_empty() {
            return EntryRef::INVALID;
        }
        if array.len() <= self.max_small_array_size as usize {
            self.add_small_array(array)
        } else {
            self.add_large_array(array)
        }
    }

    /// The array behind `entry`. The invalid handle yields an empty slice.
    pub fn get(&self, entry: EntryRef) -> &[T] {
        if !entry.is_valid() {
            return &[];
        }
        let (buffer_id, offset) = R::decode(entry);
        let type_id = self.store.buffer_type_id(buffer_id);
        if type_id == LARGE_ARRAY_TYPE_ID {
            let cell = self.store.cell(buffer_id, offset);
            assert!(!cell.is_empty(), "large array {entry:?} is empty");
            cell
        } else {
            let array_size = type_id as usize;
            self.store.elements(buffer_id, offset * array_size, array_size)
        }
    }

    /// Put the array behind `entry` on hold. Its memory is reclaimed once no
    /// reader can observe it. No-op for the invalid handle.
    pub fn remove(&mut self, entry: EntryRef) {
        if !entry.is_valid() {
            return;
        }
        let type_id = self.store.buffer_type_id(R::buffer_id(entry));
        if type_id == LARGE_ARRAY_TYPE_ID {
            let extra_bytes = mem::size_of::<T>() * self.get(entry).len();
            self.store.hold_elem(entry, 1, extra_bytes);
        } else {
            self.store.hold_elem(entry, type_id as usize, 0);
        }
    }

    /// Start compacting the buffer with the most wasted space.
    ///
    /// Feed every live handle through the returned context; dropping it puts
    /// the drained buffer on hold.
    pub fn compact_worst(&mut self) -> CompactionContext<'_, T, R> {
        let buffer_id = self.store.start_compact_worst_buffer();
        CompactionContext::new(self, buffer_id)
    }

    /// Buffer ids in use versus the encoding's buffer count.
    pub fn address_space_usage(&self) -> AddressSpace {
        AddressSpace::new(self.store.num_active_buffers(), R::num_buffers() as usize)
    }

    /// Occupancy of the buffer owning `entry`.
    pub fn buffer_state(&self, entry: EntryRef) -> BufferStats {
        self.store.buffer_state(R::buffer_id(entry))
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.store.memory_usage()
    }

    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.store.transfer_hold_lists(generation);
    }

    pub fn trim_hold_lists(&mut self, used_generation: Generation) {
        self.store.trim_hold_lists(used_generation);
    }

    /// Reclaim everything on hold. Panics if readers hold guards.
    pub fn clear_hold_lists(&mut self) {
        self.store.clear_hold_lists();
    }

    /// End a batch of mutations: stamp pending holds with the current
    /// generation, advance it, and reclaim whatever readers have left behind.
    pub fn commit(&mut self) {
        let generations = Arc::clone(self.store.generation_handler());
        self.store.transfer_hold_lists(generations.current_generation());
        generations.inc_generation();
        self.store.trim_hold_lists(generations.oldest_used_generation());
    }

    pub fn generation_handler(&self) -> &Arc<GenerationHandler> {
        self.store.generation_handler()
    }

    /// A lock-free read handle that can be sent to other threads.
    pub fn reader(&self) -> ArrayStoreReader<T, R> {
        ArrayStoreReader {
            buffers: self.store.shared_buffers(),
            generations: Arc::clone(self.store.generation_handler()),
            _ref: PhantomData,
        }
    }

    pub fn data_store(&self) -> &DataStore<T, R> {
        &self.store
    }

    pub(crate) fn finish_compaction(&mut self, buffer_id: u32) {
        self.store.hold_buffer(buffer_id);
    }

    // --- internal helpers ---

    fn add_small_array(&mut self, array: &[T]) -> EntryRef {
        let type_id = array.len() as u32;
        self.store.ensure_buffer_capacity(type_id, array.len());
        let buffer_id = self.store.active_buffer_id(type_id);
        let at = self.store.append_elements(buffer_id, array);
        R::encode(buffer_id, at / array.len())
    }

    fn add_large_array(&mut self, array: &[T]) -> EntryRef {
        self.store.ensure_buffer_capacity(LARGE_ARRAY_TYPE_ID, 1);
        let buffer_id = self.store.active_buffer_id(LARGE_ARRAY_TYPE_ID);
        let at = self.store.append_cell(buffer_id, array.to_vec());
        R::encode(buffer_id, at)
    }
}

impl<T, R> fmt::Debug for ArrayStore<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayStore")
            .field("max_small_array_size", &self.max_small_array_size)
            .field("store", &self.store)
            .finish()
    }
}

/// Read-only view of an [`ArrayStore`] for concurrent readers.
pub struct ArrayStoreReader<T, R = DefaultRefType> {
    buffers: Arc<SharedBuffers<T>>,
    generations: Arc<GenerationHandler>,
    _ref: PhantomData<R>,
}

impl<T, R> ArrayStoreReader<T, R>
where
    T: Copy + Send + Sync + 'static,
    R: RefType,
{
    /// Pin the current generation before loading handles.
    pub fn take_guard(&self) -> GenerationGuard {
        self.generations.take_guard()
    }

    /// The array behind `entry`, valid for as long as `guard` is held.
    ///
    /// Handles must be loaded after the guard is taken, typically through
    /// [`AtomicEntryRef::load_acquire`](crate::AtomicEntryRef::load_acquire).
    ///
    /// # Safety
    /// `entry` must not have been removed, nor compacted away and its buffer
    /// put on hold, before `guard` was taken.
    ///
    /// # Panics
    /// Panics if `guard` comes from another generation handler or if
    /// `entry` points at data that has not been published.
    pub unsafe fn get<'a>(&'a self, guard: &'a GenerationGuard, entry: EntryRef) -> &'a [T] {
        assert!(
            guard.belongs_to(&self.generations),
            "generation guard belongs to a different store"
        );
        if !entry.is_valid() {
            return &[];
        }
        let (buffer_id, offset) = R::decode(entry);
        // SAFETY: the caller's guard predates any hold on this buffer, so it
        // cannot be released while the guard lives.
        let buffer = unsafe { self.buffers.get(buffer_id) }
            .unwrap_or_else(|| panic!("{entry:?} points at an unallocated buffer"));
        let type_id = buffer.type_id();
        if type_id == LARGE_ARRAY_TYPE_ID {
            // SAFETY: as above, the cell's hold cannot be trimmed yet.
            let cell = unsafe { buffer.cell(offset) };
            assert!(!cell.is_empty(), "large array {entry:?} is empty");
            cell
        } else {
            let array_size = type_id as usize;
            buffer.elements(offset * array_size, array_size)
        }
    }
}

impl<T, R> Clone for ArrayStoreReader<T, R> {
    fn clone(&self) -> Self {
        Self {
            buffers: Arc::clone(&self.buffers),
            generations: Arc::clone(&self.generations),
            _ref: PhantomData,
        }
    }
}

impl<T, R> fmt::Debug for ArrayStoreReader<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayStoreReader")
            .field("buffers", &self.buffers.len())
            .field("generations", &self.generations)
            .finish()
    }
}
