//! Buffer pool underlying the array store.
//!
//! A [`DataStore`] owns a bounded table of buffers. Each registered type has
//! exactly one active buffer that receives appends; when it runs out of room
//! the lowest free buffer id is activated for the type and the old buffer is
//! retired. Buffers never move or grow once allocated, so data written to
//! them stays put until it is reclaimed.
//!
//! Freed space is reclaimed in two steps. `hold_elem` and `hold_buffer`
//! queue work on pending lists; `transfer_hold_lists` stamps the pending
//! entries with a generation, and `trim_hold_lists` cleans every entry whose
//! generation no reader can still observe.

use crate::buffer_state::{BufferState, BufferStats, BufferStatus};
use crate::buffer_type::{BufferKind, BufferTypeConfig};
use crate::entry_ref::{DefaultRefType, EntryRef, RefType};
use crate::generation::{Generation, GenerationHandler};
use crate::memory_usage::MemoryUsage;
use crate::raw_buffer::{RawBuffer, SharedBuffers};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct ElemHold {
    entry: EntryRef,
    len: usize,
    extra_bytes: usize,
}

/// Pool of typed buffers addressed by handles of codec `R`.
pub struct DataStore<T, R = DefaultRefType> {
    shared: Arc<SharedBuffers<T>>,
    states: Vec<BufferState>,
    types: Vec<BufferTypeConfig>,
    /// Active buffer per type id; `None` until `init_active_buffers`.
    active: Vec<Option<u32>>,
    generations: Arc<GenerationHandler>,
    elem_hold_pending: Vec<ElemHold>,
    elem_hold_list: VecDeque<(Generation, ElemHold)>,
    buffer_hold_pending: Vec<u32>,
    buffer_hold_list: VecDeque<(Generation, u32)>,
    /// Highest stamp handed out; keeps both hold lists sorted.
    last_stamped: Generation,
    _ref: PhantomData<R>,
}

impl<T, R> DataStore<T, R>
where
    T: Copy + Send + Sync + 'static,
    R: RefType,
{
    pub fn new(generations: Arc<GenerationHandler>) -> Self {
        Self {
            shared: Arc::new(SharedBuffers::new(R::num_buffers() as usize)),
            states: Vec::new(),
            types: Vec::new(),
            active: Vec::new(),
            generations,
            elem_hold_pending: Vec::new(),
            elem_hold_list: VecDeque::new(),
            buffer_hold_pending: Vec::new(),
            buffer_hold_list: VecDeque::new(),
            last_stamped: 0,
            _ref: PhantomData,
        }
    }

    /// Register a buffer type and return its type id. Ids are handed out
    /// sequentially from 0.
    ///
    /// # Panics
    /// Panics if called after `init_active_buffers`, or if the type's
    /// `max_clusters` exceeds what the handle encoding can address.
    pub fn add_type(&mut self, config: BufferTypeConfig) -> u32 {
        assert!(
            self.active.iter().all(Option::is_none),
            "types must be added before buffers are activated"
        );
        assert!(
            config.max_clusters() <= R::offset_size(),
            "max_clusters {} exceeds offset space {}",
            config.max_clusters(),
            R::offset_size()
        );
        let type_id = self.types.len() as u32;
        self.types.push(config);
        self.active.push(None);
        type_id
    }

    /// Give every registered type an active buffer.
    pub fn init_active_buffers(&mut self) {
        for type_id in 0..self.types.len() as u32 {
            if self.active[type_id as usize].is_none() {
                self.activate_buffer(type_id, 0);
            }
        }
    }

    pub fn num_types(&self) -> usize {
        self.types.len()
    }

    pub fn type_config(&self, type_id: u32) -> &BufferTypeConfig {
        &self.types[type_id as usize]
    }

    /// Make sure the active buffer of `type_id` can take `elems_needed` more
    /// elements, switching to a new buffer if it cannot.
    pub fn ensure_buffer_capacity(&mut self, type_id: u32, elems_needed: usize) {
        let buffer_id = self.active_buffer_id(type_id);
        if self.state(buffer_id).remaining() < elems_needed {
            self.switch_active_buffer(type_id, elems_needed);
        }
    }

    /// The buffer currently receiving appends for `type_id`.
    ///
    /// # Panics
    /// Panics if the type has no active buffer.
    pub fn active_buffer_id(&self, type_id: u32) -> u32 {
        self.active[type_id as usize]
            .unwrap_or_else(|| panic!("type {type_id} has no active buffer"))
    }

    /// Type id of an allocated buffer.
    pub fn buffer_type_id(&self, buffer_id: u32) -> u32 {
        let state = self.state(buffer_id);
        assert_ne!(
            state.status(),
            BufferStatus::Free,
            "buffer {buffer_id} is not allocated"
        );
        state.type_id()
    }

    pub fn buffer_state(&self, buffer_id: u32) -> BufferStats {
        self.state(buffer_id).stats(buffer_id)
    }

    /// Number of buffer ids currently in use (not free).
    pub fn num_active_buffers(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.status() != BufferStatus::Free)
            .count()
    }

    pub fn generation_handler(&self) -> &Arc<GenerationHandler> {
        &self.generations
    }

    pub(crate) fn shared_buffers(&self) -> Arc<SharedBuffers<T>> {
        Arc::clone(&self.shared)
    }

    /// Append `values` to the active small-array buffer `buffer_id` and
    /// return the element offset they were written at.
    pub fn append_elements(&mut self, buffer_id: u32, values: &[T]) -> usize {
        let state = &mut self.states[buffer_id as usize];
        assert_eq!(state.status(), BufferStatus::Active, "append to inactive buffer");
        let at = state.size();
        state.pushed_back(values.len(), 0);
        let buffer = self.raw(buffer_id);
        // SAFETY: we are the writer and `at` is the published size.
        unsafe { buffer.append_elements(at, values) };
        at
    }

    /// Append one large-array cell to the active buffer `buffer_id`,
    /// accounting its heap bytes as extra memory. Returns the cell index.
    pub fn append_cell(&mut self, buffer_id: u32, cell: Vec<T>) -> usize {
        let extra_bytes = mem::size_of::<T>() * cell.len();
        let state = &mut self.states[buffer_id as usize];
        assert_eq!(state.status(), BufferStatus::Active, "append to inactive buffer");
        let at = state.size();
        state.pushed_back(1, extra_bytes);
        let buffer = self.raw(buffer_id);
        // SAFETY: we are the writer and `at` is the published size.
        unsafe { buffer.append_cell(at, cell) };
        at
    }

    /// Read `len` elements at element `offset` of `buffer_id`.
    pub fn elements(&self, buffer_id: u32, offset: usize, len: usize) -> &[T] {
        self.raw(buffer_id).elements(offset, len)
    }

    /// Read the large-array cell at `index` of `buffer_id`.
    pub fn cell(&self, buffer_id: u32, index: usize) -> &[T] {
        // SAFETY: cells are only reset through `&mut self`.
        unsafe { self.raw(buffer_id).cell(index) }
    }

    /// Put `len` elements at `entry` on hold, together with `extra_bytes` of
    /// heap memory they own. Nothing is freed until the hold is trimmed.
    pub fn hold_elem(&mut self, entry: EntryRef, len: usize, extra_bytes: usize) {
        let buffer_id = R::buffer_id(entry);
        let state = &mut self.states[buffer_id as usize];
        assert_ne!(
            state.status(),
            BufferStatus::Free,
            "hold of {entry:?} in free buffer {buffer_id}"
        );
        state.inc_extra_hold_bytes(extra_bytes);
        if state.elem_hold_disabled() {
            // The whole buffer is already on hold.
            return;
        }
        state.inc_hold_elems(len);
        self.elem_hold_pending.push(ElemHold {
            entry,
            len,
            extra_bytes,
        });
    }

    /// Put a whole buffer on hold. Its id becomes free once the hold is
    /// trimmed.
    pub fn hold_buffer(&mut self, buffer_id: u32) {
        let type_id = self.state(buffer_id).type_id();
        if self.active[type_id as usize] == Some(buffer_id) {
            self.switch_active_buffer(type_id, 0);
        }
        self.states[buffer_id as usize].on_hold();
        self.buffer_hold_pending.push(buffer_id);
        debug!(buffer_id, type_id, "buffer put on hold");
    }

    /// Stamp all pending holds with `generation`.
    ///
    /// Never stamps below the current generation, so entries cannot be
    /// trimmed while a reader that might see them is still active. Stamps
    /// never decrease either: an element hold is always trimmed no later
    /// than a buffer hold queued after it.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        let generation = generation
            .max(self.generations.current_generation())
            .max(self.last_stamped);
        self.last_stamped = generation;
        let elems = self.elem_hold_pending.len();
        let buffers = self.buffer_hold_pending.len();
        self.elem_hold_list
            .extend(self.elem_hold_pending.drain(..).map(|h| (generation, h)));
        self.buffer_hold_list
            .extend(self.buffer_hold_pending.drain(..).map(|b| (generation, b)));
        if elems + buffers > 0 {
            trace!(generation, elems, buffers, "transferred hold lists");
        }
    }

    /// Reclaim every hold stamped before `used_generation`.
    ///
    /// Clamped to the oldest generation a live guard still pins.
    pub fn trim_hold_lists(&mut self, used_generation: Generation) {
        let used = used_generation.min(self.generations.oldest_used_generation());
        self.trim_hold_lists_below(used);
    }

    /// Reclaim everything on hold, pending or not.
    ///
    /// # Panics
    /// Panics if any generation guard is outstanding.
    pub fn clear_hold_lists(&mut self) {
        assert_eq!(
            self.generations.guard_count(),
            0,
            "clearing hold lists while readers hold generation guards"
        );
        self.transfer_hold_lists(self.generations.current_generation());
        self.trim_hold_lists_below(Generation::MAX);
    }

    /// Pick the in-use buffer with the most wasted space and prepare it for
    /// compaction. If it is its type's active buffer, the type is switched
    /// to a fresh buffer so compacted data lands elsewhere.
    ///
    /// Wasted space is `(dead + held) / size`, leaving out elements reserved
    /// at activation. Ties go to the buffer that freed more bytes, then to
    /// buffers without a reservation, then to the lowest id.
    pub fn start_compact_worst_buffer(&mut self) -> u32 {
        self.start_compact(None)
    }

    /// Like [`start_compact_worst_buffer`](Self::start_compact_worst_buffer),
    /// restricted to buffers of `type_id`.
    pub fn start_compact_worst_buffer_of_type(&mut self, type_id: u32) -> u32 {
        self.start_compact(Some(type_id))
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        for (buffer_id, state) in self.states.iter().enumerate() {
            if state.status() == BufferStatus::Free {
                continue;
            }
            let slot = self.raw(buffer_id as u32).slot_bytes();
            usage.inc_allocated_bytes(state.capacity() * slot + state.extra_used_bytes());
            usage.inc_used_bytes(state.size() * slot + state.extra_used_bytes());
            usage.inc_dead_bytes(state.dead_elems() * slot);
            if state.status() == BufferStatus::Hold {
                usage.inc_hold_bytes(
                    (state.size() - state.dead_elems()) * slot + state.extra_used_bytes(),
                );
            } else {
                usage.inc_hold_bytes(state.hold_elems() * slot + state.extra_hold_bytes());
            }
        }
        usage
    }

    // --- internal helpers ---

    fn state(&self, buffer_id: u32) -> &BufferState {
        self.states
            .get(buffer_id as usize)
            .unwrap_or_else(|| panic!("buffer {buffer_id} was never allocated"))
    }

    fn raw(&self, buffer_id: u32) -> &RawBuffer<T> {
        // SAFETY: buffers are released only through `&mut self`.
        unsafe { self.shared.get(buffer_id) }
            .unwrap_or_else(|| panic!("buffer {buffer_id} is not allocated"))
    }

    fn switch_active_buffer(&mut self, type_id: u32, elems_needed: usize) {
        if let Some(old) = self.active[type_id as usize].take() {
            self.states[old as usize].on_retire();
        }
        self.activate_buffer(type_id, elems_needed);
    }

    fn free_buffer_id(&mut self) -> u32 {
        if let Some(id) = self
            .states
            .iter()
            .position(|s| s.status() == BufferStatus::Free)
        {
            return id as u32;
        }
        let id = self.states.len();
        assert!(
            id < R::num_buffers() as usize,
            "buffer id space exhausted: all {} buffers in use",
            R::num_buffers()
        );
        self.states.push(BufferState::new());
        id as u32
    }

    fn activate_buffer(&mut self, type_id: u32, elems_needed: usize) -> u32 {
        let buffer_id = self.free_buffer_id();
        let config = &self.types[type_id as usize];
        let cluster_size = config.cluster_size();
        // (buffer 0, offset 0) encodes to the invalid handle. The reserved
        // cluster is allocated on top of what the type's sizing asks for.
        let reserved_clusters = usize::from(buffer_id == 0);
        let reserved = reserved_clusters * cluster_size;
        let needed_clusters = elems_needed.div_ceil(cluster_size).max(1);
        let used_clusters: usize = self
            .states
            .iter()
            .filter(|s| s.is_in_use() && s.type_id() == type_id)
            .map(|s| (s.size() - s.wasted_elems()) / cluster_size)
            .sum();
        let clusters = (config.clusters_to_alloc(used_clusters, needed_clusters)
            + reserved_clusters)
            .min(R::offset_size());
        let capacity = clusters * cluster_size;
        assert!(
            capacity - reserved >= elems_needed,
            "buffer {buffer_id} cannot fit {elems_needed} elements after its reservation"
        );

        let buffer = match config.kind() {
            BufferKind::SmallArray { .. } => RawBuffer::with_elements(type_id, capacity),
            BufferKind::LargeArray => RawBuffer::with_cells(type_id, capacity),
        };
        buffer.publish(reserved);
        self.shared.install(buffer_id, buffer);
        self.states[buffer_id as usize].on_active(type_id, capacity, reserved);
        self.active[type_id as usize] = Some(buffer_id);
        debug!(buffer_id, type_id, capacity, "activated buffer");
        buffer_id
    }

    fn start_compact(&mut self, type_filter: Option<u32>) -> u32 {
        let mut worst: Option<(u32, f64, usize, bool)> = None;
        for (id, state) in self.states.iter().enumerate() {
            if !state.is_in_use() || type_filter.is_some_and(|t| t != state.type_id()) {
                continue;
            }
            let ratio = state.waste_ratio();
            let freed_bytes = state.freed_elems() * self.raw(id as u32).slot_bytes();
            let reserved = state.reserved_elems() > 0;
            let better = match worst {
                None => true,
                Some((_, r, b, res)) => {
                    ratio > r
                        || (ratio == r && freed_bytes > b)
                        || (ratio == r && freed_bytes == b && res && !reserved)
                }
            };
            if better {
                worst = Some((id as u32, ratio, freed_bytes, reserved));
            }
        }
        let Some((buffer_id, ratio, _, _)) = worst else {
            panic!("no buffer eligible for compaction");
        };
        let type_id = self.states[buffer_id as usize].type_id();
        if self.active[type_id as usize] == Some(buffer_id) {
            self.switch_active_buffer(type_id, 0);
        }
        debug!(buffer_id, type_id, ratio, "compacting buffer");
        buffer_id
    }

    fn trim_hold_lists_below(&mut self, used: Generation) {
        let mut elems = 0usize;
        while let Some(&(generation, hold)) = self.elem_hold_list.front() {
            if generation >= used {
                break;
            }
            self.elem_hold_list.pop_front();
            self.clean_elem_hold(hold);
            elems += 1;
        }
        let mut buffers = 0usize;
        while let Some(&(generation, buffer_id)) = self.buffer_hold_list.front() {
            if generation >= used {
                break;
            }
            self.buffer_hold_list.pop_front();
            self.free_buffer(buffer_id);
            buffers += 1;
        }
        if elems + buffers > 0 {
            trace!(used, elems, buffers, "trimmed hold lists");
        }
    }

    fn clean_elem_hold(&mut self, hold: ElemHold) {
        let (buffer_id, offset) = R::decode(hold.entry);
        let state = &self.states[buffer_id as usize];
        debug_assert_ne!(state.status(), BufferStatus::Free);
        if let BufferKind::LargeArray = self.types[state.type_id() as usize].kind() {
            // SAFETY: the hold generation is older than every live guard.
            let len = unsafe { self.raw(buffer_id).reset_cell(offset) };
            debug_assert_eq!(len * mem::size_of::<T>(), hold.extra_bytes);
        }
        self.states[buffer_id as usize].clean_hold(hold.len, hold.extra_bytes);
    }

    fn free_buffer(&mut self, buffer_id: u32) {
        // SAFETY: the hold generation is older than every live guard.
        unsafe { self.shared.release(buffer_id) };
        self.states[buffer_id as usize].on_free();
        debug!(buffer_id, "freed buffer");
    }
}

impl<T, R> DataStore<T, R> {
    /// Free every allocated buffer. Only effective when no reader shares the
    /// buffer table; otherwise the last reader releases the memory.
    pub(crate) fn drop_buffers(&mut self) {
        if Arc::get_mut(&mut self.shared).is_none() {
            debug!("readers still attached; buffers are released with the last reader");
            return;
        }
        for buffer_id in 0..self.states.len() as u32 {
            // SAFETY: no other handle to the buffer table exists.
            unsafe { self.shared.release(buffer_id) };
        }
        self.states.clear();
        self.active.iter_mut().for_each(|a| *a = None);
        self.elem_hold_list.clear();
        self.elem_hold_pending.clear();
        self.buffer_hold_list.clear();
        self.buffer_hold_pending.clear();
    }
}

impl<T, R> Drop for DataStore<T, R> {
    fn drop(&mut self) {
        self.drop_buffers();
    }
}

impl<T, R> fmt::Debug for DataStore<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("types", &self.types.len())
            .field("buffers", &self.states.len())
            .field("active", &self.active)
            .field("elem_holds", &(self.elem_hold_pending.len() + self.elem_hold_list.len()))
            .field(
                "buffer_holds",
                &(self.buffer_hold_pending.len() + self.buffer_hold_list.len()),
            )
            .finish()
    }
}
