//! Slot storage shared between the writer and concurrent readers.
//!
//! A [`RawBuffer`] is a fixed-capacity region that is never resized or moved
//! while allocated. The writer appends past the published size and then
//! advances it with release ordering; readers bounds-check against the
//! published size with acquire ordering, so any slot a reader can reach was
//! fully written before the reader looked at it.
//!
//! Small-array elements are write-once. Large-array cells are reset to an
//! empty vector when their hold is trimmed, and whole buffers are freed when
//! a buffer hold is trimmed; both only happen once the generation service
//! reports that no reader can still observe them.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

enum Slots<T> {
    Elements(Box<[UnsafeCell<MaybeUninit<T>>]>),
    Cells(Box<[UnsafeCell<Vec<T>>]>),
}

/// One allocated buffer.
pub(crate) struct RawBuffer<T> {
    type_id: u32,
    slots: Slots<T>,
    published: AtomicUsize,
}

// SAFETY: slots below `published` are only mutated (cells reset) once no
// reader can observe them, and slots at or above `published` are only touched
// by the single writer. Shared access therefore never races.
unsafe impl<T: Send + Sync> Sync for RawBuffer<T> {}

impl<T: Copy> RawBuffer<T> {
    /// Allocate a buffer of `capacity` uninitialized elements.
    pub(crate) fn with_elements(type_id: u32, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            type_id,
            slots: Slots::Elements(slots),
            published: AtomicUsize::new(0),
        }
    }

    /// Allocate a buffer of `capacity` empty large-array cells.
    pub(crate) fn with_cells(type_id: u32, capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| UnsafeCell::new(Vec::new())).collect();
        Self {
            type_id,
            slots: Slots::Cells(slots),
            published: AtomicUsize::new(0),
        }
    }

    pub(crate) fn type_id(&self) -> u32 {
        self.type_id
    }

    pub(crate) fn capacity(&self) -> usize {
        match &self.slots {
            Slots::Elements(s) => s.len(),
            Slots::Cells(s) => s.len(),
        }
    }

    /// Bytes occupied by one slot inside the buffer.
    pub(crate) fn slot_bytes(&self) -> usize {
        match &self.slots {
            Slots::Elements(_) => mem::size_of::<T>(),
            Slots::Cells(_) => mem::size_of::<Vec<T>>(),
        }
    }

    pub(crate) fn published(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    /// Make the first `size` slots visible to readers.
    ///
    /// # Panics
    /// Panics if `size` shrinks the published region or exceeds capacity.
    pub(crate) fn publish(&self, size: usize) {
        let current = self.published.load(Ordering::Relaxed);
        assert!(size >= current, "published size cannot shrink");
        assert!(size <= self.capacity(), "publishing past capacity");
        self.published.store(size, Ordering::Release);
    }

    /// Write `values` starting at element `at` and publish them.
    ///
    /// # Safety
    /// Only the single writer may call this, and `at` must equal the current
    /// published size.
    pub(crate) unsafe fn append_elements(&self, at: usize, values: &[T]) {
        let Slots::Elements(slots) = &self.slots else {
            panic!("buffer of type {} does not store elements", self.type_id);
        };
        debug_assert_eq!(at, self.published.load(Ordering::Relaxed));
        let end = at + values.len();
        assert!(end <= slots.len(), "element append overflows buffer");
        for (slot, &value) in slots[at..end].iter().zip(values) {
            // SAFETY: unpublished slots are invisible to readers.
            unsafe { (*slot.get()).write(value) };
        }
        self.publish(end);
    }

    /// Store a large-array cell at slot `at` and publish it.
    ///
    /// # Safety
    /// Same contract as [`append_elements`](Self::append_elements).
    pub(crate) unsafe fn append_cell(&self, at: usize, cell: Vec<T>) {
        let Slots::Cells(slots) = &self.slots else {
            panic!("buffer of type {} does not store cells", self.type_id);
        };
        debug_assert_eq!(at, self.published.load(Ordering::Relaxed));
        assert!(at < slots.len(), "cell append overflows buffer");
        // SAFETY: unpublished slot, invisible to readers.
        unsafe { *slots[at].get() = cell };
        self.publish(at + 1);
    }

    /// View `len` elements starting at element `offset`.
    ///
    /// # Panics
    /// Panics if the range is not published or the buffer stores cells.
    pub(crate) fn elements(&self, offset: usize, len: usize) -> &[T] {
        let Slots::Elements(slots) = &self.slots else {
            panic!("buffer of type {} does not store elements", self.type_id);
        };
        let Some(end) = offset.checked_add(len) else {
            panic!("element range {offset}+{len} overflows");
        };
        assert!(
            end <= self.published(),
            "element range {offset}..{end} is not published"
        );
        // SAFETY: the range is published, hence initialized, and elements
        // are never written again. `UnsafeCell<MaybeUninit<T>>` has the
        // layout of `T`.
        unsafe { slice::from_raw_parts(slots.as_ptr().add(offset) as *const T, len) }
    }

    /// View the contents of the large-array cell at `index`.
    ///
    /// # Safety
    /// The cell must not be reset while the returned slice is alive.
    pub(crate) unsafe fn cell(&self, index: usize) -> &[T] {
        let Slots::Cells(slots) = &self.slots else {
            panic!("buffer of type {} does not store cells", self.type_id);
        };
        assert!(index < self.published(), "cell {index} is not published");
        // SAFETY: published cells are only reset under the caller's contract.
        unsafe { (*slots[index].get()).as_slice() }
    }

    /// Drop the heap data of the cell at `index`, returning its length.
    ///
    /// # Safety
    /// Writer only, and no reader may still observe the cell.
    pub(crate) unsafe fn reset_cell(&self, index: usize) -> usize {
        let Slots::Cells(slots) = &self.slots else {
            panic!("buffer of type {} does not store cells", self.type_id);
        };
        // SAFETY: upheld by the caller.
        let old = unsafe { mem::take(&mut *slots[index].get()) };
        old.len()
    }
}

/// The buffer table, indexed by buffer id.
///
/// Shared by the writer and all readers of one store. Entries are installed
/// and released by the writer only.
pub(crate) struct SharedBuffers<T> {
    buffers: Box<[AtomicPtr<RawBuffer<T>>]>,
    _owns: PhantomData<Box<RawBuffer<T>>>,
}

impl<T> SharedBuffers<T> {
    pub(crate) fn new(num_buffers: usize) -> Self {
        let buffers = (0..num_buffers)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            buffers,
            _owns: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Look up an allocated buffer.
    ///
    /// # Safety
    /// The buffer must not be released while the returned reference is
    /// alive: the caller is the writer, or a reader whose generation guard
    /// predates any hold on this buffer.
    pub(crate) unsafe fn get(&self, buffer_id: u32) -> Option<&RawBuffer<T>> {
        let ptr = self.buffers[buffer_id as usize].load(Ordering::Acquire);
        // SAFETY: non-null entries point at live boxed buffers.
        unsafe { ptr.as_ref() }
    }

    /// Install a freshly allocated buffer. Writer only.
    ///
    /// # Panics
    /// Panics if `buffer_id` already holds a buffer.
    pub(crate) fn install(&self, buffer_id: u32, buffer: RawBuffer<T>) {
        let raw = Box::into_raw(Box::new(buffer));
        let old = self.buffers[buffer_id as usize].swap(raw, Ordering::AcqRel);
        assert!(old.is_null(), "buffer {buffer_id} is already allocated");
    }

    /// Free the buffer at `buffer_id`, if any.
    ///
    /// # Safety
    /// Writer only, and no reader may still observe the buffer.
    pub(crate) unsafe fn release(&self, buffer_id: u32) {
        let old = self.buffers[buffer_id as usize].swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: the pointer came from `Box::into_raw` in `install`.
            drop(unsafe { Box::from_raw(old) });
        }
    }
}

impl<T> Drop for SharedBuffers<T> {
    fn drop(&mut self) {
        for slot in self.buffers.iter_mut() {
            let raw = *slot.get_mut();
            if !raw.is_null() {
                // SAFETY: exclusive access; the pointer came from `install`.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}
