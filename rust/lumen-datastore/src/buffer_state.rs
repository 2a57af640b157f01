//! Writer-side bookkeeping for a single buffer.
//!
//! All counts are in elements (slots), not clusters. Extra bytes track heap
//! memory owned by large-array cells, which lives outside the buffer.

use serde::Serialize;

/// Lifecycle of a buffer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    /// Unallocated; the id may be activated for any type.
    Free,
    /// The current appendable buffer of its type.
    Active,
    /// Superseded by a newer active buffer. Frozen but still readable.
    Retired,
    /// The whole buffer is waiting for readers to move past it.
    Hold,
}

/// Mutable accounting for one buffer, owned by the writer.
#[derive(Debug, Clone)]
pub(crate) struct BufferState {
    status: BufferStatus,
    type_id: u32,
    size: usize,
    capacity: usize,
    dead_elems: usize,
    hold_elems: usize,
    /// Leading elements consumed at activation; included in `dead_elems`.
    reserved_elems: usize,
    extra_used_bytes: usize,
    extra_hold_bytes: usize,
    elem_hold_disabled: bool,
}

impl BufferState {
    pub(crate) fn new() -> Self {
        Self {
            status: BufferStatus::Free,
            type_id: 0,
            size: 0,
            capacity: 0,
            dead_elems: 0,
            hold_elems: 0,
            reserved_elems: 0,
            extra_used_bytes: 0,
            extra_hold_bytes: 0,
            elem_hold_disabled: false,
        }
    }

    /// Activate a free buffer for `type_id`. The first `reserved` elements
    /// are consumed up front and counted as dead.
    pub(crate) fn on_active(&mut self, type_id: u32, capacity: usize, reserved: usize) {
        assert_eq!(
            self.status,
            BufferStatus::Free,
            "activating buffer that is not free"
        );
        assert!(reserved <= capacity, "reserved elements exceed capacity");
        *self = Self::new();
        self.status = BufferStatus::Active;
        self.type_id = type_id;
        self.capacity = capacity;
        self.size = reserved;
        self.dead_elems = reserved;
        self.reserved_elems = reserved;
    }

    pub(crate) fn on_retire(&mut self) {
        assert_eq!(self.status, BufferStatus::Active, "retiring inactive buffer");
        self.status = BufferStatus::Retired;
    }

    pub(crate) fn on_hold(&mut self) {
        assert!(
            matches!(self.status, BufferStatus::Active | BufferStatus::Retired),
            "holding buffer in state {:?}",
            self.status
        );
        self.status = BufferStatus::Hold;
        self.elem_hold_disabled = true;
    }

    pub(crate) fn on_free(&mut self) {
        assert_eq!(self.status, BufferStatus::Hold, "freeing buffer not on hold");
        *self = Self::new();
    }

    /// Account for `elems` appended elements and `extra_bytes` of heap data.
    pub(crate) fn pushed_back(&mut self, elems: usize, extra_bytes: usize) {
        assert!(
            self.size + elems <= self.capacity,
            "append of {elems} elements overflows buffer capacity {}",
            self.capacity
        );
        self.size += elems;
        self.extra_used_bytes += extra_bytes;
    }

    pub(crate) fn inc_hold_elems(&mut self, elems: usize) {
        self.hold_elems += elems;
        debug_assert!(self.hold_elems + self.dead_elems <= self.size);
    }

    pub(crate) fn inc_extra_hold_bytes(&mut self, bytes: usize) {
        self.extra_hold_bytes += bytes;
    }

    /// Held elements have been cleaned: move them to dead and release their
    /// extra bytes.
    pub(crate) fn clean_hold(&mut self, elems: usize, extra_bytes: usize) {
        assert!(self.hold_elems >= elems, "hold element underflow");
        assert!(self.extra_hold_bytes >= extra_bytes, "extra hold byte underflow");
        assert!(self.extra_used_bytes >= extra_bytes, "extra used byte underflow");
        self.hold_elems -= elems;
        self.dead_elems += elems;
        self.extra_hold_bytes -= extra_bytes;
        self.extra_used_bytes -= extra_bytes;
    }

    pub(crate) fn status(&self) -> BufferStatus {
        self.status
    }

    pub(crate) fn type_id(&self) -> u32 {
        self.type_id
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.size
    }

    pub(crate) fn dead_elems(&self) -> usize {
        self.dead_elems
    }

    pub(crate) fn hold_elems(&self) -> usize {
        self.hold_elems
    }

    pub(crate) fn extra_used_bytes(&self) -> usize {
        self.extra_used_bytes
    }

    pub(crate) fn extra_hold_bytes(&self) -> usize {
        self.extra_hold_bytes
    }

    pub(crate) fn elem_hold_disabled(&self) -> bool {
        self.elem_hold_disabled
    }

    /// Readable buffers that still belong to their type.
    pub(crate) fn is_in_use(&self) -> bool {
        matches!(self.status, BufferStatus::Active | BufferStatus::Retired)
    }

    /// Elements that no longer hold live data.
    pub(crate) fn wasted_elems(&self) -> usize {
        self.dead_elems + self.hold_elems
    }

    pub(crate) fn reserved_elems(&self) -> usize {
        self.reserved_elems
    }

    /// Wasted elements that were appended and later freed.
    pub(crate) fn freed_elems(&self) -> usize {
        self.wasted_elems() - self.reserved_elems
    }

    /// Fraction of appended elements that were freed, ignoring reserved
    /// ones. Drives compaction candidate selection.
    pub(crate) fn waste_ratio(&self) -> f64 {
        let appended = self.size - self.reserved_elems;
        if appended == 0 {
            0.0
        } else {
            self.freed_elems() as f64 / appended as f64
        }
    }

    pub(crate) fn stats(&self, buffer_id: u32) -> BufferStats {
        BufferStats {
            buffer_id,
            status: self.status,
            type_id: self.type_id,
            size: self.size,
            capacity: self.capacity,
            dead_elems: self.dead_elems,
            hold_elems: self.hold_elems,
            extra_used_bytes: self.extra_used_bytes,
            extra_hold_bytes: self.extra_hold_bytes,
        }
    }
}

/// Point-in-time snapshot of a buffer's occupancy, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub buffer_id: u32,
    pub status: BufferStatus,
    pub type_id: u32,
    /// Elements appended so far, including dead and held ones.
    pub size: usize,
    /// Elements the buffer can hold.
    pub capacity: usize,
    pub dead_elems: usize,
    pub hold_elems: usize,
    /// Heap bytes owned by large-array cells in this buffer.
    pub extra_used_bytes: usize,
    /// Portion of `extra_used_bytes` waiting on a hold list.
    pub extra_hold_bytes: usize,
}

impl BufferStats {
    /// Elements still holding live data.
    pub fn live_elems(&self) -> usize {
        self.size - self.dead_elems - self.hold_elems
    }
}
