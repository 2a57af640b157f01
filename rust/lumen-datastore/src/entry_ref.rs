//! Compact handles into the buffer pool.
//!
//! An [`EntryRef`] is an opaque 32-bit value that packs a buffer id and an
//! offset within that buffer. The split between the two fields is chosen by a
//! [`RefType`] codec, normally [`EntryRefT`]:
//!
//! ```text
//! 31                 OFFSET_BITS                0
//! +--------------------+-------------------------+
//! |     buffer id      |          offset         |
//! +--------------------+-------------------------+
//! ```
//!
//! The all-zero bit pattern is the invalid handle. Buffer 0 therefore never
//! hands out offset 0 (see `DataStore::activate_buffer`).

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque handle to an entry stored in a buffer pool.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryRef(u32);

impl EntryRef {
    /// The invalid handle, used for empty arrays and as a null sentinel.
    pub const INVALID: EntryRef = EntryRef(0);

    /// Wrap raw handle bits.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw handle bits.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is the invalid handle.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "EntryRef({:#010x})", self.0)
        } else {
            f.write_str("EntryRef(invalid)")
        }
    }
}

/// A bit-packing policy mapping `(buffer_id, offset)` to an [`EntryRef`].
///
/// Implementations must be pure bit packing: `decode(encode(b, o)) == (b, o)`
/// for every `b < num_buffers()` and `o < offset_size()`.
pub trait RefType: Send + Sync + 'static {
    /// Number of addressable offsets within one buffer.
    fn offset_size() -> usize;

    /// Number of addressable buffers.
    fn num_buffers() -> u32;

    /// Pack a buffer id and offset.
    ///
    /// # Panics
    /// Panics if either field is out of range for this encoding.
    fn encode(buffer_id: u32, offset: usize) -> EntryRef;

    /// Buffer id of a valid handle.
    fn buffer_id(entry: EntryRef) -> u32;

    /// Offset of a valid handle.
    fn offset(entry: EntryRef) -> usize;

    /// Split a handle into `(buffer_id, offset)`.
    fn decode(entry: EntryRef) -> (u32, usize) {
        (Self::buffer_id(entry), Self::offset(entry))
    }

    /// Largest offset this encoding can represent.
    fn max_offset() -> usize {
        Self::offset_size() - 1
    }

    /// Largest buffer count this encoding can represent.
    fn max_buffers() -> u32 {
        Self::num_buffers()
    }
}

/// Handle codec with `OFFSET_BITS` low bits of offset and `BUFFER_BITS`
/// high bits of buffer id.
///
/// `BUFFER_BITS = 0` (the default) gives the buffer id every bit left over
/// by the offset, so `EntryRefT<22>` addresses `1 << 10` buffers.
pub struct EntryRefT<const OFFSET_BITS: u32, const BUFFER_BITS: u32 = 0>;

impl<const OFFSET_BITS: u32, const BUFFER_BITS: u32> EntryRefT<OFFSET_BITS, BUFFER_BITS> {
    /// Buffer bits actually used: `BUFFER_BITS`, or all remaining bits when 0.
    const BUFFER_WIDTH: u32 = {
        assert!(OFFSET_BITS > 0 && OFFSET_BITS < 32, "OFFSET_BITS must be in 1..32");
        let width = if BUFFER_BITS == 0 {
            32 - OFFSET_BITS
        } else {
            BUFFER_BITS
        };
        assert!(OFFSET_BITS + width <= 32, "handle encoding exceeds 32 bits");
        width
    };

    const OFFSET_MASK: u32 = (1u32 << OFFSET_BITS) - 1;
}

impl<const OFFSET_BITS: u32, const BUFFER_BITS: u32> RefType
    for EntryRefT<OFFSET_BITS, BUFFER_BITS>
{
    fn offset_size() -> usize {
        1usize << OFFSET_BITS
    }

    fn num_buffers() -> u32 {
        1u32 << Self::BUFFER_WIDTH
    }

    fn encode(buffer_id: u32, offset: usize) -> EntryRef {
        assert!(
            buffer_id < Self::num_buffers(),
            "buffer id {buffer_id} exceeds encoding limit {}",
            Self::num_buffers()
        );
        assert!(
            offset < Self::offset_size(),
            "offset {offset} exceeds encoding limit {}",
            Self::offset_size()
        );
        EntryRef(((buffer_id as u64) << OFFSET_BITS) as u32 | offset as u32)
    }

    fn buffer_id(entry: EntryRef) -> u32 {
        ((entry.0 as u64) >> OFFSET_BITS) as u32
    }

    fn offset(entry: EntryRef) -> usize {
        (entry.0 & Self::OFFSET_MASK) as usize
    }
}

/// Default codec used by the array store: 19 offset bits, 13 buffer bits.
pub type DefaultRefType = EntryRefT<19, 13>;

/// An [`EntryRef`] slot that can be published to concurrent readers.
///
/// The writer publishes with [`store_release`](Self::store_release) after the
/// referenced data is fully written; readers load with
/// [`load_acquire`](Self::load_acquire) and are then guaranteed to observe
/// that data.
#[derive(Default)]
pub struct AtomicEntryRef(AtomicU32);

impl AtomicEntryRef {
    pub fn new(entry: EntryRef) -> Self {
        Self(AtomicU32::new(entry.0))
    }

    /// Load with acquire ordering, pairing with [`store_release`](Self::store_release).
    pub fn load_acquire(&self) -> EntryRef {
        EntryRef(self.0.load(Ordering::Acquire))
    }

    /// Load without ordering. Only for the writer thread.
    pub fn load_relaxed(&self) -> EntryRef {
        EntryRef(self.0.load(Ordering::Relaxed))
    }

    /// Publish a handle whose target is fully constructed.
    pub fn store_release(&self, entry: EntryRef) {
        self.0.store(entry.0, Ordering::Release);
    }
}

impl fmt::Debug for AtomicEntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicEntryRef")
            .field(&self.load_relaxed())
            .finish()
    }
}

impl From<EntryRef> for AtomicEntryRef {
    fn from(entry: EntryRef) -> Self {
        Self::new(entry)
    }
}
