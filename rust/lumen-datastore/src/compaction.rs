//! Online compaction of a single buffer.
//!
//! Published data never changes in place, so compaction copies each live
//! array out of the drained buffer into whichever buffer is active for its
//! type and repoints the caller's handle. The new data is released before the
//! handle is rewritten: a reader that sees the new handle also sees the
//! copied elements.

use crate::array_store::ArrayStore;
use crate::entry_ref::{AtomicEntryRef, EntryRef, RefType};
use std::fmt;
use std::sync::atomic::{fence, Ordering};

/// Drives compaction of one buffer selected by
/// [`ArrayStore::compact_worst`].
///
/// Pass every live handle through [`compact`](Self::compact) or
/// [`compact_atomic`](Self::compact_atomic), in as many batches as needed.
/// Dropping the context puts the drained buffer on hold.
pub struct CompactionContext<'a, T, R>
where
    T: Copy + Send + Sync + 'static,
    R: RefType,
{
    store: &'a mut ArrayStore<T, R>,
    buffer_id: u32,
    moved: usize,
    scratch: Vec<T>,
}

impl<'a, T, R> CompactionContext<'a, T, R>
where
    T: Copy + Send + Sync + 'static,
    R: RefType,
{
    pub(crate) fn new(store: &'a mut ArrayStore<T, R>, buffer_id: u32) -> Self {
        Self {
            store,
            buffer_id,
            moved: 0,
            scratch: Vec::new(),
        }
    }

    /// The buffer being drained.
    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    /// Number of arrays moved so far.
    pub fn moved(&self) -> usize {
        self.moved
    }

    /// Move every handle in `refs` that points into the drained buffer and
    /// rewrite it in place. Other handles are left untouched.
    pub fn compact(&mut self, refs: &mut [EntryRef]) {
        for entry in refs.iter_mut() {
            if let Some(moved) = self.move_entry(*entry) {
                fence(Ordering::Release);
                *entry = moved;
            }
        }
    }

    /// Like [`compact`](Self::compact) for handles shared with readers;
    /// each rewrite is a release store.
    pub fn compact_atomic(&mut self, refs: &[AtomicEntryRef]) {
        for slot in refs {
            if let Some(moved) = self.move_entry(slot.load_relaxed()) {
                slot.store_release(moved);
            }
        }
    }

    fn move_entry(&mut self, entry: EntryRef) -> Option<EntryRef> {
        if !entry.is_valid() || R::buffer_id(entry) != self.buffer_id {
            return None;
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(self.store.get(entry));
        let moved = self.store.add(&self.scratch);
        debug_assert_ne!(R::buffer_id(moved), self.buffer_id);
        self.moved += 1;
        Some(moved)
    }
}

impl<'a, T, R> Drop for CompactionContext<'a, T, R>
where
    T: Copy + Send + Sync + 'static,
    R: RefType,
{
    fn drop(&mut self) {
        tracing::debug!(buffer_id = self.buffer_id, moved = self.moved, "compaction finished");
        self.store.finish_compaction(self.buffer_id);
    }
}

impl<'a, T, R> fmt::Debug for CompactionContext<'a, T, R>
where
    T: Copy + Send + Sync + 'static,
    R: RefType,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionContext")
            .field("buffer_id", &self.buffer_id)
            .field("moved", &self.moved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer_state::BufferStatus;
    use crate::entry_ref::{AtomicEntryRef, EntryRef, EntryRefT, RefType};
    use crate::{ArrayStore, ArrayStoreConfig};

    type SmallRef = EntryRefT<4, 6>;

    fn store() -> ArrayStore<u32, SmallRef> {
        ArrayStore::new(ArrayStoreConfig::new(3).with_clusters(4, 16))
    }

    #[test]
    fn test_compact_picks_most_wasted_buffer() {
        let mut s = store();
        let a = s.add(&[1, 2]);
        let b = s.add(&[3, 4]);
        let _c = s.add(&[5, 6, 7]);
        s.remove(a);
        let drained = SmallRef::buffer_id(b);

        let mut refs = [b];
        {
            let mut ctx = s.compact_worst();
            assert_eq!(ctx.buffer_id(), drained);
            ctx.compact(&mut refs);
            assert_eq!(ctx.moved(), 1);
        }
        assert_ne!(SmallRef::buffer_id(refs[0]), drained);
        assert_eq!(s.get(refs[0]), &[3, 4]);
        assert_eq!(
            s.data_store().buffer_state(drained).status,
            BufferStatus::Hold
        );

        s.commit();
        assert_eq!(
            s.data_store().buffer_state(drained).status,
            BufferStatus::Free
        );
        assert_eq!(s.get(refs[0]), &[3, 4]);
    }

    #[test]
    fn test_compact_leaves_other_refs_alone() {
        let mut s = store();
        let keep = s.add(&[1, 2, 3]);
        let gone = s.add(&[4, 5]);
        let live = s.add(&[6, 7]);
        s.remove(gone);
        let mut refs = [keep, EntryRef::INVALID, live];
        {
            let mut ctx = s.compact_worst();
            assert_eq!(ctx.buffer_id(), SmallRef::buffer_id(live));
            ctx.compact(&mut refs);
        }
        assert_eq!(refs[0], keep);
        assert_eq!(refs[1], EntryRef::INVALID);
        assert_ne!(refs[2], live);
        assert_eq!(s.get(refs[2]), &[6, 7]);
    }

    #[test]
    fn test_compact_large_arrays() {
        let mut s = store();
        let big: Vec<u32> = (0..10).collect();
        let dead = s.add(&[9; 6]);
        let r = s.add(&big);
        s.remove(dead);
        s.commit();

        let drained = SmallRef::buffer_id(r);
        let refs = [AtomicEntryRef::new(r)];
        {
            let mut ctx = s.compact_worst();
            assert_eq!(ctx.buffer_id(), drained);
            ctx.compact_atomic(&refs);
        }
        let moved = refs[0].load_acquire();
        assert_ne!(SmallRef::buffer_id(moved), drained);
        assert_eq!(s.get(moved), big.as_slice());
        assert_eq!(s.buffer_state(moved).extra_used_bytes, 10 * 4);
    }

    #[test]
    fn test_compacted_buffer_id_is_reused() {
        let mut s = store();
        let a = s.add(&[1]);
        s.remove(a);
        let drained = {
            let ctx = s.compact_worst();
            ctx.buffer_id()
        };
        let used_before = s.address_space_usage().used();
        s.commit();
        assert_eq!(s.address_space_usage().used(), used_before - 1);
        // The next activation takes the lowest free id.
        for i in 0..64u32 {
            s.add(&[i, i]);
        }
        assert_ne!(
            s.data_store().buffer_state(drained).status,
            BufferStatus::Free
        );
    }
}
