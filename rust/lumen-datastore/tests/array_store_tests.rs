//! End-to-end behaviour of the array store through its public API.

use lumen_datastore::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::mem;

type SmallRef = EntryRefT<8, 8>;

fn small_store(max_small: u32) -> ArrayStore<u64, SmallRef> {
    ArrayStore::new(ArrayStoreConfig::new(max_small).with_clusters(8, 64))
}

fn random_array(rng: &mut StdRng, max_len: usize) -> Vec<u64> {
    let len = rng.gen_range(0..=max_len);
    (0..len).map(|_| rng.gen()).collect()
}

// ===========================================================================
// Add / get / remove
// ===========================================================================

#[test]
fn store_random_round_trip() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut store = small_store(4);
    let mut live: Vec<(EntryRef, Vec<u64>)> = Vec::new();

    for round in 0..20 {
        for _ in 0..50 {
            let array = random_array(&mut rng, 12);
            let entry = store.add(&array);
            assert_eq!(entry.is_valid(), !array.is_empty());
            live.push((entry, array));
        }
        // Drop roughly half of what is live.
        let mut kept = Vec::with_capacity(live.len());
        for (entry, array) in live.drain(..) {
            if rng.gen_bool(0.5) {
                store.remove(entry);
            } else {
                kept.push((entry, array));
            }
        }
        live = kept;
        if round % 3 == 0 {
            store.commit();
        }
        for (entry, array) in &live {
            assert_eq!(store.get(*entry), array.as_slice());
        }
    }
}

#[test]
fn store_default_ref_type() {
    let mut store: ArrayStore<u32> = ArrayStore::new(ArrayStoreConfig::default());
    let arrays: Vec<Vec<u32>> = (1..=20).map(|n| (0..n).collect()).collect();
    let refs: Vec<EntryRef> = arrays.iter().map(|a| store.add(a)).collect();
    for (entry, array) in refs.iter().zip(&arrays) {
        assert_eq!(store.get(*entry), array.as_slice());
    }
    assert_eq!(store.max_small_array_size(), 8);
    assert_eq!(
        store.address_space_usage().limit(),
        DefaultRefType::num_buffers() as usize
    );
}

#[test]
fn store_handles_stay_valid_across_buffer_switches() {
    let mut store = small_store(2);
    let refs: Vec<(EntryRef, u64)> = (0..1000u64).map(|i| (store.add(&[i, i * 2]), i)).collect();
    let buffers: std::collections::BTreeSet<u32> =
        refs.iter().map(|(r, _)| SmallRef::buffer_id(*r)).collect();
    assert!(buffers.len() > 1);
    for (entry, i) in refs {
        assert_eq!(store.get(entry), &[i, i * 2]);
    }
}

#[test]
#[should_panic(expected = "buffer id space exhausted")]
fn store_buffer_exhaustion_panics() {
    let mut store: ArrayStore<u32, EntryRefT<4, 2>> =
        ArrayStore::new(ArrayStoreConfig::new(2));
    for i in 0..100u32 {
        store.add(&[i]);
    }
}

// ===========================================================================
// Memory accounting
// ===========================================================================

#[test]
fn memory_usage_tracks_small_arrays() {
    let mut store = small_store(4);
    let base = store.memory_usage();

    let entry = store.add(&[1, 2]);
    let usage = store.memory_usage();
    assert_eq!(usage.used_bytes - base.used_bytes, 2 * mem::size_of::<u64>());
    assert_eq!(usage.allocated_bytes, base.allocated_bytes);

    store.remove(entry);
    let usage = store.memory_usage();
    assert_eq!(usage.hold_bytes, 2 * mem::size_of::<u64>());
    assert_eq!(usage.live_bytes(), base.live_bytes());

    store.commit();
    let usage = store.memory_usage();
    assert_eq!(usage.hold_bytes, 0);
    assert_eq!(usage.dead_bytes - base.dead_bytes, 2 * mem::size_of::<u64>());
}

#[test]
fn memory_usage_tracks_large_array_heap() {
    let mut store = small_store(2);
    let cell = mem::size_of::<Vec<u64>>();
    let heap = 10 * mem::size_of::<u64>();
    let base = store.memory_usage();

    let entry = store.add(&[5; 10]);
    let usage = store.memory_usage();
    assert_eq!(usage.used_bytes - base.used_bytes, cell + heap);
    assert_eq!(usage.allocated_bytes - base.allocated_bytes, heap);

    store.remove(entry);
    assert_eq!(store.memory_usage().hold_bytes, cell + heap);

    store.commit();
    let usage = store.memory_usage();
    assert_eq!(usage.hold_bytes, 0);
    assert_eq!(usage.used_bytes - base.used_bytes, cell);
    assert_eq!(usage.dead_bytes - base.dead_bytes, cell);
    assert_eq!(store.buffer_state(entry).extra_used_bytes, 0);
}

#[test]
fn memory_usage_counts_held_buffer_as_hold() {
    let mut store = small_store(3);
    let refs: Vec<EntryRef> = (0..4u64).map(|i| store.add(&[i, i, i])).collect();
    store.remove(refs[0]);
    let drained = SmallRef::buffer_id(refs[0]);
    let before = store.memory_usage();

    let ctx = store.compact_worst();
    assert_eq!(ctx.buffer_id(), drained);
    drop(ctx);

    // Nothing was moved, so the remaining live arrays are now held with
    // the buffer.
    let usage = store.memory_usage();
    assert_eq!(usage.hold_bytes, 4 * 3 * mem::size_of::<u64>());
    assert!(usage.allocated_bytes > before.allocated_bytes);

    store.commit();
    assert_eq!(store.memory_usage().hold_bytes, 0);
    assert_eq!(
        store.data_store().buffer_state(drained).status,
        BufferStatus::Free
    );
}

// ===========================================================================
// Hold lists and generations
// ===========================================================================

#[test]
fn hold_list_waits_for_every_guard() {
    let mut store = small_store(4);
    let reader = store.reader();
    let entry = store.add(&[1, 2, 3]);

    let first = reader.take_guard();
    store.remove(entry);
    store.commit();
    let second = reader.take_guard();
    assert!(second.generation() > first.generation());

    store.commit();
    assert_eq!(store.buffer_state(entry).hold_elems, 3);

    drop(first);
    store.commit();
    // The hold was stamped before `second` was taken.
    assert_eq!(store.buffer_state(entry).hold_elems, 0);
    drop(second);
}

#[test]
fn shared_generation_handler_spans_stores() {
    let generations = std::sync::Arc::new(GenerationHandler::new());
    let config = ArrayStoreConfig::new(2).with_clusters(8, 64);
    let mut a: ArrayStore<u64, SmallRef> =
        ArrayStore::with_generation_handler(config.clone(), generations.clone());
    let mut b: ArrayStore<u64, SmallRef> =
        ArrayStore::with_generation_handler(config, generations.clone());

    let ra = a.add(&[1]);
    let rb = b.add(&[2]);
    let guard = b.reader().take_guard();
    a.remove(ra);
    b.remove(rb);
    a.commit();
    b.commit();
    assert_eq!(a.buffer_state(ra).hold_elems, 1);
    assert_eq!(b.buffer_state(rb).hold_elems, 1);

    drop(guard);
    a.commit();
    assert_eq!(a.buffer_state(ra).hold_elems, 0);
    assert_eq!(generations.guard_count(), 0);
}

#[test]
fn clear_hold_lists_reclaims_pending() {
    let mut store = small_store(4);
    let small = store.add(&[1, 2]);
    let large = store.add(&[3; 9]);
    store.remove(small);
    store.remove(large);
    store.clear_hold_lists();
    assert_eq!(store.memory_usage().hold_bytes, 0);
    assert_eq!(store.buffer_state(small).dead_elems, 2);
    assert_eq!(store.buffer_state(large).extra_used_bytes, 0);
}

// ===========================================================================
// Address space
// ===========================================================================

#[test]
fn address_space_follows_buffer_lifecycle() {
    let mut store = small_store(2);
    let initial = store.address_space_usage();
    assert_eq!(initial.used(), 3);
    assert_eq!(initial.limit(), SmallRef::num_buffers() as usize);

    let entry = store.add(&[1, 2]);
    store.remove(entry);
    {
        let ctx = store.compact_worst();
        assert_eq!(ctx.buffer_id(), SmallRef::buffer_id(entry));
    }
    // Drained buffer on hold plus its replacement.
    assert_eq!(store.address_space_usage().used(), 4);
    store.commit();
    assert_eq!(store.address_space_usage().used(), 3);
    assert!(store.address_space_usage().usage() < 0.05);
}

// ===========================================================================
// Compaction
// ===========================================================================

#[test]
fn compaction_reclaims_fragmented_store() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut store = small_store(4);
    let mut refs: Vec<EntryRef> = Vec::new();
    let mut arrays: Vec<Vec<u64>> = Vec::new();
    for _ in 0..400 {
        let len = rng.gen_range(1..=6);
        let array: Vec<u64> = (0..len).map(|_| rng.gen()).collect();
        refs.push(store.add(&array));
        arrays.push(array);
    }
    // Free every other array.
    for entry in refs.iter().step_by(2) {
        store.remove(*entry);
    }
    let mut live_refs: Vec<EntryRef> = refs.iter().skip(1).step_by(2).copied().collect();
    let live_arrays: Vec<Vec<u64>> = arrays.iter().skip(1).step_by(2).cloned().collect();
    store.commit();
    let dead_before = store.memory_usage().dead_bytes;

    for _ in 0..8 {
        {
            let mut ctx = store.compact_worst();
            ctx.compact(&mut live_refs);
        }
        store.commit();
        for (entry, array) in live_refs.iter().zip(&live_arrays) {
            assert_eq!(store.get(*entry), array.as_slice());
        }
    }
    assert!(store.memory_usage().dead_bytes < dead_before);
}

#[test]
fn type_layout_matches_size_classes() {
    let store = small_store(3);
    let data = store.data_store();
    assert_eq!(data.num_types(), 4);
    assert_eq!(
        data.type_config(LARGE_ARRAY_TYPE_ID).kind(),
        BufferKind::LargeArray
    );
    for array_size in 1..=3u32 {
        assert_eq!(
            data.type_config(array_size).kind(),
            BufferKind::SmallArray { array_size }
        );
        let buffer_id = data.active_buffer_id(array_size);
        assert_eq!(data.buffer_type_id(buffer_id), array_size);
        assert_eq!(store.type_id_for_len(array_size as usize), array_size);
    }
}
