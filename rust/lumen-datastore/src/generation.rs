//! Generation tracking for deferred reclamation.
//!
//! The writer advances a generation counter once per batch of mutations.
//! Readers take a [`GenerationGuard`] before dereferencing handles; the guard
//! pins the generation that was current when it was taken. Memory put on hold
//! at generation `g` may be reclaimed once
//! [`GenerationHandler::oldest_used_generation`] is greater than `g`.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonically increasing generation number.
pub type Generation = u64;

/// Epoch service shared between one writer and any number of readers.
pub struct GenerationHandler {
    current: AtomicU64,
    /// Guard count per pinned generation. Registration and generation bumps
    /// both happen under this lock so a guard can never pin a generation the
    /// writer has already moved past and trimmed.
    readers: Mutex<BTreeMap<Generation, usize>>,
}

impl GenerationHandler {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            readers: Mutex::new(BTreeMap::new()),
        }
    }

    /// The generation new guards will pin.
    pub fn current_generation(&self) -> Generation {
        self.current.load(Ordering::Acquire)
    }

    /// Advance to the next generation. Writer only.
    pub fn inc_generation(&self) -> Generation {
        let _readers = self.readers.lock();
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The oldest generation any live guard may still observe.
    ///
    /// Equals the current generation when no guards are held.
    pub fn oldest_used_generation(&self) -> Generation {
        let readers = self.readers.lock();
        readers
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current.load(Ordering::Acquire))
    }

    /// Pin the current generation for the lifetime of the returned guard.
    pub fn take_guard(self: &Arc<Self>) -> GenerationGuard {
        let generation = {
            let mut readers = self.readers.lock();
            let generation = self.current.load(Ordering::Acquire);
            *readers.entry(generation).or_insert(0) += 1;
            generation
        };
        GenerationGuard {
            handler: Arc::clone(self),
            generation,
        }
    }

    /// Total number of outstanding guards.
    pub fn guard_count(&self) -> usize {
        self.readers.lock().values().sum()
    }

    /// Number of outstanding guards pinning `generation`.
    pub fn generation_ref_count(&self, generation: Generation) -> usize {
        self.readers
            .lock()
            .get(&generation)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, generation: Generation) {
        let mut readers = self.readers.lock();
        match readers.get_mut(&generation) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                readers.remove(&generation);
            }
            None => panic!("released unpinned generation {generation}"),
        }
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GenerationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationHandler")
            .field("current", &self.current_generation())
            .field("guards", &self.guard_count())
            .finish()
    }
}

/// RAII pin on a generation. Dropping the guard releases the pin.
pub struct GenerationGuard {
    handler: Arc<GenerationHandler>,
    generation: Generation,
}

impl GenerationGuard {
    /// The pinned generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn belongs_to(&self, handler: &Arc<GenerationHandler>) -> bool {
        Arc::ptr_eq(&self.handler, handler)
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.handler.release(self.generation);
    }
}

impl fmt::Debug for GenerationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationGuard")
            .field("generation", &self.generation)
            .finish()
    }
}
