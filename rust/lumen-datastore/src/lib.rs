//! Lumen datastore: compact storage for many small variable-length arrays.
//!
//! Arrays are packed into size-classed buffers and addressed by 32-bit
//! [`EntryRef`] handles. A single writer mutates the store while any number
//! of readers look up arrays without locking; freed memory is reclaimed
//! through generation-stamped hold lists once no reader can observe it, and
//! buffers full of dead data can be compacted online.
#![warn(clippy::all)]

pub mod array_store;
pub mod buffer_state;
pub mod buffer_type;
pub mod compaction;
pub mod config;
pub mod datastore;
pub mod entry_ref;
pub mod error;
pub mod generation;
pub mod memory_usage;
mod raw_buffer;

pub use array_store::{ArrayStore, ArrayStoreReader, LARGE_ARRAY_TYPE_ID};
pub use buffer_state::{BufferStats, BufferStatus};
pub use buffer_type::{BufferKind, BufferTypeConfig};
pub use compaction::CompactionContext;
pub use config::ArrayStoreConfig;
pub use datastore::DataStore;
pub use entry_ref::{AtomicEntryRef, DefaultRefType, EntryRef, EntryRefT, RefType};
pub use error::ConfigError;
pub use generation::{Generation, GenerationGuard, GenerationHandler};
pub use memory_usage::{AddressSpace, MemoryUsage};
