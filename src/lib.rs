#![cfg_attr(feature = "nightly", feature(core_intrinsics))]
//! Chained hash tables laid out inside a single relocatable region, plus
//! per-thread append lists that merge into one array and optionally index it.

pub mod append;
pub mod array_index;
pub mod error;
pub mod hashing;
pub mod layout;
pub mod merge;
pub mod multi;
pub mod pool;
mod raw;
pub mod region;
pub mod table;

pub use append::{AppendListConfig, ChunkRange, PerThreadAppendList, ThreadWriter, WriteSession};
pub use array_index::{ArrayHashIndex, DerivedIndex, IndexedView, Keyed};
pub use error::{Error, Result};
pub use hashing::FixedState;
pub use merge::{
    MergeConfig, merge, merge_chunks_in_order, merge_parallel, merge_parallel_with_index,
    merge_serial, merge_serial_with_index, merge_with_index,
};
pub use multi::{MultiCursor, MultiValueChainedHashTable};
pub use pool::{ScopedPool, WorkerPool};
pub use region::{AlignedRegion, GrowableRegion};
pub use table::ChainedHashTable;
