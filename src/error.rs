//! Error types for tables, append lists and merges.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("cannot shrink capacity from {current} to {requested}")]
    ShrinkNotSupported { current: usize, requested: usize },

    #[error("capacity {requested} x {element_size} bytes exceeds the addressable region size")]
    CapacityExceeded { requested: usize, element_size: usize },

    #[error("slot {index} was reached through a chain but never allocated (allocated length {allocated})")]
    UninitializedIndex { index: i32, allocated: i32 },

    #[error("chain pointer {index} outside [0, {capacity})")]
    OutOfRangeChainPointer { index: i32, capacity: i32 },

    #[error("region does not hold a valid table: {0}")]
    InvalidRegion(&'static str),

    #[error("reservation [{start}, {start}+{len}) overflows destination capacity {capacity}")]
    ReservationOverflow {
        start: usize,
        len: usize,
        capacity: usize,
    },

    #[error("thread index {index} out of range for {count} segments")]
    ThreadIndexOutOfRange { index: usize, count: usize },

    #[error("segment {0} already has an active writer")]
    SegmentInUse(usize),

    #[error("chunk {chunk} out of range for {count} chunks")]
    ChunkOutOfRange { chunk: usize, count: usize },

    #[error("write session has no chunk table")]
    NoChunkTable,

    #[error("no chunk is open on this writer")]
    ChunkNotOpen,

    #[error("chunk {0} is still open on this writer")]
    ChunkAlreadyOpen(usize),
}

impl Error {
    /// Invariant violations: the backing memory can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UninitializedIndex { .. }
                | Error::OutOfRangeChainPointer { .. }
                | Error::InvalidRegion(_)
                | Error::ReservationOverflow { .. }
        )
    }
}

/// Abort on a corrupted structure: log, then panic with the same message.
#[cold]
#[track_caller]
pub(crate) fn fatal(err: Error) -> ! {
    tracing::error!(error = %err, "invariant violation");
    panic!("{err}");
}
