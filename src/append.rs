//! Per-thread append lists.
//!
//! One growable segment per worker, each on its own cache line so length
//! updates from different threads never contend. Writers only ever touch
//! their own segment, so the write path needs no synchronization beyond
//! claiming the segment once.
//!
//! ```text
//!  PerThreadAppendList
//!  ┌──────────────────┬──────────────────┬─────┬──────────────────┐
//!  │ segment 0 (64 B) │ segment 1 (64 B) │ ... │ segment N-1      │   headers
//!  └────────┬─────────┴────────┬─────────┴─────┴────────┬─────────┘
//!           ▼                  ▼                        ▼
//!        [T; len0]          [T; len1]                [T; lenN-1]      heap
//!
//!  range table (chunked writes): chunk c -> { list_index, start, count }
//! ```
//!
//! Writes happen inside a [`WriteSession`], which mutably borrows the list.
//! Readers need `&self`, so the borrow checker is the barrier between the
//! producer phase and the merge phase.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::pool::WorkerPool;

const DEFAULT_INITIAL_CAPACITY: usize = 64;

/// Marks a range-table entry no writer has recorded.
const UNSET: usize = usize::MAX;

pub struct AppendListConfig {
    pub segment_count: usize,
    pub initial_capacity: usize,
}

impl AppendListConfig {
    pub fn new(segment_count: usize) -> Self {
        Self {
            segment_count: segment_count.max(1),
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }

    /// One segment per worker in `pool`.
    pub fn from_pool(pool: &impl WorkerPool) -> Self {
        Self::new(pool.worker_count())
    }

    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity.max(1);
        self
    }
}

#[repr(C, align(64))]
struct Segment<T> {
    claimed: AtomicBool,
    items: UnsafeCell<Vec<T>>,
}

impl<T> Segment<T> {
    fn new(capacity: usize) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            items: UnsafeCell::new(Vec::with_capacity(capacity)),
        }
    }
}

/// Where one chunk's writes landed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub list_index: usize,
    pub start: usize,
    pub count: usize,
}

#[derive(Debug)]
struct RangeCell {
    list_index: AtomicUsize,
    start: AtomicUsize,
    count: AtomicUsize,
}

impl RangeCell {
    fn new() -> Self {
        Self {
            list_index: AtomicUsize::new(UNSET),
            start: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    fn reset(&mut self) {
        *self.list_index.get_mut() = UNSET;
        *self.start.get_mut() = 0;
        *self.count.get_mut() = 0;
    }

    fn record(&self, range: ChunkRange) {
        self.start.store(range.start, Ordering::Relaxed);
        self.count.store(range.count, Ordering::Relaxed);
        self.list_index.store(range.list_index, Ordering::Release);
    }

    fn load(&self) -> Option<ChunkRange> {
        match self.list_index.load(Ordering::Acquire) {
            UNSET => None,
            list_index => Some(ChunkRange {
                list_index,
                start: self.start.load(Ordering::Relaxed),
                count: self.count.load(Ordering::Relaxed),
            }),
        }
    }
}

pub struct PerThreadAppendList<T> {
    segments: Box<[Segment<T>]>,
    ranges: Box<[RangeCell]>,
    initial_capacity: usize,
}

// SAFETY: a segment's Vec is only mutated through a `ThreadWriter`, which
// holds the segment's claim flag exclusively, or through `&mut self`.
// Shared readers only exist while no `WriteSession` (and so no writer) does.
// Writers move `T` into the list from other threads and readers hand out `&T`
// to every thread, so both bounds are needed.
unsafe impl<T: Send + Sync> Sync for PerThreadAppendList<T> {}

impl<T> PerThreadAppendList<T> {
    pub fn new(config: &AppendListConfig) -> Self {
        let segment_count = config.segment_count.max(1);
        Self {
            segments: (0..segment_count)
                .map(|_| Segment::new(config.initial_capacity))
                .collect(),
            ranges: Box::new([]),
            initial_capacity: config.initial_capacity.max(1),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.segments.len() {
            return Err(Error::ThreadIndexOutOfRange {
                index,
                count: self.segments.len(),
            });
        }
        Ok(())
    }

    /// Single-threaded append into `thread_index`'s segment.
    pub fn write(&mut self, thread_index: usize, value: T) -> Result<()> {
        self.check_index(thread_index)?;
        let initial = self.initial_capacity;
        push_doubling(self.segments[thread_index].items.get_mut(), initial, value);
        Ok(())
    }

    /// Open a producer phase. Writers are handed out per thread index.
    pub fn begin_writes(&mut self) -> WriteSession<'_, T> {
        WriteSession {
            list: self,
            chunked: false,
        }
    }

    /// Open a producer phase that also records, per chunk, which segment
    /// slice the chunk's writes landed in. The range table is cleared, and
    /// reallocated if the chunk count changed.
    pub fn begin_for_each_chunk(&mut self, chunk_count: usize) -> WriteSession<'_, T> {
        if self.ranges.len() == chunk_count {
            self.ranges.iter_mut().for_each(RangeCell::reset);
        } else {
            self.ranges = (0..chunk_count).map(|_| RangeCell::new()).collect();
        }
        WriteSession {
            list: self,
            chunked: true,
        }
    }

    /// Close a chunked producer phase.
    pub fn end_for_each_chunk(session: WriteSession<'_, T>) {
        let recorded = session.list.ranges.iter().filter(|r| r.load().is_some()).count();
        tracing::debug!(
            chunks = session.list.ranges.len(),
            recorded,
            "closed chunked write session"
        );
    }

    /// Total elements across all segments.
    pub fn len(&self) -> usize {
        self.segments().map(<[T]>::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_len(&self, thread_index: usize) -> Result<usize> {
        Ok(self.segment(thread_index)?.len())
    }

    /// One thread's writes, in write order.
    pub fn segment(&self, thread_index: usize) -> Result<&[T]> {
        self.check_index(thread_index)?;
        Ok(self.slice(thread_index))
    }

    #[inline]
    fn slice(&self, index: usize) -> &[T] {
        // SAFETY: `&self` excludes any live WriteSession; see the Sync impl.
        unsafe { &*self.segments[index].items.get() }
    }

    /// Every segment in thread-index order.
    pub fn segments(&self) -> impl ExactSizeIterator<Item = &[T]> {
        (0..self.segments.len()).map(|i| self.slice(i))
    }

    /// All elements, thread 0 first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.segments().flatten()
    }

    pub fn thread_reader(&self, thread_index: usize) -> Result<ThreadReader<'_, T>> {
        Ok(ThreadReader {
            items: self.segment(thread_index)?.iter(),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.ranges.len()
    }

    /// Where chunk `chunk` was written, `None` if nobody wrote it.
    pub fn chunk_range(&self, chunk: usize) -> Result<Option<ChunkRange>> {
        let cell = self.ranges.get(chunk).ok_or(Error::ChunkOutOfRange {
            chunk,
            count: self.ranges.len(),
        })?;
        Ok(cell.load())
    }

    /// Replay one chunk's writes, whichever thread produced them.
    pub fn chunk_reader(&self, chunk: usize) -> Result<ChunkReader<'_, T>> {
        let range = self.chunk_range(chunk)?;
        let items: &[T] = match range {
            Some(r) => {
                let segment = self.segment(r.list_index)?;
                segment.get(r.start..r.start + r.count).ok_or(Error::ChunkOutOfRange {
                    chunk,
                    count: self.ranges.len(),
                })?
            }
            None => &[],
        };
        Ok(ChunkReader {
            range,
            items: items.iter(),
        })
    }

    /// Empty every segment, keeping allocations. Forgets recorded chunks.
    pub fn clear(&mut self) {
        for segment in self.segments.iter_mut() {
            segment.items.get_mut().clear();
        }
        self.ranges.iter_mut().for_each(RangeCell::reset);
    }
}

impl<T> fmt::Debug for PerThreadAppendList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerThreadAppendList")
            .field("segments", &self.segment_count())
            .field("len", &self.len())
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

/// Amortized doubling append, starting from `initial` slots.
#[inline]
fn push_doubling<T>(items: &mut Vec<T>, initial: usize, value: T) {
    if items.len() == items.capacity() {
        items.reserve_exact(items.capacity().max(initial));
    }
    items.push(value);
}

/// A producer phase over a list. Dropping it ends the phase.
pub struct WriteSession<'a, T> {
    list: &'a PerThreadAppendList<T>,
    chunked: bool,
}

impl<'a, T> WriteSession<'a, T> {
    /// Claim `thread_index`'s segment. Fails if it is out of range or already
    /// claimed by a live writer.
    pub fn writer(&self, thread_index: usize) -> Result<ThreadWriter<'_, T>> {
        self.list.check_index(thread_index)?;
        let segment = &self.list.segments[thread_index];
        if segment.claimed.swap(true, Ordering::Acquire) {
            return Err(Error::SegmentInUse(thread_index));
        }
        Ok(ThreadWriter {
            segment,
            index: thread_index,
            initial_capacity: self.list.initial_capacity,
            ranges: self.chunked.then_some(&*self.list.ranges),
            open: None,
        })
    }

    /// Writer for the calling worker of `pool`.
    pub fn current_writer(&self, pool: &impl WorkerPool) -> Result<ThreadWriter<'_, T>> {
        let index = pool.current_worker_index().ok_or(Error::ThreadIndexOutOfRange {
            index: usize::MAX,
            count: self.list.segment_count(),
        })?;
        self.writer(index)
    }

    pub fn segment_count(&self) -> usize {
        self.list.segment_count()
    }

    pub fn chunk_count(&self) -> usize {
        if self.chunked { self.list.ranges.len() } else { 0 }
    }
}

/// Exclusive append handle for one segment.
pub struct ThreadWriter<'s, T> {
    segment: &'s Segment<T>,
    index: usize,
    initial_capacity: usize,
    ranges: Option<&'s [RangeCell]>,
    open: Option<(usize, usize)>,
}

impl<T> ThreadWriter<'_, T> {
    #[inline]
    fn items(&mut self) -> &mut Vec<T> {
        // SAFETY: this writer holds the segment's claim.
        unsafe { &mut *self.segment.items.get() }
    }

    pub fn thread_index(&self) -> usize {
        self.index
    }

    /// Elements in this writer's segment so far.
    pub fn len(&self) -> usize {
        // SAFETY: this writer holds the segment's claim.
        unsafe { (*self.segment.items.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn write(&mut self, value: T) {
        let initial = self.initial_capacity;
        push_doubling(self.items(), initial, value);
    }

    pub fn write_slice(&mut self, values: &[T])
    where
        T: Copy,
    {
        let initial = self.initial_capacity;
        let items = self.items();
        let needed = items.len() + values.len();
        if needed > items.capacity() {
            let target = needed.max(items.capacity() * 2).max(initial);
            items.reserve_exact(target - items.len());
        }
        items.extend_from_slice(values);
    }

    /// Start recording writes for `chunk`.
    pub fn begin_chunk(&mut self, chunk: usize) -> Result<()> {
        let ranges = self.ranges.ok_or(Error::NoChunkTable)?;
        if chunk >= ranges.len() {
            return Err(Error::ChunkOutOfRange {
                chunk,
                count: ranges.len(),
            });
        }
        if let Some((open, _)) = self.open {
            return Err(Error::ChunkAlreadyOpen(open));
        }
        self.open = Some((chunk, self.len()));
        Ok(())
    }

    /// Record everything written since `begin_chunk` as the chunk's range.
    pub fn end_chunk(&mut self) -> Result<ChunkRange> {
        let (chunk, start) = self.open.take().ok_or(Error::ChunkNotOpen)?;
        let range = ChunkRange {
            list_index: self.index,
            start,
            count: self.len() - start,
        };
        if let Some(ranges) = self.ranges {
            ranges[chunk].record(range);
        }
        Ok(range)
    }
}

impl<T> Drop for ThreadWriter<'_, T> {
    fn drop(&mut self) {
        if let Some((chunk, _)) = self.open {
            tracing::warn!(chunk, thread = self.index, "writer dropped with an open chunk");
            let _ = self.end_chunk();
        }
        self.segment.claimed.store(false, Ordering::Release);
    }
}

/// Sequential walk over one thread's segment.
pub struct ThreadReader<'a, T> {
    items: std::slice::Iter<'a, T>,
}

impl<'a, T> ThreadReader<'a, T> {
    pub fn remaining(&self) -> &'a [T] {
        self.items.as_slice()
    }
}

impl<'a, T> Iterator for ThreadReader<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

/// Replay of one chunk's slice.
pub struct ChunkReader<'a, T> {
    range: Option<ChunkRange>,
    items: std::slice::Iter<'a, T>,
}

impl<'a, T> ChunkReader<'a, T> {
    pub fn range(&self) -> Option<ChunkRange> {
        self.range
    }

    pub fn remaining(&self) -> &'a [T] {
        self.items.as_slice()
    }
}

impl<'a, T> Iterator for ChunkReader<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}
