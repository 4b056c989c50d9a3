//! Consolidating per-thread append lists into one array.
//!
//! Parallel merges run in two phases:
//! 1. Prepare (serial): count, reserve the destination once, size the index
//! 2. Copy (parallel): each worker reserves a disjoint output range with a
//!    fetch-add and copies its segments into it
//!
//! The relative order of different threads' records after a parallel merge
//! depends on reservation order. Serial merges are always thread 0 first.

use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error, trace};

use crate::append::PerThreadAppendList;
use crate::array_index::{DerivedIndex, Keyed};
use crate::error::{Error, Result};
use crate::pool::WorkerPool;

const DEFAULT_PARALLEL_THRESHOLD: usize = 16 * 1024;

#[derive(Copy, Clone, Debug)]
pub struct MergeConfig {
    /// Smallest total element count merged in parallel.
    pub parallel_threshold: usize,
}

impl MergeConfig {
    pub fn new(parallel_threshold: usize) -> Self {
        Self { parallel_threshold }
    }

    /// Always merge serially.
    pub fn serial() -> Self {
        Self::new(usize::MAX)
    }

    fn wants_parallel(&self, total: usize, pool: &impl WorkerPool) -> bool {
        pool.worker_count() > 1 && total >= self.parallel_threshold
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_THRESHOLD)
    }
}

/// Shared output cursor handing out disjoint ranges of `[start, limit)`.
#[derive(Debug)]
pub struct Reservations {
    next: AtomicUsize,
    limit: usize,
}

impl Reservations {
    pub fn new(start: usize, limit: usize) -> Self {
        Self {
            next: AtomicUsize::new(start),
            limit,
        }
    }

    /// Claim the next `len` indices.
    pub fn reserve(&self, len: usize) -> Result<Range<usize>> {
        let start = self.next.fetch_add(len, Ordering::Relaxed);
        match start.checked_add(len) {
            Some(end) if end <= self.limit => Ok(start..end),
            _ => Err(Error::ReservationOverflow {
                start,
                len,
                capacity: self.limit,
            }),
        }
    }

    /// End of everything handed out so far.
    pub fn reserved(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Wrapper to send raw pointers across thread boundaries.
///
/// Safety: callers must ensure threads write to disjoint memory regions.
#[derive(Copy, Clone)]
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline(always)]
    fn get(self) -> *mut T {
        self.0
    }
}

/// Append every segment to `dest` in thread-index order. Returns the number
/// of elements appended.
pub fn merge_serial<T: Copy>(list: &PerThreadAppendList<T>, dest: &mut Vec<T>) -> usize {
    let total = list.len();
    dest.reserve_exact(total);
    for segment in list.segments() {
        dest.extend_from_slice(segment);
    }
    debug!(total, len = dest.len(), "serial merge done");
    total
}

/// Append every recorded chunk to `dest` in chunk order, whichever thread
/// wrote it. Writes made outside a chunk are not included.
pub fn merge_chunks_in_order<T: Copy>(
    list: &PerThreadAppendList<T>,
    dest: &mut Vec<T>,
) -> Result<usize> {
    if list.chunk_count() == 0 {
        return if list.is_empty() {
            Ok(0)
        } else {
            Err(Error::NoChunkTable)
        };
    }

    let mut readers = Vec::with_capacity(list.chunk_count());
    for chunk in 0..list.chunk_count() {
        readers.push(list.chunk_reader(chunk)?);
    }
    let total: usize = readers.iter().map(|r| r.remaining().len()).sum();
    dest.reserve_exact(total);
    for reader in &readers {
        dest.extend_from_slice(reader.remaining());
    }
    debug!(chunks = readers.len(), total, "chunk-order merge done");
    Ok(total)
}

/// Append every segment to `dest` using all workers of `pool`.
///
/// On error nothing is appended.
pub fn merge_parallel<T, P>(
    list: &PerThreadAppendList<T>,
    dest: &mut Vec<T>,
    pool: &P,
) -> Result<usize>
where
    T: Copy + Send + Sync,
    P: WorkerPool,
{
    parallel(list, dest, pool, |_, _| Ok(()))
}

/// Serial merge, then rebuild `index` over the whole of `dest`.
pub fn merge_serial_with_index<T, I>(
    list: &PerThreadAppendList<T>,
    dest: &mut Vec<T>,
    index: &mut I,
) -> Result<usize>
where
    T: Copy + Keyed,
    I: DerivedIndex<T>,
{
    let total = merge_serial(list, dest);
    index.set_capacity(dest.len())?;
    index.calculate_buckets(&dest[..])?;
    Ok(total)
}

/// Parallel merge that also indexes each copied range into `index` at its
/// final position. Records already in `dest` are indexed during prepare.
pub fn merge_parallel_with_index<T, I, P>(
    list: &PerThreadAppendList<T>,
    dest: &mut Vec<T>,
    index: &mut I,
    pool: &P,
) -> Result<usize>
where
    T: Copy + Send + Sync + Keyed,
    I: DerivedIndex<T>,
    P: WorkerPool,
{
    index.set_capacity(dest.len() + list.len())?;
    index.calculate_buckets(&dest[..])?;
    let index = &*index;
    parallel(list, dest, pool, |segment, start| {
        index.calculate_buckets_parallel(segment, start)
    })
}

/// Serial or parallel merge, picked by `config`.
pub fn merge<T, P>(
    list: &PerThreadAppendList<T>,
    dest: &mut Vec<T>,
    pool: &P,
    config: &MergeConfig,
) -> Result<usize>
where
    T: Copy + Send + Sync,
    P: WorkerPool,
{
    if config.wants_parallel(list.len(), pool) {
        merge_parallel(list, dest, pool)
    } else {
        Ok(merge_serial(list, dest))
    }
}

/// Serial or parallel merge with index build, picked by `config`.
pub fn merge_with_index<T, I, P>(
    list: &PerThreadAppendList<T>,
    dest: &mut Vec<T>,
    index: &mut I,
    pool: &P,
    config: &MergeConfig,
) -> Result<usize>
where
    T: Copy + Send + Sync + Keyed,
    I: DerivedIndex<T>,
    P: WorkerPool,
{
    if config.wants_parallel(list.len(), pool) {
        merge_parallel_with_index(list, dest, index, pool)
    } else {
        merge_serial_with_index(list, dest, index)
    }
}

fn parallel<T, P, F>(
    list: &PerThreadAppendList<T>,
    dest: &mut Vec<T>,
    pool: &P,
    on_copied: F,
) -> Result<usize>
where
    T: Copy + Send + Sync,
    P: WorkerPool,
    F: Fn(&[T], usize) -> Result<()> + Sync,
{
    // Phase 1: Prepare
    let total = list.len();
    let start = dest.len();
    dest.reserve_exact(total);
    let reservations = Reservations::new(start, start + total);
    let out = SendPtr(dest.as_mut_ptr());
    let segments = list.segment_count();
    let workers = pool.worker_count();
    debug!(total, start, segments, workers, "parallel merge prepared");

    // Phase 2: Reserve and copy
    let results = pool.broadcast(|worker| -> Result<usize> {
        let mut copied = 0;
        for index in (worker..segments).step_by(workers) {
            let segment = list.segment(index)?;
            if segment.is_empty() {
                continue;
            }
            let range = reservations.reserve(segment.len())?;
            trace!(worker, segment = index, start = range.start, len = segment.len(), "reserved");
            // SAFETY: `range` lies inside the capacity reserved above and no
            // other worker was handed any part of it.
            unsafe {
                ptr::copy_nonoverlapping(segment.as_ptr(), out.get().add(range.start), segment.len());
            }
            on_copied(segment, range.start)?;
            copied += segment.len();
        }
        Ok(copied)
    });

    let mut copied = 0;
    for result in results {
        match result {
            Ok(n) => copied += n,
            Err(err) => {
                error!(%err, "parallel merge aborted");
                return Err(err);
            }
        }
    }
    // A pool that skipped a worker would leave part of the range unwritten.
    assert_eq!(copied, total, "worker pool did not run every worker");
    debug_assert_eq!(reservations.reserved(), reservations.limit());

    // SAFETY: every index in `start..start + total` was written exactly once.
    unsafe { dest.set_len(start + total) };
    debug!(total, len = dest.len(), "parallel merge done");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use shuttle::thread;

    use super::*;
    use crate::append::AppendListConfig;
    use crate::array_index::ArrayHashIndex;
    use crate::pool::ScopedPool;

    /// Fills `segments` segments with uneven, globally unique values.
    fn filled(segments: usize, seed: u64) -> (PerThreadAppendList<(u64, u64)>, usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut list = PerThreadAppendList::new(&AppendListConfig::new(segments));
        let mut next = 0u64;
        for t in 0..segments {
            for _ in 0..rng.random_range(0..2_000) {
                list.write(t, (next, t as u64)).unwrap();
                next += 1;
            }
        }
        (list, next as usize)
    }

    #[test]
    fn serial_merge_is_thread_ordered() {
        let mut list = PerThreadAppendList::new(&AppendListConfig::new(3));
        list.write(2, 20u32).unwrap();
        list.write(0, 1).unwrap();
        list.write(1, 10).unwrap();
        list.write(0, 2).unwrap();
        let mut dest = vec![99];
        assert_eq!(merge_serial(&list, &mut dest), 4);
        assert_eq!(dest, vec![99, 1, 2, 10, 20]);
    }

    #[test]
    fn per_thread_writes_then_serial_merge() {
        let mut list = PerThreadAppendList::new(&AppendListConfig::new(8));
        {
            let session = list.begin_writes();
            std::thread::scope(|s| {
                for t in 0..8 {
                    let session = &session;
                    s.spawn(move || {
                        let mut w = session.writer(t).unwrap();
                        for i in 0..1_000u32 {
                            w.write(i);
                        }
                    });
                }
            });
        }
        let mut dest = Vec::new();
        assert_eq!(merge_serial(&list, &mut dest), 8_000);
        assert_eq!(dest.len(), 8_000);
    }

    #[test]
    fn parallel_merge_copies_each_element_once() {
        for (workers, segments) in [(1, 1), (4, 8), (8, 3), (3, 16)] {
            let (list, total) = filled(segments, workers as u64);
            let mut dest = Vec::new();
            let pool = ScopedPool::new(workers);
            assert_eq!(merge_parallel(&list, &mut dest, &pool).unwrap(), total);
            assert_eq!(dest.len(), total);
            let mut keys: Vec<u64> = dest.iter().map(|r| r.0).collect();
            keys.sort_unstable();
            assert!(keys.iter().copied().eq(0..total as u64));
        }
    }

    #[test]
    fn parallel_merge_keeps_per_thread_order() {
        let (list, _) = filled(6, 7);
        let mut dest = Vec::new();
        merge_parallel(&list, &mut dest, &ScopedPool::new(3)).unwrap();
        for t in 0..6u64 {
            let from_t: Vec<u64> = dest.iter().filter(|r| r.1 == t).map(|r| r.0).collect();
            let want: Vec<u64> = list.segment(t as usize).unwrap().iter().map(|r| r.0).collect();
            assert_eq!(from_t, want);
        }
    }

    #[test]
    fn parallel_merge_appends() {
        let (list, total) = filled(4, 11);
        let mut dest = vec![(u64::MAX, 0); 5];
        merge_parallel(&list, &mut dest, &ScopedPool::new(2)).unwrap();
        assert_eq!(dest.len(), 5 + total);
        assert!(dest[..5].iter().all(|r| r.0 == u64::MAX));
    }

    #[test]
    fn empty_list_merges_nothing() {
        let list: PerThreadAppendList<u8> = PerThreadAppendList::new(&AppendListConfig::new(4));
        let mut dest = Vec::new();
        assert_eq!(merge_parallel(&list, &mut dest, &ScopedPool::new(4)).unwrap(), 0);
        assert_eq!(merge_serial(&list, &mut dest), 0);
        assert_eq!(merge_chunks_in_order(&list, &mut dest), Ok(0));
        assert!(dest.is_empty());
    }

    #[test]
    fn chunk_order_merge() {
        let mut list = PerThreadAppendList::new(&AppendListConfig::new(2));
        {
            let session = list.begin_for_each_chunk(4);
            std::thread::scope(|s| {
                for t in 0..2 {
                    let session = &session;
                    s.spawn(move || {
                        let mut w = session.writer(t).unwrap();
                        // Thread 0 takes odd chunks, thread 1 even ones.
                        for chunk in (0..4).filter(|c| c % 2 != t).rev() {
                            w.begin_chunk(chunk).unwrap();
                            w.write(chunk as u32 * 10);
                            w.write(chunk as u32 * 10 + 1);
                            w.end_chunk().unwrap();
                        }
                    });
                }
            });
        }
        let mut dest = Vec::new();
        assert_eq!(merge_chunks_in_order(&list, &mut dest), Ok(8));
        assert_eq!(dest, vec![0, 1, 10, 11, 20, 21, 30, 31]);
    }

    #[test]
    fn chunk_order_merge_needs_a_table() {
        let mut list = PerThreadAppendList::new(&AppendListConfig::new(1));
        list.write(0, 1u8).unwrap();
        assert_eq!(
            merge_chunks_in_order(&list, &mut Vec::new()),
            Err(Error::NoChunkTable)
        );
    }

    #[test]
    fn merge_with_index_serial_and_parallel() {
        for config in [MergeConfig::serial(), MergeConfig::new(0)] {
            let (list, total) = filled(5, 3);
            let mut dest = vec![(u64::MAX, 42)];
            let mut index: ArrayHashIndex<u64> = ArrayHashIndex::new();
            let pool = ScopedPool::new(4);
            let n = merge_with_index(&list, &mut dest, &mut index, &pool, &config).unwrap();
            assert_eq!(n, total);
            let view = index.view(&dest[..]);
            assert_eq!(view.get(&u64::MAX), Some(&(u64::MAX, 42)));
            for key in 0..total as u64 {
                assert_eq!(view.get(&key).map(|r| r.0), Some(key));
            }
            assert!(!view.contains_key(&(total as u64)));
        }
    }

    #[test]
    fn dispatch_threshold() {
        let pool = ScopedPool::new(4);
        let config = MergeConfig::default();
        assert!(!config.wants_parallel(100, &pool));
        assert!(config.wants_parallel(DEFAULT_PARALLEL_THRESHOLD, &pool));
        assert!(!config.wants_parallel(usize::MAX, &ScopedPool::new(1)));
        assert!(!MergeConfig::serial().wants_parallel(1 << 40, &pool));

        let (list, _) = filled(4, 5);
        let mut shuffled = Vec::new();
        let mut ordered = Vec::new();
        merge(&list, &mut shuffled, &pool, &MergeConfig::new(0)).unwrap();
        merge(&list, &mut ordered, &pool, &MergeConfig::serial()).unwrap();
        shuffled.sort_unstable();
        assert_eq!(shuffled, ordered);
    }

    #[test]
    fn reservation_overflow() {
        let r = Reservations::new(10, 20);
        assert_eq!(r.reserve(6), Ok(10..16));
        assert_eq!(
            r.reserve(5),
            Err(Error::ReservationOverflow {
                start: 16,
                len: 5,
                capacity: 20
            })
        );
        assert!(Error::ReservationOverflow { start: 0, len: 0, capacity: 0 }.is_fatal());
    }

    #[test]
    fn shuttle_reservations_are_disjoint() {
        shuttle::check_random(
            || {
                let reservations = Arc::new(Reservations::new(0, 4 * 10));
                let mut handles = vec![];
                for i in 0..4 {
                    let r = reservations.clone();
                    handles.push(thread::spawn(move || {
                        let mut ranges = vec![];
                        for _ in 0..i + 1 {
                            ranges.push(r.reserve(4 - i).unwrap());
                        }
                        ranges
                    }));
                }
                let mut ranges: Vec<Range<usize>> =
                    handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
                ranges.sort_by_key(|r| r.start);
                let mut expect = 0;
                for range in ranges {
                    assert_eq!(range.start, expect);
                    expect = range.end;
                }
                assert_eq!(expect, reservations.reserved());
                assert_eq!(expect, 4 + 6 + 6 + 4);
            },
            100,
        );
    }
}
