//! Hash index over a flat record array.
//!
//! The index owns only `buckets` and `next`; keys are read from the records
//! it was built over. Slot `i` of the index is element `i` of that array, so
//! the index must be rebuilt whenever the array is reordered.
//!
//! Parallel building prepends to bucket heads with a CAS loop. Each worker
//! only writes `next` entries inside its own slot range, but bucket heads are
//! shared by every worker.

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};
use crate::hashing::FixedState;
use crate::layout::{MAX_KEY_CAPACITY, NONE, bucket_capacity_for};

/// A record that carries its own lookup key.
pub trait Keyed {
    type Key: Copy + Eq + Hash;

    fn key(&self) -> Self::Key;
}

impl<K: Copy + Eq + Hash, V> Keyed for (K, V) {
    type Key = K;

    #[inline]
    fn key(&self) -> K {
        self.0
    }
}

/// An index derived from a record array, built during merges.
pub trait DerivedIndex<T: Keyed>: Sync {
    /// Size the index for `capacity` slots and forget everything indexed.
    fn set_capacity(&mut self, capacity: usize) -> Result<()>;

    /// Rebuild the index over `records`, slot `i` being `records[i]`.
    fn calculate_buckets(&mut self, records: &[T]) -> Result<()>;

    /// Index `records` as slots `first_slot..first_slot + records.len()`.
    ///
    /// Safe to call concurrently as long as the slot ranges passed by
    /// different callers are disjoint.
    fn calculate_buckets_parallel(&self, records: &[T], first_slot: usize) -> Result<()>;
}

pub struct ArrayHashIndex<K, S = FixedState> {
    buckets: Box<[AtomicI32]>,
    next: Box<[AtomicI32]>,
    hasher: S,
    _key: PhantomData<fn() -> K>,
}

fn atomics(len: usize) -> Box<[AtomicI32]> {
    (0..len).map(|_| AtomicI32::new(NONE)).collect()
}

impl<K: Copy + Eq + Hash> ArrayHashIndex<K> {
    pub fn new() -> Self {
        Self::with_hasher(FixedState)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut index = Self::new();
        index.resize(capacity)?;
        Ok(index)
    }
}

impl<K: Copy + Eq + Hash> Default for ArrayHashIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> ArrayHashIndex<K, S>
where
    K: Copy + Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            buckets: Box::new([]),
            next: Box::new([]),
            hasher,
            _key: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    pub fn bucket_capacity(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket_of(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize & (self.buckets.len() - 1)
    }

    fn resize(&mut self, capacity: usize) -> Result<()> {
        if capacity > MAX_KEY_CAPACITY {
            return Err(Error::CapacityExceeded {
                requested: capacity,
                element_size: size_of::<AtomicI32>(),
            });
        }
        if capacity != self.next.len() || self.buckets.is_empty() {
            self.next = atomics(capacity);
            self.buckets = atomics(bucket_capacity_for(capacity));
        } else {
            self.reset();
        }
        Ok(())
    }

    fn reset(&mut self) {
        for head in self.buckets.iter_mut() {
            *head.get_mut() = NONE;
        }
        for link in self.next.iter_mut() {
            *link.get_mut() = NONE;
        }
    }

    /// Lock-free prepend of `slot` onto its key's bucket chain.
    #[inline]
    fn link(&self, key: &K, slot: i32) {
        let head = &self.buckets[self.bucket_of(key)];
        let link = &self.next[slot as usize];
        let mut old = head.load(Ordering::Acquire);
        loop {
            link.store(old, Ordering::Relaxed);
            match head.compare_exchange_weak(old, slot, Ordering::Release, Ordering::Acquire) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
    }

    /// Bind the index to the records it was built over.
    pub fn view<'a, T>(&'a self, records: &'a [T]) -> IndexedView<'a, T, K, S>
    where
        T: Keyed<Key = K>,
    {
        IndexedView {
            index: self,
            records,
        }
    }
}

impl<T, S> DerivedIndex<T> for ArrayHashIndex<T::Key, S>
where
    T: Keyed,
    S: BuildHasher + Sync,
{
    fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.resize(capacity)
    }

    fn calculate_buckets(&mut self, records: &[T]) -> Result<()> {
        self.resize(records.len().max(self.capacity()))?;
        for (slot, record) in records.iter().enumerate() {
            self.link(&record.key(), slot as i32);
        }
        Ok(())
    }

    fn calculate_buckets_parallel(&self, records: &[T], first_slot: usize) -> Result<()> {
        let end = first_slot.checked_add(records.len());
        if end.is_none_or(|end| end > self.capacity()) {
            let err = Error::ReservationOverflow {
                start: first_slot,
                len: records.len(),
                capacity: self.capacity(),
            };
            tracing::error!(%err, "index build outside reserved capacity");
            return Err(err);
        }
        for (i, record) in records.iter().enumerate() {
            self.link(&record.key(), (first_slot + i) as i32);
        }
        Ok(())
    }
}

impl<K, S> fmt::Debug for ArrayHashIndex<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayHashIndex")
            .field("capacity", &self.next.len())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

/// An index paired with its backing records.
pub struct IndexedView<'a, T, K, S = FixedState> {
    index: &'a ArrayHashIndex<K, S>,
    records: &'a [T],
}

impl<'a, T, K, S> IndexedView<'a, T, K, S>
where
    T: Keyed<Key = K>,
    K: Copy + Eq + Hash,
    S: BuildHasher,
{
    fn head(&self, key: &K) -> i32 {
        if self.index.buckets.is_empty() {
            return NONE;
        }
        self.index.buckets[self.index.bucket_of(key)].load(Ordering::Acquire)
    }

    /// Most recently indexed record with `key`.
    pub fn get(&self, key: &K) -> Option<&'a T> {
        self.get_all(key).next()
    }

    /// Every record with `key`, most recently indexed first.
    pub fn get_all(&self, key: &K) -> Matches<'a, T, K, S> {
        Matches {
            index: self.index,
            records: self.records,
            key: *key,
            slot: self.head(key),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn records(&self) -> &'a [T] {
        self.records
    }
}

pub struct Matches<'a, T, K, S> {
    index: &'a ArrayHashIndex<K, S>,
    records: &'a [T],
    key: K,
    slot: i32,
}

impl<'a, T, K, S> Iterator for Matches<'a, T, K, S>
where
    T: Keyed<Key = K>,
    K: Copy + Eq + Hash,
{
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        while self.slot >= 0 {
            let slot = self.slot as usize;
            // Slots past the bound records end the chain.
            let record = self.records.get(slot)?;
            self.slot = self.index.next.get(slot)?.load(Ordering::Acquire);
            if record.key() == self.key {
                return Some(record);
            }
        }
        None
    }
}
