//! Chained hash table living inside a single relocatable region.
//!
//! Keys are unique. Slots are handed out from an intrusive free list first,
//! then by bumping the high-water mark; when neither has room the whole
//! region is regrown to double capacity and every occupied slot is
//! re-bucketed. Slot indices never change, capacity never shrinks.
//!
//! A table has a single writer. Iterators borrow the table, so it cannot be
//! mutated (or grown) while one is alive.

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::Index;

use crate::error::{Error, Result};
use crate::hashing::FixedState;
use crate::layout::NONE;
use crate::raw::{RawTable, SlotIter};
use crate::region::{AlignedRegion, GrowableRegion};

pub struct ChainedHashTable<K, V, R = AlignedRegion, S = FixedState> {
    raw: RawTable<K, V, R, S>,
}

impl<K, V> ChainedHashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// An empty table. Nothing is allocated until the first insert.
    pub fn new() -> Self {
        Self::with_hasher(FixedState)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut table = Self::new();
        table.set_capacity(capacity)?;
        Ok(table)
    }
}

impl<K, V> Default for ChainedHashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ChainedHashTable<K, V, AlignedRegion, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: RawTable::new(AlignedRegion::new(), hasher),
        }
    }
}

impl<K, V, R, S> ChainedHashTable<K, V, R, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    R: GrowableRegion,
    S: BuildHasher,
{
    /// Open a table over a host-owned region. An empty region starts an empty
    /// table; a non-empty one must have been written by a table with the same
    /// key/value types and hasher.
    pub fn from_region(region: R, hasher: S) -> Result<Self> {
        Ok(Self {
            raw: RawTable::from_region(region, hasher)?,
        })
    }

    /// Hand the region back to its owner.
    pub fn into_region(self) -> R {
        self.raw.into_region()
    }

    pub fn region(&self) -> &R {
        self.raw.region()
    }

    pub fn hasher(&self) -> &S {
        self.raw.hasher()
    }

    /// Insert `key` unless it is already present. Returns whether it was inserted.
    pub fn try_add(&mut self, key: K, value: V) -> Result<bool> {
        if self.raw.find(&key) != NONE {
            return Ok(false);
        }
        self.raw.insert_unchecked(key, value)?;
        Ok(true)
    }

    /// Like [`try_add`](Self::try_add) but ignores duplicates.
    pub fn add(&mut self, key: K, value: V) -> Result<()> {
        self.try_add(key, value).map(|_| ())
    }

    /// Insert or overwrite.
    pub fn set(&mut self, key: K, value: V) -> Result<()> {
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => {
                self.raw.insert_unchecked(key, value)?;
            }
        }
        Ok(())
    }

    /// Remove `key`. Returns the number of entries removed (0 or 1).
    pub fn remove(&mut self, key: &K) -> usize {
        self.raw.remove_where(key, |_| false, true)
    }

    pub fn try_get_value(&self, key: &K) -> Option<&V> {
        let h = self.raw.header()?;
        match self.raw.find(key) {
            NONE => None,
            slot => Some(self.raw.value_at(&h, slot)),
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let h = self.raw.header()?;
        match self.raw.find(key) {
            NONE => None,
            slot => Some(self.raw.value_at_mut(&h, slot)),
        }
    }

    /// Read indexer.
    pub fn value(&self, key: &K) -> Result<V> {
        self.try_get_value(key).copied().ok_or(Error::KeyNotFound)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.raw.find(key) != NONE
    }

    /// Walks the free list, so this is O(free slots).
    pub fn count(&self) -> usize {
        self.raw.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Grow to `capacity` slots. Shrinking fails with `ShrinkNotSupported`
    /// and leaves the table untouched.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.raw.set_capacity(capacity)
    }

    /// Make room for `additional` more entries without further growth.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self.count().saturating_add(additional);
        if needed > self.capacity() {
            self.raw.set_capacity(needed)?;
        }
        Ok(())
    }

    pub fn bucket_capacity(&self) -> usize {
        self.raw.header().map_or(0, |h| h.bucket_capacity())
    }

    /// High-water mark of slots ever handed out.
    pub fn allocated_index_length(&self) -> usize {
        self.raw.header().map_or(0, |h| h.allocated_index_length as usize)
    }

    /// Drop every entry; keeps the region at its current size.
    pub fn clear(&mut self) {
        self.raw.clear();
    }

    pub fn iter(&self) -> Iter<'_, K, V, R, S> {
        Iter {
            inner: self.raw.iter(),
        }
    }

    /// Keys in bucket order.
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| *k).collect()
    }

    /// Values in bucket order.
    pub fn values(&self) -> Vec<V> {
        self.iter().map(|(_, v)| *v).collect()
    }

    /// Parallel key and value arrays in bucket order.
    pub fn key_value_arrays(&self) -> (Vec<K>, Vec<V>) {
        self.iter().map(|(k, v)| (*k, *v)).unzip()
    }

    pub fn validate(&self) -> Result<()> {
        self.raw.validate()
    }
}

/// Forward-only iterator in bucket-then-chain order.
pub struct Iter<'a, K, V, R, S> {
    pub(crate) inner: SlotIter<'a, K, V, R, S>,
}

impl<'a, K, V, R, S> Iterator for Iter<'a, K, V, R, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    R: GrowableRegion,
    S: BuildHasher,
{
    type Item = (&'a K, &'a V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl<'a, K, V, R, S> IntoIterator for &'a ChainedHashTable<K, V, R, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    R: GrowableRegion,
    S: BuildHasher,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, R, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, R, S> Index<&K> for ChainedHashTable<K, V, R, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    R: GrowableRegion,
    S: BuildHasher,
{
    type Output = V;

    /// Panics with `KeyNotFound` if `key` is absent.
    fn index(&self, key: &K) -> &V {
        match self.try_get_value(key) {
            Some(v) => v,
            None => panic!("{}", Error::KeyNotFound),
        }
    }
}

impl<K, V, R, S> fmt::Debug for ChainedHashTable<K, V, R, S>
where
    K: Copy + Eq + Hash + fmt::Debug,
    V: Copy + fmt::Debug,
    R: GrowableRegion,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
