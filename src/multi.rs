//! Multi-value variant of [`ChainedHashTable`](crate::ChainedHashTable).
//!
//! Same region layout and algorithms, but inserts never look for an existing
//! key. All values for a key sit in the key's bucket chain, newest first.

use std::hash::{BuildHasher, Hash};

use crate::error::Result;
use crate::hashing::FixedState;
use crate::layout::NONE;
use crate::raw::RawTable;
use crate::region::{AlignedRegion, GrowableRegion};
use crate::table::Iter;

pub struct MultiValueChainedHashTable<K, V, R = AlignedRegion, S = FixedState> {
    raw: RawTable<K, V, R, S>,
}

/// Continuation token for [`try_get_first`](MultiValueChainedHashTable::try_get_first) /
/// [`try_get_next`](MultiValueChainedHashTable::try_get_next).
///
/// Only meaningful for the table that produced it, and only until that table
/// is next mutated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MultiCursor<K> {
    key: K,
    entry: i32,
    next: i32,
}

impl<K: Copy> MultiCursor<K> {
    pub fn key(&self) -> K {
        self.key
    }
}

impl<K, V> MultiValueChainedHashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    pub fn new() -> Self {
        Self {
            raw: RawTable::new(AlignedRegion::new(), FixedState),
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut table = Self::new();
        table.set_capacity(capacity)?;
        Ok(table)
    }
}

impl<K, V> Default for MultiValueChainedHashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, R, S> MultiValueChainedHashTable<K, V, R, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    R: GrowableRegion,
    S: BuildHasher,
{
    pub fn from_region(region: R, hasher: S) -> Result<Self> {
        Ok(Self {
            raw: RawTable::from_region(region, hasher)?,
        })
    }

    pub fn into_region(self) -> R {
        self.raw.into_region()
    }

    pub fn region(&self) -> &R {
        self.raw.region()
    }

    /// Always inserts; duplicates are allowed. Returns `true` for parity with
    /// the unique-key table.
    pub fn try_add(&mut self, key: K, value: V) -> Result<bool> {
        self.raw.insert_unchecked(key, value)?;
        Ok(true)
    }

    pub fn add(&mut self, key: K, value: V) -> Result<()> {
        self.raw.insert_unchecked(key, value).map(|_| ())
    }

    /// Remove every value stored under `key`.
    pub fn remove(&mut self, key: &K) -> usize {
        self.raw.remove_where(key, |_| false, false)
    }

    /// Remove only the entries whose key and value both match.
    pub fn remove_key_value(&mut self, key: &K, value: &V) -> usize
    where
        V: PartialEq,
    {
        self.raw.remove_where(key, |v| v != value, false)
    }

    /// Most recently inserted value for `key`, plus a cursor to continue from.
    pub fn try_get_first(&self, key: K) -> Option<(&V, MultiCursor<K>)> {
        let h = self.raw.header()?;
        match self.raw.find(&key) {
            NONE => None,
            slot => {
                let cursor = MultiCursor {
                    key,
                    entry: slot,
                    next: self.raw.chain_next(&h, slot),
                };
                Some((self.raw.value_at(&h, slot), cursor))
            }
        }
    }

    /// Next value for the cursor's key, advancing the cursor.
    pub fn try_get_next(&self, cursor: &mut MultiCursor<K>) -> Option<&V> {
        let h = self.raw.header()?;
        match self.raw.scan(&h, cursor.next, &cursor.key) {
            NONE => None,
            slot => {
                cursor.entry = slot;
                cursor.next = self.raw.chain_next(&h, slot);
                Some(self.raw.value_at(&h, slot))
            }
        }
    }

    /// Overwrite the value the cursor currently points at.
    pub fn set_value(&mut self, cursor: &MultiCursor<K>, value: V) -> bool {
        let Some(h) = self.raw.header() else {
            return false;
        };
        if !h.in_range(cursor.entry) || *self.raw.key_at(&h, cursor.entry) != cursor.key {
            return false;
        }
        *self.raw.value_at_mut(&h, cursor.entry) = value;
        true
    }

    /// All values for `key`, newest first.
    pub fn values_for_key(&self, key: K) -> ValuesForKey<'_, K, V, R, S> {
        ValuesForKey {
            table: self,
            state: Lookup::Start(key),
        }
    }

    /// First entry matching both key and value.
    pub fn find_first(&self, key: &K, value: &V) -> Option<&V>
    where
        V: PartialEq,
    {
        self.values_for_key(*key).find(|v| *v == value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.raw.find(key) != NONE
    }

    pub fn count_values_for_key(&self, key: &K) -> usize {
        self.values_for_key(*key).count()
    }

    /// Total records, duplicates included.
    pub fn count(&self) -> usize {
        self.raw.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.raw.set_capacity(capacity)
    }

    pub fn allocated_index_length(&self) -> usize {
        self.raw.header().map_or(0, |h| h.allocated_index_length as usize)
    }

    pub fn clear(&mut self) {
        self.raw.clear();
    }

    /// Every record in bucket-then-chain order.
    pub fn iter(&self) -> Iter<'_, K, V, R, S> {
        Iter {
            inner: self.raw.iter(),
        }
    }

    /// Keys in bucket order, one per record (duplicates repeated).
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| *k).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.iter().map(|(_, v)| *v).collect()
    }

    pub fn key_value_arrays(&self) -> (Vec<K>, Vec<V>) {
        self.iter().map(|(k, v)| (*k, *v)).unzip()
    }

    /// Sorted distinct keys.
    pub fn unique_keys(&self) -> Vec<K>
    where
        K: Ord,
    {
        let mut keys = self.keys();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    pub fn validate(&self) -> Result<()> {
        self.raw.validate()
    }
}

enum Lookup<K> {
    Start(K),
    Next(MultiCursor<K>),
    Done,
}

/// Iterator over all values stored under one key.
pub struct ValuesForKey<'a, K, V, R, S> {
    table: &'a MultiValueChainedHashTable<K, V, R, S>,
    state: Lookup<K>,
}

impl<'a, K, V, R, S> Iterator for ValuesForKey<'a, K, V, R, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    R: GrowableRegion,
    S: BuildHasher,
{
    type Item = &'a V;

    fn next(&mut self) -> Option<&'a V> {
        let table = self.table;
        let found = match self.state {
            Lookup::Start(key) => match table.try_get_first(key) {
                Some((v, cursor)) => {
                    self.state = Lookup::Next(cursor);
                    Some(v)
                }
                None => None,
            },
            Lookup::Next(ref mut cursor) => table.try_get_next(cursor),
            Lookup::Done => None,
        };
        if found.is_none() {
            self.state = Lookup::Done;
        }
        found
    }
}
