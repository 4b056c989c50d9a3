//! Table header and sub-array layout inside a region.
//!
//! ```text
//!  offset 0                                                       total
//!  ┌────────┬──────────────────┬────────────────┬──────────────┬──────────────────┐
//!  │ header │ values[key_cap]  │ keys[key_cap]  │ next[key_cap]│ buckets[bkt_cap] │
//!  └────────┴──────────────────┴────────────────┴──────────────┴──────────────────┘
//!  every boundary is a multiple of REGION_ALIGN
//! ```
//!
//! `next[slot]` is either the next slot in a bucket chain (slot reachable from
//! `buckets[]`) or the next slot in the free list (slot reachable from
//! `first_free_index`). Never both.

use std::mem::{align_of, size_of};

use crate::error::{Error, Result};
use crate::region::REGION_ALIGN;

/// Empty chain / empty free list / empty bucket.
pub const NONE: i32 = -1;

/// Largest key capacity whose bucket count (`next_pow2(2 * cap)`) still has
/// a mask representable as a non-negative `i32`.
pub const MAX_KEY_CAPACITY: usize = 1 << 30;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableHeader {
    pub key_capacity: i32,
    pub bucket_capacity_mask: i32,
    /// High-water mark of slots ever handed out.
    pub allocated_index_length: i32,
    pub first_free_index: i32,
    pub values_offset: u64,
    pub keys_offset: u64,
    pub next_offset: u64,
    pub buckets_offset: u64,
}

pub const HEADER_SIZE: usize = align_up_const(size_of::<TableHeader>());

const fn align_up_const(n: usize) -> usize {
    (n + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

#[inline]
fn align_up(n: usize) -> Option<usize> {
    Some(n.checked_add(REGION_ALIGN - 1)? & !(REGION_ALIGN - 1))
}

impl TableHeader {
    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity_mask as usize + 1
    }

    /// Slots that have ever been handed out and are still within capacity.
    pub fn used_slots(&self) -> i32 {
        self.key_capacity.min(self.allocated_index_length)
    }

    #[inline]
    pub fn in_range(&self, index: i32) -> bool {
        index >= 0 && index < self.key_capacity
    }
}

/// Byte offsets of each sub-array for a given capacity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub key_capacity: usize,
    pub bucket_capacity: usize,
    pub values: usize,
    pub keys: usize,
    pub next: usize,
    pub buckets: usize,
    pub total: usize,
}

impl Layout {
    /// Layout for `key_capacity` slots. Fails with `CapacityExceeded` if the
    /// indices or the byte length would not fit.
    pub fn for_capacity<K, V>(key_capacity: usize) -> Result<Self> {
        const {
            assert!(align_of::<K>() <= REGION_ALIGN);
            assert!(align_of::<V>() <= REGION_ALIGN);
        }
        let exceeded = || Error::CapacityExceeded {
            requested: key_capacity,
            element_size: slot_size::<K, V>(),
        };
        if key_capacity > MAX_KEY_CAPACITY {
            return Err(exceeded());
        }
        let bucket_capacity = bucket_capacity_for(key_capacity);

        let compute = || -> Option<Layout> {
            let values = HEADER_SIZE;
            let keys = align_up(values.checked_add(key_capacity.checked_mul(size_of::<V>())?)?)?;
            let next = align_up(keys.checked_add(key_capacity.checked_mul(size_of::<K>())?)?)?;
            let buckets =
                align_up(next.checked_add(key_capacity.checked_mul(size_of::<i32>())?)?)?;
            let total =
                align_up(buckets.checked_add(bucket_capacity.checked_mul(size_of::<i32>())?)?)?;
            if total > isize::MAX as usize {
                return None;
            }
            Some(Layout {
                key_capacity,
                bucket_capacity,
                values,
                keys,
                next,
                buckets,
                total,
            })
        };
        compute().ok_or_else(exceeded)
    }

    pub fn header(&self, allocated_index_length: i32, first_free_index: i32) -> TableHeader {
        TableHeader {
            key_capacity: self.key_capacity as i32,
            bucket_capacity_mask: (self.bucket_capacity - 1) as i32,
            allocated_index_length,
            first_free_index,
            values_offset: self.values as u64,
            keys_offset: self.keys as u64,
            next_offset: self.next as u64,
            buckets_offset: self.buckets as u64,
        }
    }

    /// Does `header` describe exactly this layout?
    pub fn matches(&self, header: &TableHeader) -> bool {
        header.key_capacity as usize == self.key_capacity
            && header.bucket_capacity() == self.bucket_capacity
            && header.values_offset as usize == self.values
            && header.keys_offset as usize == self.keys
            && header.next_offset as usize == self.next
            && header.buckets_offset as usize == self.buckets
    }
}

/// Bytes one slot costs across `values`, `keys` and `next`.
pub fn slot_size<K, V>() -> usize {
    size_of::<K>() + size_of::<V>() + size_of::<i32>()
}

/// Next power of two that is at least twice the key capacity.
pub fn bucket_capacity_for(key_capacity: usize) -> usize {
    (key_capacity.max(1) * 2).next_power_of_two()
}

/// Doubling policy: 0 -> 1, otherwise x2.
pub fn grown_capacity(current: usize) -> usize {
    if current == 0 { 1 } else { current * 2 }
}
