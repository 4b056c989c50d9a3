//! Relocatable byte regions.
//!
//! A table never owns an allocation policy. It asks its region for bytes and
//! lays its header and sub-arrays out inside them. Any resize may move the
//! backing memory, so no pointer derived from a region survives a call that
//! can grow it.

use std::fmt;

/// Alignment guaranteed for the base of every region. Sub-arrays are placed
/// at multiples of this inside the region.
pub const REGION_ALIGN: usize = 64;

/// A resizable, relocatable byte buffer.
///
/// # Safety
///
/// Implementors must uphold:
/// - `as_ptr`/`as_mut_ptr` return a pointer aligned to [`REGION_ALIGN`] that is
///   valid for `len()` bytes of reads (and writes, for `as_mut_ptr`).
/// - `resize` preserves the first `min(old_len, new_len)` bytes, wherever the
///   memory ends up.
/// - The bytes are not touched by anyone else while the region is borrowed.
pub unsafe trait GrowableRegion {
    /// Current length in bytes.
    fn len(&self) -> usize;

    /// Resize to `new_len` bytes. May relocate.
    fn resize(&mut self, new_len: usize);

    fn as_ptr(&self) -> *const u8;

    fn as_mut_ptr(&mut self) -> *mut u8;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Copy, Clone)]
#[repr(C, align(64))]
struct CacheLine([u8; REGION_ALIGN]);

/// Owned, cache-line aligned region backed by a `Vec` of 64-byte lines.
///
/// Not `Clone`: stored values may leave padding bytes uninitialized.
#[derive(Default)]
pub struct AlignedRegion {
    lines: Vec<CacheLine>,
    len: usize,
}

impl AlignedRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero-filled region of `len` bytes.
    pub fn with_len(len: usize) -> Self {
        let mut region = Self::new();
        region.resize(len);
        region
    }

    /// Bytes actually reserved (always a whole number of cache lines).
    pub fn reserved(&self) -> usize {
        self.lines.capacity() * REGION_ALIGN
    }
}

unsafe impl GrowableRegion for AlignedRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn resize(&mut self, new_len: usize) {
        let lines = new_len.div_ceil(REGION_ALIGN);
        self.lines.resize(lines, CacheLine([0; REGION_ALIGN]));
        self.len = new_len;
    }

    fn as_ptr(&self) -> *const u8 {
        self.lines.as_ptr().cast()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.lines.as_mut_ptr().cast()
    }
}

impl fmt::Debug for AlignedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedRegion")
            .field("len", &self.len)
            .field("reserved", &self.reserved())
            .finish()
    }
}
