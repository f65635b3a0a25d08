//! # Heap Arena
//!
//! An owned, cache-line-aligned byte buffer for callers that do not bring
//! their own memory. Allocated once at startup, then lent to exactly one
//! allocator at a time.

use bytemuck::{Pod, Zeroable};

/// One cache line of backing storage.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
struct CacheLine([u8; 64]);

/// A zero-initialized, 64-byte aligned byte buffer.
///
/// Allocators never own their memory; a `HeapArena` is the usual owner.
/// Lending it out through [`HeapArena::as_bytes_mut`] ties the allocator's
/// lifetime to the arena, so the arena cannot be dropped or handed to a
/// second allocator while the first is alive.
///
/// # Example
///
/// ```rust
/// use strata_alloc::{HeapArena, LinearAllocator};
///
/// let mut arena = HeapArena::new(4096);
/// let scratch = LinearAllocator::initialize(arena.as_bytes_mut());
/// assert!(scratch.allocate(128, 16).is_some());
/// ```
pub struct HeapArena {
    /// Backing storage, rounded up to whole cache lines.
    lines: Box<[CacheLine]>,
    /// Usable length in bytes.
    len: usize,
}

impl HeapArena {
    /// Alignment of the arena base address.
    pub const ALIGNMENT: usize = std::mem::align_of::<CacheLine>();

    /// Allocates a zeroed arena of `len` bytes.
    ///
    /// This is the only heap allocation in the arena's life.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let line_count = len.div_ceil(Self::ALIGNMENT);
        let lines = vec![CacheLine::zeroed(); line_count].into_boxed_slice();
        tracing::debug!(len, "heap arena reserved");
        Self { lines, len }
    }

    /// Returns the usable length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the arena has no usable bytes.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the arena as bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.lines)[..self.len]
    }

    /// Lends the arena out as mutable bytes.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.lines)[..self.len]
    }

    /// Zeroes every byte of the arena.
    pub fn clear(&mut self) {
        self.as_bytes_mut().fill(0);
    }
}

impl std::fmt::Debug for HeapArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapArena").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_alignment() {
        let mut arena = HeapArena::new(100);
        assert_eq!(arena.len(), 100);
        assert_eq!(arena.as_bytes_mut().as_ptr() as usize % HeapArena::ALIGNMENT, 0);
    }

    #[test]
    fn test_arena_zeroed_and_clear() {
        let mut arena = HeapArena::new(256);
        assert!(arena.as_bytes().iter().all(|&b| b == 0));

        arena.as_bytes_mut()[7] = 0xAB;
        assert_eq!(arena.as_bytes()[7], 0xAB);

        arena.clear();
        assert!(arena.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_arena() {
        let mut arena = HeapArena::new(0);
        assert!(arena.is_empty());
        assert!(arena.as_bytes_mut().is_empty());
    }
}
