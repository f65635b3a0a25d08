//! # Block Pool
//!
//! Fixed-size block allocator over a borrowed arena, for objects that are
//! frequently allocated and freed: particles, packets, task records.
//!
//! ## Layout
//!
//! ```text
//! arena: [ slot 0 | slot 1 | slot 2 | slot 3 | ... ]
//!           ^ stride = block_size
//!
//! free slot:      [ next: u32 | (unused) ... ]
//! allocated slot: [ caller bytes ..........  ]
//! ```
//!
//! The freelist lives inside the free slots themselves, so the pool needs no
//! memory beyond the arena. Allocate and deallocate are O(1).
//!
//! ## Variants
//!
//! - [`BlockPool`] (`BlockPool<'a, Local>`): single-threaded, not `Sync`.
//! - [`ConcurrentBlockPool`] (`BlockPool<'a, Shared>`): lock-free, tagged CAS.

use std::ptr::NonNull;

use crate::error::{AllocError, AllocResult};
use crate::freelist::FreeList;
use crate::link::{Links, LINK_BYTES};
use crate::policy::{Local, Shared, SyncPolicy, NIL};

/// A pool allocator for fixed-size blocks.
///
/// Blocks are handed out uninitialized. The calling convention for typed
/// objects is: allocate, construct in place, destruct, deallocate.
///
/// # Thread Safety
///
/// With the default [`Local`] policy the pool is NOT thread-safe (`!Sync`).
/// Use [`ConcurrentBlockPool`] for lock-free shared access.
///
/// # Example
///
/// ```rust
/// use strata_alloc::{BlockPool, HeapArena, Local};
///
/// let mut arena = HeapArena::new(64);
/// let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 4).unwrap();
///
/// // Allocate - O(1), no heap allocation
/// let a = pool.allocate_index().unwrap();
/// let b = pool.allocate_index().unwrap();
/// assert_eq!((a, b), (0, 1));
///
/// // Free - O(1), most recently freed slot is reused first
/// pool.deallocate_index(a);
/// assert_eq!(pool.allocate_index(), Some(a));
///
/// pool.deallocate_index(a);
/// pool.deallocate_index(b);
/// ```
pub struct BlockPool<'a, P: SyncPolicy = Local> {
    /// Freelist threaded through the free slots.
    free: FreeList<'a, P>,
    /// Number of blocks currently handed out.
    outstanding: P::Counter,
}

/// Lock-free block pool.
pub type ConcurrentBlockPool<'a> = BlockPool<'a, Shared>;

impl<'a, P: SyncPolicy> BlockPool<'a, P> {
    /// Smallest block size: a free block must hold its freelist link.
    pub const MIN_BLOCK_SIZE: usize = LINK_BYTES;

    /// Largest capacity. Slot indices must stay below the [`NIL`] sentinel.
    pub const MAX_CAPACITY: usize = NIL as usize - 1;

    /// Bytes of arena needed for `capacity` blocks of `block_size` bytes.
    ///
    /// Saturates instead of overflowing, so absurd requests fail validation.
    #[inline]
    #[must_use]
    pub const fn required_bytes(block_size: usize, capacity: usize) -> usize {
        block_size.saturating_mul(capacity)
    }

    /// Checks a pool geometry without touching memory.
    ///
    /// # Errors
    ///
    /// - [`AllocError::ZeroCapacity`] / [`AllocError::CapacityTooLarge`]
    /// - [`AllocError::BlockSizeTooSmall`] if blocks cannot hold a link
    /// - [`AllocError::MisalignedBlockSize`] if the stride is not a multiple of 4
    pub fn validate(block_size: usize, capacity: usize) -> AllocResult<()> {
        if capacity == 0 {
            return Err(AllocError::ZeroCapacity);
        }
        if capacity > Self::MAX_CAPACITY {
            return Err(AllocError::CapacityTooLarge {
                capacity,
                maximum: Self::MAX_CAPACITY,
            });
        }
        if block_size < Self::MIN_BLOCK_SIZE {
            return Err(AllocError::BlockSizeTooSmall {
                block_size,
                minimum: Self::MIN_BLOCK_SIZE,
            });
        }
        if block_size % LINK_BYTES != 0 {
            return Err(AllocError::MisalignedBlockSize {
                block_size,
                alignment: LINK_BYTES,
            });
        }
        Ok(())
    }

    /// Binds a pool to `memory`.
    ///
    /// # Errors
    ///
    /// - Any error from [`Self::validate`]
    /// - [`AllocError::ArenaTooSmall`] if `memory` is shorter than [`Self::required_bytes`]
    /// - [`AllocError::MisalignedArena`] if `memory` is not 4-byte aligned
    pub fn initialize(memory: &'a mut [u8], block_size: usize, capacity: usize) -> AllocResult<Self> {
        Self::validate(block_size, capacity)?;
        let required = Self::required_bytes(block_size, capacity);
        if memory.len() < required {
            return Err(AllocError::ArenaTooSmall {
                required,
                provided: memory.len(),
            });
        }
        if memory.as_ptr() as usize % LINK_BYTES != 0 {
            return Err(AllocError::MisalignedArena { alignment: LINK_BYTES });
        }

        #[allow(clippy::cast_possible_truncation)]
        let links = Links::new(memory, block_size, capacity as u32);
        tracing::debug!(policy = P::NAME, block_size, capacity, "block pool initialized");

        Ok(Self {
            free: FreeList::new(links),
            outstanding: P::new_counter(0),
        })
    }

    /// Returns the total number of blocks.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.free.links().capacity() as usize
    }

    /// Returns the size of each block in bytes.
    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.free.links().stride()
    }

    /// Returns the number of blocks currently allocated.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        P::counter_load(&self.outstanding)
    }

    /// Returns the number of free blocks.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.capacity() - self.size()
    }

    /// Returns true if no block is allocated.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true if every block is allocated.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size() == self.capacity()
    }

    /// Allocates a block and returns its slot index.
    ///
    /// This is a **O(1)** operation with **zero heap allocations**.
    ///
    /// # Returns
    ///
    /// The slot index, or `None` if the pool is exhausted.
    #[inline]
    pub fn allocate_index(&self) -> Option<u32> {
        let Some(index) = self.free.pop() else {
            tracing::trace!(policy = P::NAME, capacity = self.capacity(), "block pool exhausted");
            return None;
        };
        P::counter_add(&self.outstanding, 1);
        Some(index)
    }

    /// Returns a block by slot index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or more blocks are returned than
    /// were handed out. Both mean the freelist can no longer be trusted.
    #[inline]
    pub fn deallocate_index(&self, index: u32) {
        if !self.owns_index(index) {
            tracing::error!(index, capacity = self.capacity(), "foreign index returned to block pool");
            panic!("index {index} does not belong to this block pool");
        }
        let previous = P::counter_sub(&self.outstanding, 1);
        if previous == 0 {
            tracing::error!(index, "block pool deallocation without allocation");
            panic!("block pool freed more blocks than it allocated");
        }
        self.free.push(index);
    }

    /// Allocates a block and returns a pointer to its first byte.
    ///
    /// The block is uninitialized and `block_size()` bytes long.
    #[inline]
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        self.allocate_index().map(|index| self.free.links().slot_ptr(index))
    }

    /// Returns a block by pointer.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the first byte of a block of this pool.
    #[inline]
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        let Some(index) = self.index_of(ptr.as_ptr()) else {
            tracing::error!(?ptr, "foreign pointer returned to block pool");
            panic!("pointer {ptr:?} does not belong to this block pool");
        };
        self.deallocate_index(index);
    }

    /// Returns true if `index` is a slot of this pool.
    #[inline]
    #[must_use]
    pub fn owns_index(&self, index: u32) -> bool {
        index < self.free.links().capacity()
    }

    /// Returns true if `ptr` is the first byte of a slot of this pool.
    #[inline]
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.index_of(ptr).is_some()
    }

    /// Maps a block pointer to its slot index.
    #[inline]
    #[must_use]
    pub fn index_of(&self, ptr: *const u8) -> Option<u32> {
        self.free.links().index_of(ptr)
    }

    /// Maps a slot index to its block pointer.
    #[inline]
    #[must_use]
    pub fn ptr_of(&self, index: u32) -> Option<NonNull<u8>> {
        self.owns_index(index).then(|| self.free.links().slot_ptr(index))
    }

    /// Releases the arena. Equivalent to dropping the pool.
    ///
    /// # Panics
    ///
    /// Panics if blocks are still allocated.
    pub fn deinitialize(self) {
        tracing::debug!(policy = P::NAME, capacity = self.capacity(), "block pool deinitialized");
        drop(self);
    }
}

impl<P: SyncPolicy> Drop for BlockPool<'_, P> {
    fn drop(&mut self) {
        let outstanding = P::counter_load(&self.outstanding);
        if outstanding != 0 && !std::thread::panicking() {
            tracing::error!(outstanding, "block pool dropped with live allocations");
            panic!("block pool dropped with {outstanding} live allocations");
        }
    }
}

impl<P: SyncPolicy> std::fmt::Debug for BlockPool<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("policy", &P::NAME)
            .field("block_size", &self.block_size())
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::HeapArena;

    #[test]
    fn test_pool_sixteen_by_four() {
        let mut arena = HeapArena::new(64);
        let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 4).unwrap();

        let got: Vec<u32> = (0..4).map(|_| pool.allocate_index().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(pool.is_full());
        assert_eq!(pool.allocate_index(), None);

        pool.deallocate_index(1);
        assert_eq!(pool.allocate_index(), Some(1));

        for index in got {
            pool.deallocate_index(index);
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_allocate_free_restores_count() {
        let mut arena = HeapArena::new(BlockPool::<Local>::required_bytes(32, 10));
        let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 32, 10).unwrap();

        let before = pool.free_count();
        let ptr = pool.allocate().unwrap();
        assert_eq!(pool.free_count(), before - 1);
        pool.deallocate(ptr);
        assert_eq!(pool.free_count(), before);
    }

    #[test]
    fn test_pool_pointer_roundtrip() {
        let mut arena = HeapArena::new(128);
        let base = arena.as_bytes_mut().as_ptr() as usize;
        let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 32, 4).unwrap();

        let _first = pool.allocate_index().unwrap();
        let ptr = pool.allocate().unwrap();
        assert_eq!(ptr.as_ptr() as usize, base + 32);
        assert_eq!(pool.index_of(ptr.as_ptr()), Some(1));
        assert_eq!(pool.ptr_of(1), Some(ptr));
        assert!(pool.owns(ptr.as_ptr()));
        assert!(!pool.owns(ptr.as_ptr().wrapping_add(4)));
        assert_eq!(pool.ptr_of(4), None);

        pool.deallocate(ptr);
        pool.deallocate_index(0);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_pool_blocks_are_writable() {
        let mut arena = HeapArena::new(64);
        let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 4).unwrap();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        // SAFETY: both blocks are allocated, 16 bytes long and disjoint.
        unsafe {
            a.as_ptr().write_bytes(0xAA, 16);
            b.as_ptr().write_bytes(0xBB, 16);
            assert_eq!(*a.as_ptr().add(15), 0xAA);
        }
        pool.deallocate(a);
        pool.deallocate(b);

        // Freed blocks link correctly even after being overwritten; the
        // last block freed is the first handed back.
        assert_eq!(pool.allocate_index(), Some(1));
        assert_eq!(pool.allocate_index(), Some(0));
        pool.deallocate_index(0);
        pool.deallocate_index(1);
    }

    #[test]
    fn test_pool_rejects_bad_configuration() {
        let mut arena = HeapArena::new(64);

        assert_eq!(
            BlockPool::<Local>::initialize(arena.as_bytes_mut(), 2, 4).unwrap_err(),
            AllocError::BlockSizeTooSmall { block_size: 2, minimum: 4 }
        );
        assert_eq!(
            BlockPool::<Local>::initialize(arena.as_bytes_mut(), 6, 4).unwrap_err(),
            AllocError::MisalignedBlockSize { block_size: 6, alignment: 4 }
        );
        assert_eq!(
            BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 5).unwrap_err(),
            AllocError::ArenaTooSmall { required: 80, provided: 64 }
        );
        assert_eq!(
            BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 0).unwrap_err(),
            AllocError::ZeroCapacity
        );
        assert_eq!(
            BlockPool::<Local>::initialize(&mut arena.as_bytes_mut()[1..], 4, 4).unwrap_err(),
            AllocError::MisalignedArena { alignment: 4 }
        );
    }

    #[test]
    fn test_concurrent_pool_same_contract() {
        let mut arena = HeapArena::new(64);
        let pool = ConcurrentBlockPool::initialize(arena.as_bytes_mut(), 16, 4).unwrap();

        let got: Vec<u32> = (0..4).map(|_| pool.allocate_index().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(pool.allocate_index(), None);
        pool.deallocate_index(2);
        assert_eq!(pool.allocate_index(), Some(2));

        for index in got {
            pool.deallocate_index(index);
        }
        pool.deinitialize();
    }

    #[test]
    #[should_panic(expected = "does not belong to this block pool")]
    fn test_pool_foreign_index_panics() {
        let mut arena = HeapArena::new(64);
        let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 4).unwrap();
        pool.deallocate_index(4);
    }

    #[test]
    #[should_panic(expected = "freed more blocks than it allocated")]
    fn test_pool_excess_free_panics() {
        let mut arena = HeapArena::new(64);
        let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 4).unwrap();
        pool.deallocate_index(0);
    }

    #[test]
    #[should_panic(expected = "dropped with 1 live allocations")]
    fn test_pool_drop_with_live_allocation_panics() {
        let mut arena = HeapArena::new(64);
        let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 4).unwrap();
        let _leaked = pool.allocate_index();
        pool.deinitialize();
    }
}
