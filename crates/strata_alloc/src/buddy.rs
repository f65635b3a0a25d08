//! # Segregated Binary-Buddy Allocator
//!
//! Variable-size sub-allocation over a power-of-two arena whose payload may
//! be unsuitable for embedded pointers (write-combined or device-visible
//! memory). All bookkeeping lives in a separate, caller-supplied buffer; the
//! arena bytes are never read or written except by `realloc`'s copy.
//!
//! ## Bookkeeping
//!
//! The arena is a complete binary tree of blocks. Level 0 is the whole
//! arena, level `depth` holds blocks of `min_block_size`. Nodes are numbered
//! in heap order (root 0, children `2n + 1` and `2n + 2`).
//!
//! ```text
//! bits: [ free: one per node, segregated by level | split: one per inner node ]
//!
//! level 0          [              0              ]
//! level 1          [      1       |      2       ]
//! level 2          [  3   |   4   |   5   |  6   ]
//! ```
//!
//! A *block* is a node reached from the root through split nodes only. A
//! block is free iff its free bit is set; otherwise it is allocated. Free
//! bits are never set on nodes that are not blocks, so finding a free block
//! of a given size is a bit scan over that level's range.
//!
//! ## Thread Safety
//!
//! NOT thread-safe: a malloc or free is several dependent bit
//! updates. Serialize externally, e.g. one instance per thread or frame, or
//! a mutex owned by the caller.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::bitset::BitSet;
use crate::error::{AllocError, AllocResult, HeapCorruption};

/// A maximal stretch of adjacent blocks in the same state, reported by
/// [`BuddyAllocator::walk_heap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapRun {
    /// Offset of the first block from the arena base.
    pub offset: usize,
    /// Bytes covered by the run.
    pub size: usize,
    /// Number of blocks in the run.
    pub blocks: usize,
    /// Whether the blocks are allocated.
    pub used: bool,
}

/// Totals produced by a successful [`BuddyAllocator::check_heap`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes in allocated blocks.
    pub used_bytes: usize,
    /// Bytes in free blocks.
    pub free_bytes: usize,
    /// Number of allocated blocks.
    pub used_blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Size of the largest free block.
    pub largest_free_block: usize,
}

/// Running totals while auditing the tree.
#[derive(Default)]
struct Audit {
    stats: HeapStats,
    split_nodes: usize,
    uncoalesced: Option<(usize, usize)>,
}

/// Binary-buddy allocator with out-of-band bookkeeping.
///
/// # Example
///
/// ```rust
/// use strata_alloc::{BuddyAllocator, HeapArena};
///
/// let mut arena = HeapArena::new(4096);
/// let mut book = HeapArena::new(BuddyAllocator::bookkeeping_bytes(4096, 256).unwrap());
/// let mut buddy = BuddyAllocator::create(arena.as_bytes_mut(), 256, book.as_bytes_mut()).unwrap();
///
/// let block = buddy.malloc(300).unwrap();
/// assert_eq!(buddy.block_size(block), Some(512));
/// buddy.free(block);
/// assert_eq!(buddy.max_free_block_size(), 4096);
/// ```
pub struct BuddyAllocator<'a> {
    /// Arena base address.
    base: NonNull<u8>,
    /// Arena size, a power of two.
    arena_bytes: usize,
    /// Smallest block handed out, a power of two.
    min_block_size: usize,
    /// Level of the smallest blocks.
    depth: u32,
    /// Number of nodes in the tree; split bits start here.
    node_count: usize,
    /// Free and split bits.
    bits: BitSet<'a>,
    /// Bytes in allocated blocks.
    used_bytes: usize,
    _arena: PhantomData<&'a mut [u8]>,
}

// SAFETY: the allocator exclusively borrows both the arena and the
// bookkeeping for `'a`; moving it to another thread moves that exclusivity.
// It is deliberately not `Sync`.
unsafe impl Send for BuddyAllocator<'_> {}

impl<'a> BuddyAllocator<'a> {
    /// Deepest supported tree: arena / min block of 2^31, less on targets
    /// where the node count would not fit a `usize`.
    pub const MAX_DEPTH: u32 = if usize::BITS - 2 < 31 { usize::BITS - 2 } else { 31 };

    /// Bookkeeping alignment requirement.
    pub const BOOKKEEPING_ALIGNMENT: usize = std::mem::align_of::<u64>();

    #[inline]
    const fn node_count(depth: u32) -> usize {
        (1usize << (depth + 1)) - 1
    }

    #[inline]
    const fn inner_count(depth: u32) -> usize {
        (1usize << depth) - 1
    }

    #[inline]
    const fn level_start(level: u32) -> usize {
        (1usize << level) - 1
    }

    fn validate(arena_bytes: usize, min_block_size: usize) -> AllocResult<u32> {
        if !arena_bytes.is_power_of_two() {
            return Err(AllocError::NotPowerOfTwo {
                what: "arena size",
                value: arena_bytes,
            });
        }
        if !min_block_size.is_power_of_two() {
            return Err(AllocError::NotPowerOfTwo {
                what: "minimum block size",
                value: min_block_size,
            });
        }
        if min_block_size > arena_bytes {
            return Err(AllocError::MinBlockExceedsArena {
                min_block_size,
                arena_bytes,
            });
        }
        let depth = arena_bytes.trailing_zeros() - min_block_size.trailing_zeros();
        if depth > Self::MAX_DEPTH {
            return Err(AllocError::TreeTooDeep {
                depth,
                maximum: Self::MAX_DEPTH,
            });
        }
        Ok(depth)
    }

    /// Bookkeeping bytes needed for an arena of `arena_bytes` split down to
    /// `min_block_size`.
    ///
    /// # Errors
    ///
    /// Same configuration errors as [`BuddyAllocator::create`].
    pub fn bookkeeping_bytes(arena_bytes: usize, min_block_size: usize) -> AllocResult<usize> {
        let depth = Self::validate(arena_bytes, min_block_size)?;
        let bits = Self::node_count(depth) + Self::inner_count(depth);
        Ok(BitSet::words_for(bits) * std::mem::size_of::<u64>())
    }

    /// Binds a buddy allocator to `arena`, keeping its tree in `bookkeeping`.
    ///
    /// # Errors
    ///
    /// - [`AllocError::NotPowerOfTwo`] for the arena length or `min_block_size`
    /// - [`AllocError::MinBlockExceedsArena`] / [`AllocError::TreeTooDeep`]
    /// - [`AllocError::BookkeepingTooSmall`] if `bookkeeping` is shorter than
    ///   [`BuddyAllocator::bookkeeping_bytes`]
    /// - [`AllocError::MisalignedBookkeeping`] if `bookkeeping` is not 8-byte aligned
    pub fn create(arena: &'a mut [u8], min_block_size: usize, bookkeeping: &'a mut [u8]) -> AllocResult<Self> {
        let arena_bytes = arena.len();
        let depth = Self::validate(arena_bytes, min_block_size)?;
        let required = Self::bookkeeping_bytes(arena_bytes, min_block_size)?;
        if bookkeeping.len() < required {
            return Err(AllocError::BookkeepingTooSmall {
                required,
                provided: bookkeeping.len(),
            });
        }
        let words: &'a mut [u64] = bytemuck::try_cast_slice_mut(&mut bookkeeping[..required]).map_err(|_| {
            AllocError::MisalignedBookkeeping {
                alignment: Self::BOOKKEEPING_ALIGNMENT,
            }
        })?;

        let mut bits = BitSet::new(words);
        bits.set(0);

        tracing::debug!(arena_bytes, min_block_size, depth, bookkeeping = required, "buddy allocator created");

        Ok(Self {
            base: NonNull::from(arena).cast::<u8>(),
            arena_bytes,
            min_block_size,
            depth,
            node_count: Self::node_count(depth),
            bits,
            used_bytes: 0,
            _arena: PhantomData,
        })
    }

    /// Returns the arena size in bytes.
    #[inline]
    #[must_use]
    pub const fn arena_bytes(&self) -> usize {
        self.arena_bytes
    }

    /// Returns the smallest block size.
    #[inline]
    #[must_use]
    pub const fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    /// Returns the bytes held by allocated blocks (after rounding).
    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Returns the bytes not held by allocated blocks.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.arena_bytes - self.used_bytes
    }

    #[inline]
    const fn block_bytes(&self, level: u32) -> usize {
        self.arena_bytes >> level
    }

    #[inline]
    const fn split_bit(&self, node: usize) -> usize {
        self.node_count + node
    }

    #[inline]
    fn is_split(&self, node: usize, level: u32) -> bool {
        level < self.depth && self.bits.get(self.split_bit(node))
    }

    #[inline]
    fn node_offset(&self, node: usize, level: u32) -> usize {
        (node - Self::level_start(level)) * self.block_bytes(level)
    }

    #[inline]
    fn block_ptr(&self, node: usize, level: u32) -> NonNull<u8> {
        // SAFETY: node offsets are below `arena_bytes`, inside the borrowed
        // arena, whose base is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.node_offset(node, level))) }
    }

    #[inline]
    fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        (offset < self.arena_bytes).then_some(offset)
    }

    /// Descends through split nodes to the block containing `offset`.
    fn locate(&self, offset: usize) -> (usize, u32) {
        let mut node = 0;
        let mut level = 0;
        while self.is_split(node, level) {
            let half = self.block_bytes(level + 1);
            node = 2 * node + 1 + (offset / half) % 2;
            level += 1;
        }
        (node, level)
    }

    /// Finds the smallest free block at `level` or above.
    fn find_free(&self, level: u32) -> Option<(usize, u32)> {
        (0..=level).rev().find_map(|at| {
            self.bits
                .find_first(Self::level_start(at), Self::level_start(at + 1))
                .map(|node| (node, at))
        })
    }

    /// Returns true if `ptr` points into the arena.
    #[inline]
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Allocates a block of at least `bytes`.
    ///
    /// The block size is the next power of two at or above
    /// `max(bytes, min_block_size)`, and the block is aligned to that size
    /// relative to the arena base.
    ///
    /// # Returns
    ///
    /// `None` for zero-size requests, requests larger than the arena, or
    /// when no block of the needed size is free.
    pub fn malloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 || bytes > self.arena_bytes {
            tracing::trace!(bytes, arena_bytes = self.arena_bytes, "buddy request out of range");
            return None;
        }
        let size = bytes.max(self.min_block_size).next_power_of_two();
        let level = self.arena_bytes.trailing_zeros() - size.trailing_zeros();

        let Some((mut node, mut at)) = self.find_free(level) else {
            tracing::trace!(bytes, size, "buddy allocator exhausted");
            return None;
        };

        self.bits.clear(node);
        while at < level {
            self.bits.set(self.split_bit(node));
            let left = 2 * node + 1;
            self.bits.set(left + 1);
            node = left;
            at += 1;
        }

        self.used_bytes += size;
        Some(self.block_ptr(node, level))
    }

    /// Frees a block, merging it with its buddy as far up as possible.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of an allocated block. A double free
    /// or foreign pointer means the tree can no longer be trusted.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let Some(offset) = self.offset_of(ptr.as_ptr()) else {
            tracing::error!(?ptr, "foreign pointer freed to buddy allocator");
            panic!("pointer {ptr:?} is outside the buddy arena");
        };
        let (mut node, mut level) = self.locate(offset);
        if self.node_offset(node, level) != offset || self.bits.get(node) {
            tracing::error!(?ptr, offset, "buddy free of a pointer that is not a live block");
            panic!("pointer {ptr:?} is not a live buddy block");
        }

        self.used_bytes -= self.block_bytes(level);

        while level > 0 {
            let buddy = if node % 2 == 1 { node + 1 } else { node - 1 };
            if !self.bits.get(buddy) {
                break;
            }
            self.bits.clear(buddy);
            node = (node - 1) / 2;
            level -= 1;
            self.bits.clear(self.split_bit(node));
        }
        self.bits.set(node);
    }

    /// Size of the allocated block starting at `ptr`.
    ///
    /// O(depth). Returns `None` if `ptr` is not the start of an allocated block.
    #[must_use]
    pub fn block_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = self.offset_of(ptr.as_ptr())?;
        let (node, level) = self.locate(offset);
        (self.node_offset(node, level) == offset && !self.bits.get(node)).then(|| self.block_bytes(level))
    }

    /// Moves an allocation to a block of at least `bytes`.
    ///
    /// Always allocates a new block, copies `min(old block, bytes)` bytes and
    /// frees the old block. There is no in-place growth.
    ///
    /// # Returns
    ///
    /// The new block, or `None` if no block is available; the old block is
    /// then left untouched.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of an allocated block.
    pub fn realloc(&mut self, ptr: NonNull<u8>, bytes: usize) -> Option<NonNull<u8>> {
        let Some(old_size) = self.block_size(ptr) else {
            tracing::error!(?ptr, "buddy realloc of a pointer that is not a live block");
            panic!("pointer {ptr:?} is not a live buddy block");
        };
        let new = self.malloc(bytes)?;
        // SAFETY: both blocks are allocated, so they are disjoint, inside the
        // arena and at least `min(old_size, bytes)` bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(bytes));
        }
        self.free(ptr);
        Some(new)
    }

    /// Size of the largest block `malloc` could currently return.
    #[must_use]
    pub fn max_free_block_size(&self) -> usize {
        (0..=self.depth)
            .find(|&level| {
                self.bits
                    .find_first(Self::level_start(level), Self::level_start(level + 1))
                    .is_some()
            })
            .map_or(0, |level| self.block_bytes(level))
    }

    /// Calls `visit` for every used or free run in address order.
    ///
    /// Adjacent blocks in the same state are merged, so runs strictly
    /// alternate between used and free.
    pub fn walk_heap(&self, mut visit: impl FnMut(HeapRun)) {
        let mut pending: Option<HeapRun> = None;
        self.walk_node(0, 0, &mut |block: HeapRun| {
            if let Some(run) = pending.as_mut().filter(|run| run.used == block.used) {
                run.size += block.size;
                run.blocks += 1;
            } else if let Some(run) = pending.replace(block) {
                visit(run);
            }
        });
        if let Some(run) = pending {
            visit(run);
        }
    }

    fn walk_node(&self, node: usize, level: u32, visit: &mut impl FnMut(HeapRun)) {
        if self.is_split(node, level) {
            self.walk_node(2 * node + 1, level + 1, visit);
            self.walk_node(2 * node + 2, level + 1, visit);
        } else {
            visit(HeapRun {
                offset: self.node_offset(node, level),
                size: self.block_bytes(level),
                blocks: 1,
                used: !self.bits.get(node),
            });
        }
    }

    fn audit_node(&self, node: usize, level: u32, audit: &mut Audit) {
        if self.is_split(node, level) {
            audit.split_nodes += 1;
            let left = 2 * node + 1;
            let right = left + 1;
            let free_block = |child: usize| self.bits.get(child) && !self.is_split(child, level + 1);
            if audit.uncoalesced.is_none() && free_block(left) && free_block(right) {
                audit.uncoalesced = Some((self.node_offset(left, level + 1), self.block_bytes(level + 1)));
            }
            self.audit_node(left, level + 1, audit);
            self.audit_node(right, level + 1, audit);
            return;
        }

        let size = self.block_bytes(level);
        if self.bits.get(node) {
            audit.stats.free_blocks += 1;
            audit.stats.free_bytes += size;
            audit.stats.largest_free_block = audit.stats.largest_free_block.max(size);
        } else {
            audit.stats.used_blocks += 1;
            audit.stats.used_bytes += size;
        }
    }

    /// Validates the tree.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found: uncoalesced free buddies,
    /// stray free or split bits, blocks not tiling the arena, or a used
    /// counter that disagrees with the tree.
    pub fn check_heap(&self) -> Result<HeapStats, HeapCorruption> {
        let mut audit = Audit::default();
        self.audit_node(0, 0, &mut audit);
        let stats = audit.stats;

        let covered = stats.used_bytes + stats.free_bytes;
        if covered != self.arena_bytes {
            return Err(HeapCorruption::CoverageMismatch {
                covered,
                arena_bytes: self.arena_bytes,
            });
        }
        if let Some((offset, size)) = audit.uncoalesced {
            return Err(HeapCorruption::UncoalescedBuddies { offset, size });
        }
        let free_bits = self.bits.count(0, self.node_count);
        if free_bits != stats.free_blocks {
            return Err(HeapCorruption::StrayFreeBits {
                stray: free_bits.abs_diff(stats.free_blocks),
            });
        }
        let split_bits = self
            .bits
            .count(self.node_count, self.node_count + Self::inner_count(self.depth));
        if split_bits != audit.split_nodes {
            return Err(HeapCorruption::StraySplitBits {
                stray: split_bits.abs_diff(audit.split_nodes),
            });
        }
        if stats.used_bytes != self.used_bytes {
            return Err(HeapCorruption::UsedBytesMismatch {
                counter: self.used_bytes,
                tree: stats.used_bytes,
            });
        }
        Ok(stats)
    }

    /// Releases the arena and bookkeeping. Equivalent to dropping.
    ///
    /// # Panics
    ///
    /// Panics if blocks are still allocated.
    pub fn deinitialize(self) {
        tracing::debug!(arena_bytes = self.arena_bytes, "buddy allocator deinitialized");
        drop(self);
    }
}

impl Drop for BuddyAllocator<'_> {
    fn drop(&mut self) {
        if self.used_bytes != 0 && !std::thread::panicking() {
            tracing::error!(used_bytes = self.used_bytes, "buddy allocator dropped with live blocks");
            panic!("buddy allocator dropped with {} bytes still allocated", self.used_bytes);
        }
    }
}

impl std::fmt::Debug for BuddyAllocator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("arena_bytes", &self.arena_bytes)
            .field("min_block_size", &self.min_block_size)
            .field("used_bytes", &self.used_bytes)
            .finish_non_exhaustive()
    }
}
