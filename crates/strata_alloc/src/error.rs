//! # Allocator Error Types
//!
//! Only construction-time configuration problems are errors. Exhaustion is
//! signalled with `None`, and invariant violations panic.

use thiserror::Error;

/// Errors reported when binding an allocator to its memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// A size that must be a power of two is not.
    #[error("{what} must be a power of two, got {value}")]
    NotPowerOfTwo {
        /// Which parameter was rejected.
        what: &'static str,
        /// The rejected value.
        value: usize,
    },

    /// Blocks must be able to hold a freelist link while free.
    #[error("block size {block_size} is smaller than the {minimum}-byte freelist link")]
    BlockSizeTooSmall {
        /// Requested block size.
        block_size: usize,
        /// Smallest accepted block size.
        minimum: usize,
    },

    /// Block stride would leave freelist links misaligned.
    #[error("block size {block_size} is not a multiple of {alignment}")]
    MisalignedBlockSize {
        /// Requested block size.
        block_size: usize,
        /// Required stride multiple.
        alignment: usize,
    },

    /// The arena cannot hold the requested capacity.
    #[error("arena too small: need {required} bytes, got {provided}")]
    ArenaTooSmall {
        /// Bytes required.
        required: usize,
        /// Bytes supplied.
        provided: usize,
    },

    /// The arena base address is not suitably aligned.
    #[error("arena base is not aligned to {alignment} bytes")]
    MisalignedArena {
        /// Required alignment in bytes.
        alignment: usize,
    },

    /// Capacity collides with the freelist sentinel.
    #[error("capacity {capacity} exceeds the maximum of {maximum}")]
    CapacityTooLarge {
        /// Requested capacity.
        capacity: usize,
        /// Largest accepted capacity.
        maximum: usize,
    },

    /// A zero-slot allocator was requested.
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    /// The buddy bookkeeping buffer cannot hold the split tree.
    #[error("bookkeeping buffer too small: need {required} bytes, got {provided}")]
    BookkeepingTooSmall {
        /// Bytes required.
        required: usize,
        /// Bytes supplied.
        provided: usize,
    },

    /// The buddy bookkeeping buffer is not word aligned.
    #[error("bookkeeping buffer must be aligned to {alignment} bytes")]
    MisalignedBookkeeping {
        /// Required alignment in bytes.
        alignment: usize,
    },

    /// The buddy minimum block is larger than the whole arena.
    #[error("minimum block size {min_block_size} exceeds arena size {arena_bytes}")]
    MinBlockExceedsArena {
        /// Requested minimum block size.
        min_block_size: usize,
        /// Arena size in bytes.
        arena_bytes: usize,
    },

    /// Too many split levels between the arena and the minimum block.
    #[error("buddy tree depth {depth} exceeds the maximum of {maximum} levels")]
    TreeTooDeep {
        /// Requested depth.
        depth: u32,
        /// Deepest supported tree.
        maximum: u32,
    },
}

/// Result type for allocator construction.
pub type AllocResult<T> = Result<T, AllocError>;

/// Inconsistencies found by [`crate::BuddyAllocator::check_heap`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapCorruption {
    /// Two free buddies were left side by side instead of being merged.
    #[error("free buddies at offset {offset} (size {size}) were not coalesced")]
    UncoalescedBuddies {
        /// Offset of the left buddy.
        offset: usize,
        /// Size of each buddy.
        size: usize,
    },

    /// Free bits are set on nodes that are not blocks.
    #[error("{stray} free bits set outside the block tree")]
    StrayFreeBits {
        /// Number of unexpected bits.
        stray: usize,
    },

    /// Split bits are set on nodes that are not reachable through splits.
    #[error("{stray} split bits set outside the block tree")]
    StraySplitBits {
        /// Number of unexpected bits.
        stray: usize,
    },

    /// Blocks do not tile the arena exactly.
    #[error("blocks cover {covered} bytes but the arena holds {arena_bytes}")]
    CoverageMismatch {
        /// Bytes covered by walked blocks.
        covered: usize,
        /// Arena size in bytes.
        arena_bytes: usize,
    },

    /// The running used-bytes counter disagrees with the tree.
    #[error("used counter says {counter} bytes but the tree holds {tree}")]
    UsedBytesMismatch {
        /// Value of the running counter.
        counter: usize,
        /// Bytes held by used blocks in the tree.
        tree: usize,
    },
}
