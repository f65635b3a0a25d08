//! # STRATA Allocators
//!
//! Deterministic, arena-backed allocators for engine hot paths:
//! - Rendering staging buffers
//! - Task dispatch
//! - Handle tables
//!
//! ## Architecture Rules
//!
//! 1. **No heap allocations in hot path** - Every allocator borrows a caller-supplied arena
//! 2. **Exhaustion is not an error** - Running out of space returns `None`
//! 3. **Corruption is fatal** - Invariant violations panic, they are never "recovered"
//!
//! ## Family
//!
//! ```text
//! ┌──────────────────────┬───────────────────────┬──────────────────────────┐
//! │ Allocator            │ Single-threaded       │ Lock-free                │
//! ├──────────────────────┼───────────────────────┼──────────────────────────┤
//! │ Fixed-block pool     │ BlockPool             │ ConcurrentBlockPool      │
//! │ Index allocator      │ IndexAllocator        │ ConcurrentIndexAllocator │
//! │ Linear (bump)        │ LinearAllocator       │ ConcurrentLinearAllocator│
//! │ Binary buddy         │ BuddyAllocator        │ (never)                  │
//! │ Ring buffer          │ -                     │ spsc::channel            │
//! └──────────────────────┴───────────────────────┴──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use strata_alloc::{BlockPool, HeapArena, Local};
//!
//! let mut arena = HeapArena::new(BlockPool::<Local>::required_bytes(16, 4));
//! let pool = BlockPool::<Local>::initialize(arena.as_bytes_mut(), 16, 4).unwrap();
//!
//! let slot = pool.allocate_index().unwrap();
//! assert_eq!(slot, 0);
//! pool.deallocate_index(slot);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::perf)]
#![warn(clippy::pedantic)]

pub mod arena;
mod bitset;
pub mod buddy;
pub mod error;
mod freelist;
pub mod index;
pub mod linear;
mod link;
pub mod policy;
pub mod pool;
pub mod spsc;

pub use arena::HeapArena;
pub use buddy::{BuddyAllocator, HeapRun, HeapStats};
pub use error::{AllocError, AllocResult, HeapCorruption};
pub use index::{ConcurrentIndexAllocator, IndexAllocator};
pub use linear::{ConcurrentLinearAllocator, LinearAllocator};
pub use policy::{Local, Shared, SyncPolicy, TaggedHead, NIL};
pub use pool::{BlockPool, ConcurrentBlockPool};
