//! # Thread-Safety Policies
//!
//! Pools and index allocators are written once and parameterized over a
//! [`SyncPolicy`]. The policy supplies the single step that differs between
//! the variants: how the freelist head is replaced.
//!
//! - [`Local`]: a plain read-modify-write on a `Cell`. Not `Sync`.
//! - [`Shared`]: a compare-and-swap on an `AtomicU64`. `Sync`.
//!
//! ## Tagged heads
//!
//! The head is a packed `{generation, index}` word:
//!
//! ```text
//! 63            32 31             0
//! ┌───────────────┬───────────────┐
//! │  generation   │     index     │
//! └───────────────┴───────────────┘
//! ```
//!
//! Every successful replacement bumps the generation, so a thread that
//! observed `{i, g}` and was preempted while the slot was popped and pushed
//! back sees `{i, g + k}` and its CAS fails.
//!
//! The generation is 32 bits wide and wraps. The residual hazard is a thread
//! stalled between its load and its CAS across a multiple of 2^32 successful
//! head replacements on one allocator, with the head index landing back on
//! the value it observed. At one replacement per nanosecond that window is
//! over four seconds of uninterrupted contention on a single head.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Sentinel index meaning "no free slot". Never a valid slot index.
pub const NIL: u32 = u32::MAX;

/// A freelist head: slot index plus generation tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TaggedHead(u64);

impl TaggedHead {
    /// Head of an exhausted freelist at generation zero.
    pub const EMPTY: Self = Self::new(NIL, 0);

    /// Packs an index and a generation.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64))
    }

    /// Returns the slot index portion.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Returns the generation portion.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns true if the freelist is exhausted.
    #[inline]
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.index() == NIL
    }

    /// The head that replaces `self` when `index` becomes the new top.
    #[inline]
    #[must_use]
    pub const fn successor(self, index: u32) -> Self {
        Self::new(index, self.generation().wrapping_add(1))
    }

    /// Raw packed representation.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Rebuilds a head from its packed representation.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Local {}
    impl Sealed for super::Shared {}
}

/// Storage and replacement step for a freelist head and its counters.
///
/// Sealed: the crate relies on [`Local`] never being shared across threads
/// and [`Shared`] always using atomic read-modify-write.
pub trait SyncPolicy: sealed::Sealed + 'static {
    /// Storage for the tagged head.
    type Head;
    /// Storage for a statistics counter.
    type Counter;

    /// Short name used in log events.
    const NAME: &'static str;

    /// Creates head storage.
    fn new_head(head: TaggedHead) -> Self::Head;

    /// Reads the current head.
    fn load_head(head: &Self::Head) -> TaggedHead;

    /// Replaces `observed` with `new` if the head still equals `observed`.
    ///
    /// # Errors
    ///
    /// Returns the current head when it no longer equals `observed`.
    fn replace_head(head: &Self::Head, observed: TaggedHead, new: TaggedHead) -> Result<(), TaggedHead>;

    /// Overwrites the head. Exclusive access makes this race-free.
    fn store_head(head: &mut Self::Head, value: TaggedHead);

    /// Creates counter storage.
    fn new_counter(value: usize) -> Self::Counter;

    /// Reads a counter.
    fn counter_load(counter: &Self::Counter) -> usize;

    /// Adds to a counter.
    fn counter_add(counter: &Self::Counter, delta: usize);

    /// Subtracts from a counter, returning the previous value.
    fn counter_sub(counter: &Self::Counter, delta: usize) -> usize;
}

/// Single-threaded policy. Allocators using it are `Send` but not `Sync`.
#[derive(Debug)]
pub enum Local {}

/// Lock-free policy. Allocators using it are `Send` and `Sync`.
#[derive(Debug)]
pub enum Shared {}

impl SyncPolicy for Local {
    type Head = Cell<u64>;
    type Counter = Cell<usize>;

    const NAME: &'static str = "local";

    #[inline]
    fn new_head(head: TaggedHead) -> Self::Head {
        Cell::new(head.to_bits())
    }

    #[inline]
    fn load_head(head: &Self::Head) -> TaggedHead {
        TaggedHead::from_bits(head.get())
    }

    #[inline]
    fn replace_head(head: &Self::Head, observed: TaggedHead, new: TaggedHead) -> Result<(), TaggedHead> {
        let current = TaggedHead::from_bits(head.get());
        if current != observed {
            return Err(current);
        }
        head.set(new.to_bits());
        Ok(())
    }

    #[inline]
    fn store_head(head: &mut Self::Head, value: TaggedHead) {
        *head.get_mut() = value.to_bits();
    }

    #[inline]
    fn new_counter(value: usize) -> Self::Counter {
        Cell::new(value)
    }

    #[inline]
    fn counter_load(counter: &Self::Counter) -> usize {
        counter.get()
    }

    #[inline]
    fn counter_add(counter: &Self::Counter, delta: usize) {
        counter.set(counter.get() + delta);
    }

    #[inline]
    fn counter_sub(counter: &Self::Counter, delta: usize) -> usize {
        let previous = counter.get();
        counter.set(previous.wrapping_sub(delta));
        previous
    }
}

impl SyncPolicy for Shared {
    type Head = AtomicU64;
    type Counter = AtomicUsize;

    const NAME: &'static str = "shared";

    #[inline]
    fn new_head(head: TaggedHead) -> Self::Head {
        AtomicU64::new(head.to_bits())
    }

    #[inline]
    fn load_head(head: &Self::Head) -> TaggedHead {
        TaggedHead::from_bits(head.load(Ordering::SeqCst))
    }

    #[inline]
    fn replace_head(head: &Self::Head, observed: TaggedHead, new: TaggedHead) -> Result<(), TaggedHead> {
        head.compare_exchange(
            observed.to_bits(),
            new.to_bits(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .map(|_| ())
        .map_err(TaggedHead::from_bits)
    }

    #[inline]
    fn store_head(head: &mut Self::Head, value: TaggedHead) {
        *head.get_mut() = value.to_bits();
    }

    #[inline]
    fn new_counter(value: usize) -> Self::Counter {
        AtomicUsize::new(value)
    }

    #[inline]
    fn counter_load(counter: &Self::Counter) -> usize {
        counter.load(Ordering::Relaxed)
    }

    #[inline]
    fn counter_add(counter: &Self::Counter, delta: usize) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    fn counter_sub(counter: &Self::Counter, delta: usize) -> usize {
        counter.fetch_sub(delta, Ordering::Relaxed)
    }
}
