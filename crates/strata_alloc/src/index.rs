//! # Index Allocator
//!
//! Hands out opaque `u32` handles (table indices) instead of pointers. The
//! arena is a caller-supplied array of bare link words, one per handle:
//!
//! ```text
//! links: [ next(0) | next(1) | next(2) | ... ]   (free entries only)
//! ```
//!
//! Same tagged freelist as the block pools; only the slot stride differs.
//! [`IndexAllocator`] and [`ConcurrentIndexAllocator`] are one type with two
//! [`SyncPolicy`] instantiations.
//!
//! ## Diagnostics
//!
//! [`IndexAllocator::size`] and [`IndexAllocator::count_free`] walk the
//! freelist. They are O(n), meant for tests and debug tooling, and only
//! approximate while other threads allocate or deallocate.

use crate::error::{AllocError, AllocResult};
use crate::freelist::FreeList;
use crate::link::{Links, LINK_BYTES};
use crate::policy::{Local, Shared, SyncPolicy, NIL};

/// Allocator of integer handles in `0..capacity`.
///
/// # Example
///
/// ```rust
/// use strata_alloc::ConcurrentIndexAllocator;
///
/// let mut links = vec![0u32; 8];
/// let handles = ConcurrentIndexAllocator::initialize(&mut links, 8).unwrap();
///
/// let texture = handles.allocate().unwrap();
/// assert!(handles.owns(texture));
/// handles.deallocate(texture);
/// ```
pub struct IndexAllocator<'a, P: SyncPolicy = Local> {
    free: FreeList<'a, P>,
    /// Number of handles currently handed out.
    outstanding: P::Counter,
}

/// Lock-free index allocator.
pub type ConcurrentIndexAllocator<'a> = IndexAllocator<'a, Shared>;

impl<'a, P: SyncPolicy> IndexAllocator<'a, P> {
    /// Largest capacity. Handles must stay below the [`NIL`] sentinel.
    pub const MAX_CAPACITY: usize = NIL as usize - 1;

    /// Bytes of link storage needed for `capacity` handles.
    #[inline]
    #[must_use]
    pub const fn required_bytes(capacity: usize) -> usize {
        capacity.saturating_mul(LINK_BYTES)
    }

    /// Checks a handle count without touching memory.
    ///
    /// # Errors
    ///
    /// [`AllocError::ZeroCapacity`] / [`AllocError::CapacityTooLarge`]
    pub fn validate(capacity: usize) -> AllocResult<()> {
        if capacity == 0 {
            return Err(AllocError::ZeroCapacity);
        }
        if capacity > Self::MAX_CAPACITY {
            return Err(AllocError::CapacityTooLarge {
                capacity,
                maximum: Self::MAX_CAPACITY,
            });
        }
        Ok(())
    }

    /// Binds an allocator of `capacity` handles to `links`.
    ///
    /// # Errors
    ///
    /// - Any error from [`Self::validate`]
    /// - [`AllocError::ArenaTooSmall`] if `links` has fewer than `capacity` words
    pub fn initialize(links: &'a mut [u32], capacity: usize) -> AllocResult<Self> {
        Self::validate(capacity)?;
        if links.len() < capacity {
            return Err(AllocError::ArenaTooSmall {
                required: Self::required_bytes(capacity),
                provided: Self::required_bytes(links.len()),
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let links = Links::new(bytemuck::cast_slice_mut(links), LINK_BYTES, capacity as u32);
        tracing::debug!(policy = P::NAME, capacity, "index allocator initialized");

        Ok(Self {
            free: FreeList::new(links),
            outstanding: P::new_counter(0),
        })
    }

    /// Returns the number of handles.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.free.links().capacity() as usize
    }

    /// Allocates a handle, or returns `None` when every handle is in use.
    #[inline]
    pub fn allocate(&self) -> Option<u32> {
        let Some(handle) = self.free.pop() else {
            tracing::trace!(policy = P::NAME, capacity = self.capacity(), "index allocator exhausted");
            return None;
        };
        P::counter_add(&self.outstanding, 1);
        Some(handle)
    }

    /// Returns a handle.
    ///
    /// # Panics
    ///
    /// Panics if `index` was never a handle of this allocator, if more
    /// handles are returned than were handed out, or if `index` is returned
    /// twice in a row.
    #[inline]
    pub fn deallocate(&self, index: u32) {
        if !self.owns(index) {
            tracing::error!(index, capacity = self.capacity(), "foreign handle returned");
            panic!("handle {index} does not belong to this index allocator");
        }
        let previous = P::counter_sub(&self.outstanding, 1);
        if previous == 0 {
            tracing::error!(index, "index deallocation without allocation");
            panic!("index allocator freed more handles than it allocated");
        }
        self.free.push(index);
    }

    /// Returns true if `index` is in `0..capacity`.
    #[inline]
    #[must_use]
    pub fn owns(&self, index: u32) -> bool {
        index < self.free.links().capacity()
    }

    /// Counts free handles by walking the freelist. Diagnostic only: O(n).
    #[must_use]
    pub fn count_free(&self) -> usize {
        self.free.count_free()
    }

    /// Counts allocated handles by walking the freelist. Diagnostic only: O(n).
    #[must_use]
    pub fn size(&self) -> usize {
        self.capacity() - self.count_free()
    }

    /// Returns every handle to the free state.
    ///
    /// Exclusive access guarantees no allocate or deallocate is in flight.
    /// Handles held by callers become invalid.
    pub fn reset(&mut self) {
        self.free.reset();
        self.outstanding = P::new_counter(0);
        tracing::debug!(policy = P::NAME, capacity = self.capacity(), "index allocator reset");
    }

    /// Releases the link storage. Equivalent to dropping the allocator.
    ///
    /// # Panics
    ///
    /// Panics if handles are still allocated.
    pub fn deinitialize(self) {
        tracing::debug!(policy = P::NAME, capacity = self.capacity(), "index allocator deinitialized");
        drop(self);
    }
}

impl<P: SyncPolicy> Drop for IndexAllocator<'_, P> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let live = self.size();
        if live != 0 {
            tracing::error!(live, "index allocator dropped with live handles");
            panic!("index allocator dropped with {live} live handles");
        }
    }
}

impl<P: SyncPolicy> std::fmt::Debug for IndexAllocator<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexAllocator")
            .field("policy", &P::NAME)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}
