//! # Linear (Bump) Allocators
//!
//! Scratch allocation for data that lives exactly one engine tick:
//!
//! ```text
//! arena: [ used ........... | free .................. ]
//!        ^ base             ^ head                    ^ end
//! ```
//!
//! `allocate` aligns the head up, reserves `bytes` and returns the aligned
//! position. There is no per-object free; `reset` rewinds the whole arena.
//!
//! The concurrent variant reserves with a CAS loop on the head offset. The
//! head only moves forward between resets, so an offset is never reused
//! while a CAS is pending and no generation tag is needed.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Borrowed arena geometry shared by both bump allocators.
struct Span<'a> {
    base: NonNull<u8>,
    capacity: usize,
    _arena: PhantomData<&'a mut [u8]>,
}

// SAFETY: a `Span` never reads or writes the arena; it only computes
// pointers into it. The arena is exclusively borrowed for `'a`.
unsafe impl Send for Span<'_> {}
// SAFETY: as above.
unsafe impl Sync for Span<'_> {}

impl<'a> Span<'a> {
    fn new(memory: &'a mut [u8]) -> Self {
        Self {
            capacity: memory.len(),
            base: NonNull::from(memory).cast::<u8>(),
            _arena: PhantomData,
        }
    }

    /// Offsets `(start, end)` of a `bytes`-long reservation aligned to
    /// `align` if the head is at `head`.
    #[inline]
    fn fit(&self, head: usize, bytes: usize, align: usize) -> Option<(usize, usize)> {
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let addr = self.base.as_ptr() as usize;
        let aligned = addr.checked_add(head)?.checked_add(align - 1)? & !(align - 1);
        let start = aligned - addr;
        let end = start.checked_add(bytes)?;
        (end <= self.capacity).then_some((start, end))
    }

    #[inline]
    fn ptr(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity);
        // SAFETY: `fit` keeps offsets within `0..=capacity`, so the result is
        // inside or one past the end of the non-null arena.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }
}

/// Single-threaded bump allocator.
///
/// Allocation takes `&self`, so many scratch pointers can be live at once;
/// `reset` takes `&mut self`, so none of them can outlive the epoch through
/// a borrow of the allocator. Not `Sync`.
pub struct LinearAllocator<'a> {
    span: Span<'a>,
    head: Cell<usize>,
    high_water: usize,
}

impl<'a> LinearAllocator<'a> {
    /// Binds a bump allocator to `memory`. Any length is accepted.
    #[must_use]
    pub fn initialize(memory: &'a mut [u8]) -> Self {
        let span = Span::new(memory);
        tracing::debug!(capacity = span.capacity, "linear allocator initialized");
        Self {
            span,
            head: Cell::new(0),
            high_water: 0,
        }
    }

    /// Reserves `bytes` aligned to `align`.
    ///
    /// # Returns
    ///
    /// `None` if the arena cannot fit the request.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        let Some((start, end)) = self.span.fit(self.head.get(), bytes, align) else {
            tracing::trace!(bytes, align, used = self.used(), "linear allocator exhausted");
            return None;
        };
        self.head.set(end);
        Some(self.span.ptr(start))
    }

    /// Reserves space for `layout`.
    #[inline]
    pub fn allocate_layout(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.allocate(layout.size(), layout.align())
    }

    /// Rewinds to the start of the arena.
    pub fn reset(&mut self) {
        let used = self.head.replace(0);
        self.high_water = self.high_water.max(used);
        tracing::trace!(used, "linear allocator reset");
    }

    /// Bytes reserved since the last reset, including alignment padding.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.head.get()
    }

    /// Bytes left after the head.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.span.capacity - self.used()
    }

    /// Arena size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.span.capacity
    }

    /// Largest `used()` seen across all epochs.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water.max(self.used())
    }
}

impl std::fmt::Debug for LinearAllocator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}

/// Lock-free bump allocator, safe to share between threads.
///
/// # Example
///
/// ```rust
/// use strata_alloc::{ConcurrentLinearAllocator, HeapArena};
///
/// let mut arena = HeapArena::new(1024);
/// let mut scratch = ConcurrentLinearAllocator::initialize(arena.as_bytes_mut());
///
/// std::thread::scope(|s| {
///     for _ in 0..4 {
///         s.spawn(|| assert!(scratch.allocate(64, 8).is_some()));
///     }
/// });
/// assert_eq!(scratch.used(), 256);
/// scratch.reset();
/// ```
pub struct ConcurrentLinearAllocator<'a> {
    span: Span<'a>,
    head: AtomicUsize,
    high_water: usize,
}

impl<'a> ConcurrentLinearAllocator<'a> {
    /// Binds a bump allocator to `memory`. Any length is accepted.
    #[must_use]
    pub fn initialize(memory: &'a mut [u8]) -> Self {
        let span = Span::new(memory);
        tracing::debug!(capacity = span.capacity, "concurrent linear allocator initialized");
        Self {
            span,
            head: AtomicUsize::new(0),
            high_water: 0,
        }
    }

    /// Reserves `bytes` aligned to `align`.
    ///
    /// # Returns
    ///
    /// `None` if the arena cannot fit the request at the head observed by
    /// the final CAS attempt.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        // The head publishes no data, only disjoint reservations.
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let Some((start, end)) = self.span.fit(head, bytes, align) else {
                tracing::trace!(bytes, align, used = head, "concurrent linear allocator exhausted");
                return None;
            };
            match self
                .head
                .compare_exchange_weak(head, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(self.span.ptr(start)),
                Err(current) => head = current,
            }
        }
    }

    /// Reserves space for `layout`.
    #[inline]
    pub fn allocate_layout(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.allocate(layout.size(), layout.align())
    }

    /// Rewinds to the start of the arena.
    ///
    /// Exclusive access guarantees no allocation is in flight.
    pub fn reset(&mut self) {
        let used = std::mem::take(self.head.get_mut());
        self.high_water = self.high_water.max(used);
        tracing::trace!(used, "concurrent linear allocator reset");
    }

    /// Bytes reserved since the last reset. Advisory while other threads
    /// allocate.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    /// Bytes left after the head. Advisory while other threads allocate.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.span.capacity - self.used()
    }

    /// Arena size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.span.capacity
    }

    /// Largest `used()` seen across all epochs.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water.max(self.used())
    }
}

impl std::fmt::Debug for ConcurrentLinearAllocator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentLinearAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::HeapArena;

    #[test]
    fn test_alignment_padding() {
        let mut arena = HeapArena::new(256);
        let base = arena.as_bytes_mut().as_ptr() as usize;
        let scratch = LinearAllocator::initialize(arena.as_bytes_mut());

        let a = scratch.allocate(3, 1).unwrap();
        let b = scratch.allocate(8, 16).unwrap();
        assert_eq!(a.as_ptr() as usize - base, 0);
        assert_eq!(b.as_ptr() as usize - base, 16);
        assert_eq!(scratch.used(), 24);
        assert_eq!(scratch.remaining(), 232);
    }

    #[test]
    fn test_overflow_returns_none_without_moving_head() {
        let mut arena = HeapArena::new(64);
        let scratch = LinearAllocator::initialize(arena.as_bytes_mut());

        assert!(scratch.allocate(48, 8).is_some());
        assert!(scratch.allocate(32, 8).is_none());
        assert_eq!(scratch.used(), 48);
        assert!(scratch.allocate(16, 8).is_some());
        assert_eq!(scratch.remaining(), 0);
        assert!(scratch.allocate(usize::MAX, 1).is_none());
    }

    #[test]
    fn test_reset_tracks_high_water() {
        let mut arena = HeapArena::new(128);
        let mut scratch = LinearAllocator::initialize(arena.as_bytes_mut());

        let _ = scratch.allocate(100, 4);
        scratch.reset();
        assert_eq!(scratch.used(), 0);
        let _ = scratch.allocate(10, 4);
        assert_eq!(scratch.high_water_mark(), 100);
    }

    #[test]
    fn test_allocate_layout() {
        let mut arena = HeapArena::new(64);
        let scratch = ConcurrentLinearAllocator::initialize(arena.as_bytes_mut());
        let ptr = scratch.allocate_layout(Layout::new::<u64>()).unwrap();
        assert_eq!(ptr.as_ptr() as usize % std::mem::align_of::<u64>(), 0);
        assert_eq!(scratch.used(), 8);
    }

    #[test]
    #[should_panic(expected = "is not a power of two")]
    fn test_bad_alignment_panics() {
        let mut arena = HeapArena::new(64);
        let scratch = LinearAllocator::initialize(arena.as_bytes_mut());
        let _ = scratch.allocate(8, 3);
    }

    #[test]
    fn test_concurrent_reservations_are_disjoint() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 32;

        let mut arena = HeapArena::new(THREADS * PER_THREAD * 16);
        let base = arena.as_bytes_mut().as_ptr() as usize;
        let scratch = ConcurrentLinearAllocator::initialize(arena.as_bytes_mut());

        let mut offsets: Vec<usize> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| scratch.allocate(16, 16).unwrap().as_ptr() as usize - base)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), THREADS * PER_THREAD);
        assert!(scratch.allocate(1, 1).is_none());
    }
}
