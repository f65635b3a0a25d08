//! Freelist links embedded in free slots.
//!
//! Every slot is `stride` bytes. While a slot is free, its first four bytes
//! hold the index of the next free slot. This module is the only place that
//! reads or writes those bytes; callers uphold that only free slots are
//! touched through it.
//!
//! Links are accessed as `AtomicU32`. A lock-free pop may read the link of a
//! slot that another thread has just popped and started writing to; its CAS
//! then fails on the generation tag and the value it read is discarded.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::policy::NIL;

/// Bytes occupied by one link.
pub(crate) const LINK_BYTES: usize = std::mem::size_of::<u32>();

/// Raw view of `capacity` slots of `stride` bytes each.
pub(crate) struct Links<'a> {
    base: NonNull<u8>,
    stride: usize,
    capacity: u32,
    _arena: PhantomData<&'a mut [u8]>,
}

// SAFETY: `Links` only hands out atomic access to link words; the arena
// itself is exclusively borrowed for `'a`.
unsafe impl Send for Links<'_> {}
// SAFETY: as above, concurrent link access is atomic.
unsafe impl Sync for Links<'_> {}

impl<'a> Links<'a> {
    /// Takes over `memory` as slot storage.
    ///
    /// # Panics
    ///
    /// Panics if the caller skipped validation: `stride` must be a non-zero
    /// multiple of four, the base four-byte aligned, and `memory` at least
    /// `stride * capacity` bytes long.
    pub(crate) fn new(memory: &'a mut [u8], stride: usize, capacity: u32) -> Self {
        assert!(stride >= LINK_BYTES && stride % LINK_BYTES == 0);
        assert!(memory.as_ptr() as usize % std::mem::align_of::<AtomicU32>() == 0);
        assert!(memory.len() >= stride * capacity as usize);
        assert!(capacity < NIL);

        let base = NonNull::from(memory).cast::<u8>();
        Self {
            base,
            stride,
            capacity,
            _arena: PhantomData,
        }
    }

    #[inline]
    pub(crate) const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub(crate) const fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    fn link(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity keeps the slot inside the borrowed arena,
        // and the base and stride are four-byte aligned (checked in `new`).
        unsafe {
            &*self
                .base
                .as_ptr()
                .add(index as usize * self.stride)
                .cast::<AtomicU32>()
        }
    }

    /// Reads the next-free index stored in a free slot.
    #[inline]
    pub(crate) fn next(&self, index: u32) -> u32 {
        self.link(index).load(Ordering::Relaxed)
    }

    /// Stores the next-free index into a slot being returned.
    #[inline]
    pub(crate) fn set_next(&self, index: u32, next: u32) {
        self.link(index).store(next, Ordering::Relaxed);
    }

    /// Chains every slot as `0 -> 1 -> ... -> capacity-1 -> NIL`.
    pub(crate) fn chain_all(&mut self) {
        for index in 0..self.capacity {
            let next = if index + 1 == self.capacity { NIL } else { index + 1 };
            self.set_next(index, next);
        }
    }

    /// Address of the first byte of a slot.
    #[inline]
    pub(crate) fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity keeps the offset inside the arena, which
        // is non-null, so the result is non-null as well.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.stride)) }
    }

    /// Maps a pointer back to its slot index.
    ///
    /// Returns `None` for pointers outside the slot range or not on a slot
    /// boundary.
    #[inline]
    pub(crate) fn index_of(&self, ptr: *const u8) -> Option<u32> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        if offset % self.stride != 0 {
            return None;
        }
        let index = offset / self.stride;
        if index >= self.capacity as usize {
            return None;
        }
        u32::try_from(index).ok()
    }
}
