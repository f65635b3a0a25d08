//! # SPSC Ring Buffer
//!
//! Fixed-capacity queue between exactly one producer thread and one
//! consumer thread. No locks and no CAS: each index has a single writer.
//!
//! ```text
//! Producer                               Consumer
//!    │ write slot                            │
//!    │ store(write + 1, Release) ──────────► │ load(write, Acquire)
//!    │                                       │ read slot
//!    │ load(read, Acquire) ◄──────────────── │ store(read + 1, Release)
//! ```
//!
//! The two roles are separate non-`Clone` handles, so a second producer or
//! consumer cannot be created. One slot stays empty to tell full from
//! empty; a ring of `capacity` slots holds `capacity - 1` items.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An index on its own cache line, so the two sides do not false-share.
#[repr(C, align(64))]
struct PaddedIndex(AtomicUsize);

struct Ring<T> {
    /// Next slot the producer writes. Written only by the producer.
    write: PaddedIndex,
    /// Next slot the consumer reads. Written only by the consumer.
    read: PaddedIndex,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is accessed by the producer only while it is outside
// `read..write`, and by the consumer only while inside. Ownership of each
// slot is handed over by the Release/Acquire pair on the indices.
unsafe impl<T: Send> Send for Ring<T> {}
// SAFETY: as above.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    #[inline]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn advance(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slot_count() {
            0
        } else {
            next
        }
    }

    fn len(&self) -> usize {
        let write = self.write.0.load(Ordering::Acquire);
        let read = self.read.0.load(Ordering::Acquire);
        (write + self.slot_count() - read) % self.slot_count()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let write = *self.write.0.get_mut();
        let mut read = *self.read.0.get_mut();
        while read != write {
            // SAFETY: slots in `read..write` hold initialized values, and
            // both handles are gone.
            unsafe { self.slots[read].get_mut().assume_init_drop() };
            read = self.advance(read);
        }
    }
}

/// Creates a ring of `capacity` slots, holding at most `capacity - 1` items.
///
/// # Panics
///
/// Panics if `capacity < 2`.
///
/// # Example
///
/// ```rust
/// let (mut tx, mut rx) = strata_alloc::spsc::channel::<u32>(4);
///
/// assert!(tx.push(7).is_ok());
/// assert_eq!(rx.try_pop(), Some(7));
/// assert_eq!(rx.try_pop(), None);
/// ```
#[must_use]
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity >= 2, "spsc ring needs at least 2 slots, got {capacity}");

    let slots = (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();
    let ring = Arc::new(Ring {
        write: PaddedIndex(AtomicUsize::new(0)),
        read: PaddedIndex(AtomicUsize::new(0)),
        slots,
    });
    tracing::debug!(capacity, "spsc ring created");

    (Producer { ring: Arc::clone(&ring) }, Consumer { ring })
}

/// Writing half of an SPSC ring.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    /// Enqueues `value`.
    ///
    /// # Errors
    ///
    /// Returns `value` back if the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let ring = &*self.ring;
        let write = ring.write.0.load(Ordering::Relaxed);
        let next = ring.advance(write);
        if next == ring.read.0.load(Ordering::Acquire) {
            return Err(value);
        }

        // SAFETY: `write` is outside `read..write`, so the consumer will not
        // touch it until the store below publishes it.
        unsafe { (*ring.slots[write].get()).write(value) };
        ring.write.0.store(next, Ordering::Release);
        Ok(())
    }

    /// Items currently queued. Advisory: the consumer may be draining.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns true if nothing is queued. Advisory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.slot_count() - 1
    }

    /// Returns true if the consumer has been dropped.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.ring) == 1
    }
}

/// Reading half of an SPSC ring.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    /// Dequeues the oldest item, or `None` if the ring is empty.
    pub fn try_pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let read = ring.read.0.load(Ordering::Relaxed);
        if read == ring.write.0.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: `read` is inside `read..write`; the Acquire load above
        // synchronizes with the producer's write of this slot.
        let value = unsafe { (*ring.slots[read].get()).assume_init_read() };
        ring.read.0.store(ring.advance(read), Ordering::Release);
        Some(value)
    }

    /// Items currently queued. Advisory: the producer may be filling.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns true if nothing is queued. Advisory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.slot_count() - 1
    }

    /// Returns true if the producer has been dropped.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.ring) == 1
    }
}

impl<T> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_push_pop_fifo() {
        let (mut tx, mut rx) = channel(8);
        for i in 0..5 {
            tx.push(i).unwrap();
        }
        assert_eq!(rx.len(), 5);
        let got: Vec<i32> = std::iter::from_fn(|| rx.try_pop()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_ring_returns_value() {
        let (mut tx, mut rx) = channel(3);
        assert_eq!(tx.capacity(), 2);
        tx.push('a').unwrap();
        tx.push('b').unwrap();
        assert_eq!(tx.push('c'), Err('c'));

        assert_eq!(rx.try_pop(), Some('a'));
        tx.push('c').unwrap();
        assert_eq!(rx.try_pop(), Some('b'));
        assert_eq!(rx.try_pop(), Some('c'));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_remaining_items_dropped_with_ring() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, mut rx) = channel(4);
        for _ in 0..3 {
            assert!(tx.push(DropCounter(Arc::clone(&drops))).is_ok());
        }
        drop(rx.try_pop());
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        drop(tx);
        assert!(rx.is_abandoned());
        drop(rx);
        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }

    #[test]
    #[should_panic(expected = "at least 2 slots")]
    fn test_single_slot_rejected() {
        let _ = channel::<u8>(1);
    }
}
