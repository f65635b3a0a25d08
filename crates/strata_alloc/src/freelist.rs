//! Tagged intrusive freelist shared by pools and index allocators.
//!
//! A Treiber stack of slot indices. The links live in the free slots
//! ([`Links`]); the head is a [`TaggedHead`] replaced through the
//! [`SyncPolicy`] step, so the same code is the single-threaded and the
//! lock-free freelist.

use crate::link::Links;
use crate::policy::{SyncPolicy, TaggedHead, NIL};

pub(crate) struct FreeList<'a, P: SyncPolicy> {
    links: Links<'a>,
    head: P::Head,
}

impl<'a, P: SyncPolicy> FreeList<'a, P> {
    /// Builds a full freelist `0 -> 1 -> ... -> capacity-1`.
    pub(crate) fn new(mut links: Links<'a>) -> Self {
        links.chain_all();
        let first = if links.capacity() == 0 { NIL } else { 0 };
        Self {
            links,
            head: P::new_head(TaggedHead::new(first, 0)),
        }
    }

    #[inline]
    pub(crate) fn links(&self) -> &Links<'a> {
        &self.links
    }

    /// Snapshot of the head.
    #[inline]
    pub(crate) fn observe(&self) -> TaggedHead {
        P::load_head(&self.head)
    }

    /// Pops the most recently freed slot.
    #[inline]
    pub(crate) fn pop(&self) -> Option<u32> {
        let mut observed = self.observe();
        loop {
            if observed.is_nil() {
                return None;
            }
            let next = self.links.next(observed.index());
            match self.try_pop_step(observed, next) {
                Ok(index) => return Some(index),
                Err(current) => observed = current,
            }
        }
    }

    /// One pop attempt: swing the head from `observed` to `next`.
    ///
    /// `next` must have been read from `observed.index()`'s link after
    /// `observed` was loaded.
    #[inline]
    pub(crate) fn try_pop_step(&self, observed: TaggedHead, next: u32) -> Result<u32, TaggedHead> {
        P::replace_head(&self.head, observed, observed.successor(next)).map(|()| observed.index())
    }

    /// Pushes a slot back. The caller guarantees `index` is allocated.
    ///
    /// # Panics
    ///
    /// Panics if `index` is already the top of the freelist. Linking it
    /// again would close a one-slot cycle and hand the slot out forever.
    #[inline]
    pub(crate) fn push(&self, index: u32) {
        let mut observed = self.observe();
        loop {
            if observed.index() == index {
                tracing::error!(index, policy = P::NAME, "slot freed twice");
                panic!("slot {index} freed twice");
            }
            self.links.set_next(index, observed.index());
            match P::replace_head(&self.head, observed, observed.successor(index)) {
                Ok(()) => return,
                Err(current) => observed = current,
            }
        }
    }

    /// Walks the chain counting free slots.
    ///
    /// O(n). Under concurrent mutation the walk may follow a link that is
    /// being rewritten; it stops at `capacity` steps so the result is
    /// bounded but only approximate.
    pub(crate) fn count_free(&self) -> usize {
        let capacity = self.links.capacity();
        let mut count = 0usize;
        let mut cursor = self.observe().index();
        while cursor != NIL && cursor < capacity && count < capacity as usize {
            count += 1;
            cursor = self.links.next(cursor);
        }
        count
    }

    /// Rebuilds the full chain. Exclusive access means nothing is in flight.
    ///
    /// The generation keeps counting across resets so that heads observed
    /// before the reset can never match a head published after it.
    pub(crate) fn reset(&mut self) {
        let generation = self.observe().generation().wrapping_add(1);
        self.links.chain_all();
        let first = if self.links.capacity() == 0 { NIL } else { 0 };
        P::store_head(&mut self.head, TaggedHead::new(first, generation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Local, Shared};
    use std::sync::{Arc, Barrier};

    fn links(words: &mut [u32]) -> Links<'_> {
        let capacity = u32::try_from(words.len()).unwrap();
        Links::new(bytemuck::cast_slice_mut(words), 4, capacity)
    }

    #[test]
    fn test_lifo_order() {
        let mut words = [0u32; 3];
        let list: FreeList<'_, Local> = FreeList::new(links(&mut words));

        assert_eq!(list.pop(), Some(0));
        assert_eq!(list.pop(), Some(1));
        list.push(0);
        assert_eq!(list.pop(), Some(0));
        assert_eq!(list.pop(), Some(2));
        assert_eq!(list.pop(), None);
    }

    #[test]
    #[should_panic(expected = "slot 1 freed twice")]
    fn test_push_of_top_slot_panics() {
        let mut words = [0u32; 3];
        let list: FreeList<'_, Local> = FreeList::new(links(&mut words));

        assert_eq!(list.pop(), Some(0));
        assert_eq!(list.pop(), Some(1));
        list.push(1);
        list.push(1);
    }

    #[test]
    fn test_count_free_walks_chain() {
        let mut words = [0u32; 5];
        let list: FreeList<'_, Local> = FreeList::new(links(&mut words));
        assert_eq!(list.count_free(), 5);

        let a = list.pop().unwrap();
        let _b = list.pop().unwrap();
        assert_eq!(list.count_free(), 3);

        list.push(a);
        assert_eq!(list.count_free(), 4);
    }

    #[test]
    fn test_reset_keeps_generation_moving() {
        let mut words = [0u32; 2];
        let mut list: FreeList<'_, Shared> = FreeList::new(links(&mut words));
        let _ = list.pop();
        let before = list.observe();

        list.reset();
        let after = list.observe();
        assert_eq!(after.index(), 0);
        assert!(after.generation() > before.generation());
        assert_eq!(list.count_free(), 2);
    }

    /// Classic ABA: A reads head {0, g} and next = 1, then stalls.
    /// B pops 0, C pops 1, B pushes 0 back (0 now links to 2).
    /// An untagged CAS from A would install 1 as head while C owns it.
    #[test]
    fn test_aba_interleaving_is_rejected() {
        let mut words = [0u32; 4];
        let list: FreeList<'_, Shared> = FreeList::new(links(&mut words));

        // A: load head and next link, then "preempted".
        let observed_a = list.observe();
        let next_a = list.links().next(observed_a.index());
        assert_eq!((observed_a.index(), next_a), (0, 1));

        // B and C run to completion.
        let b = list.pop().unwrap();
        let c = list.pop().unwrap();
        assert_eq!((b, c), (0, 1));
        list.push(b);

        // Same raw index on top, different generation.
        let current = list.observe();
        assert_eq!(current.index(), observed_a.index());
        assert_ne!(current.generation(), observed_a.generation());

        // A resumes: its CAS must fail.
        assert_eq!(list.try_pop_step(observed_a, next_a), Err(current));

        // Retrying from the fresh head hands A slot 0 and leaves 2 on top,
        // never slot 1, which C still owns.
        assert_eq!(list.pop(), Some(0));
        assert_eq!(list.observe().index(), 2);
    }

    /// Same interleaving, forced across real threads with barriers.
    #[test]
    fn test_aba_interleaving_across_threads() {
        let mut words = [0u32; 4];
        let list: FreeList<'_, Shared> = FreeList::new(links(&mut words));
        let observed = Arc::new(Barrier::new(2));
        let others_done = Arc::new(Barrier::new(2));

        std::thread::scope(|scope| {
            let thread_a = {
                let observed = Arc::clone(&observed);
                let others_done = Arc::clone(&others_done);
                let list = &list;
                scope.spawn(move || {
                    let head = list.observe();
                    let next = list.links().next(head.index());
                    observed.wait();
                    others_done.wait();
                    list.try_pop_step(head, next)
                })
            };

            observed.wait();
            let b = scope.spawn(|| list.pop()).join().unwrap().unwrap();
            let c = scope.spawn(|| list.pop()).join().unwrap().unwrap();
            assert_ne!(b, c);
            {
                let list = &list;
                scope.spawn(move || list.push(b)).join().unwrap();
            }
            others_done.wait();

            let result = thread_a.join().unwrap();
            assert!(result.is_err(), "stale CAS must fail on generation mismatch");
        });
    }
}
