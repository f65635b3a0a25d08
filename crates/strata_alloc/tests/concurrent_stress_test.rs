//! Multi-threaded stress tests for the lock-free allocators.
//!
//! Every worker records ownership in a shared bitmap. Claiming an index that
//! is already marked live means two threads were handed the same slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use strata_alloc::spsc;
use strata_alloc::{ConcurrentBlockPool, ConcurrentIndexAllocator, HeapArena};

const THREADS: usize = 8;
const CYCLES: usize = 20_000;

fn ownership_bitmap(capacity: usize) -> Vec<AtomicBool> {
    (0..capacity).map(|_| AtomicBool::new(false)).collect()
}

fn claim(live: &[AtomicBool], index: u32) {
    let was_live = live[index as usize].swap(true, Ordering::SeqCst);
    assert!(!was_live, "index {index} handed out twice");
}

fn release(live: &[AtomicBool], index: u32) {
    let was_live = live[index as usize].swap(false, Ordering::SeqCst);
    assert!(was_live, "index {index} released while not held");
}

#[test]
fn test_block_pool_no_duplicate_live_slots() {
    const CAPACITY: usize = 64;
    const BLOCK: usize = 32;

    let mut arena = HeapArena::new(ConcurrentBlockPool::required_bytes(BLOCK, CAPACITY));
    let pool = ConcurrentBlockPool::initialize(arena.as_bytes_mut(), BLOCK, CAPACITY).unwrap();
    let live = ownership_bitmap(CAPACITY);

    thread::scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            let live = &live;
            s.spawn(move || {
                let mut held = Vec::with_capacity(8);
                for i in 0..CYCLES {
                    if held.len() < 8 {
                        if let Some(ptr) = pool.allocate() {
                            let index = pool.index_of(ptr.as_ptr()).unwrap();
                            claim(live, index);
                            held.push(index);
                        }
                    }
                    if (i + t) % 3 == 0 {
                        if let Some(index) = held.pop() {
                            release(live, index);
                            pool.deallocate_index(index);
                        }
                    }
                }
                for index in held {
                    release(live, index);
                    pool.deallocate_index(index);
                }
            });
        }
    });

    assert_eq!(pool.size(), 0);
    assert_eq!(pool.free_count(), CAPACITY);
}

#[test]
fn test_block_pool_never_exceeds_capacity() {
    const CAPACITY: usize = 16;

    let mut arena = HeapArena::new(ConcurrentBlockPool::required_bytes(8, CAPACITY));
    let pool = ConcurrentBlockPool::initialize(arena.as_bytes_mut(), 8, CAPACITY).unwrap();

    // Every thread grabs as much as it can; the total must be exactly the capacity.
    let grabbed: Vec<Vec<u32>> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| s.spawn(|| std::iter::from_fn(|| pool.allocate_index()).collect::<Vec<_>>()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let mut all: Vec<u32> = grabbed.into_iter().flatten().collect();
    assert_eq!(all.len(), CAPACITY);
    assert!(pool.is_full());
    assert_eq!(pool.allocate_index(), None);

    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), CAPACITY);
    for index in all {
        pool.deallocate_index(index);
    }
}

#[test]
fn test_index_allocator_no_duplicate_live_handles() {
    const CAPACITY: usize = 32;

    let mut links = vec![0u32; CAPACITY];
    let handles = ConcurrentIndexAllocator::initialize(&mut links, CAPACITY).unwrap();
    let live = ownership_bitmap(CAPACITY);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let handles = &handles;
            let live = &live;
            s.spawn(move || {
                for _ in 0..CYCLES {
                    if let Some(handle) = handles.allocate() {
                        claim(live, handle);
                        std::hint::spin_loop();
                        release(live, handle);
                        handles.deallocate(handle);
                    }
                }
            });
        }
    });

    assert_eq!(handles.count_free(), CAPACITY);
}

#[test]
fn test_spsc_preserves_sequence_across_threads() {
    const COUNT: u64 = 100_000;

    let (mut tx, mut rx) = spsc::channel::<u64>(64);

    let producer = thread::spawn(move || {
        for value in 0..COUNT {
            let mut pending = value;
            while let Err(back) = tx.push(pending) {
                pending = back;
                std::hint::spin_loop();
            }
        }
    });

    let mut expected = 0;
    while expected < COUNT {
        if let Some(value) = rx.try_pop() {
            assert_eq!(value, expected);
            expected += 1;
        } else {
            std::hint::spin_loop();
        }
    }

    producer.join().unwrap();
    assert_eq!(rx.try_pop(), None);
}
