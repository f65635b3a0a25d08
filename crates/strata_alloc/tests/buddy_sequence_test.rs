//! Randomized malloc/free sequences against the buddy allocator.
//!
//! Seeds are fixed so failures reproduce.

use std::ptr::NonNull;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_alloc::{BuddyAllocator, HeapArena};

const ARENA: usize = 64 * 1024;
const MIN_BLOCK: usize = 64;

fn run_sequence(seed: u64, steps: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut arena = HeapArena::new(ARENA);
    let mut book = HeapArena::new(BuddyAllocator::bookkeeping_bytes(ARENA, MIN_BLOCK).unwrap());
    let mut buddy = BuddyAllocator::create(arena.as_bytes_mut(), MIN_BLOCK, book.as_bytes_mut()).unwrap();

    let initial = buddy.max_free_block_size();
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for step in 0..steps {
        if live.is_empty() || rng.gen_bool(0.6) {
            let bytes = rng.gen_range(1..=4096);
            if let Some(ptr) = buddy.malloc(bytes) {
                let size = buddy.block_size(ptr).unwrap();
                assert!(size >= bytes && size.is_power_of_two());
                live.push((ptr, size));
            }
        } else {
            let victim = rng.gen_range(0..live.len());
            let (ptr, size) = live.swap_remove(victim);
            assert_eq!(buddy.block_size(ptr), Some(size));
            buddy.free(ptr);
        }

        if step % 64 == 0 {
            let stats = buddy.check_heap().unwrap_or_else(|e| panic!("seed {seed} step {step}: {e}"));
            assert_eq!(stats.used_blocks, live.len());
            assert_eq!(stats.used_bytes, live.iter().map(|&(_, size)| size).sum::<usize>());
        }
    }

    for (ptr, _) in live.drain(..) {
        buddy.free(ptr);
    }

    let stats = buddy.check_heap().unwrap();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(buddy.max_free_block_size(), initial);
}

#[test]
fn test_random_sequences_return_to_initial_state() {
    for seed in [1, 7, 42, 1337, 0xdead_beef] {
        run_sequence(seed, 2_000);
    }
}

#[test]
fn test_live_blocks_never_overlap() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut arena = HeapArena::new(ARENA);
    let mut book = HeapArena::new(BuddyAllocator::bookkeeping_bytes(ARENA, MIN_BLOCK).unwrap());
    let mut buddy = BuddyAllocator::create(arena.as_bytes_mut(), MIN_BLOCK, book.as_bytes_mut()).unwrap();

    let mut live = Vec::new();
    while let Some(ptr) = buddy.malloc(rng.gen_range(1..=1024)) {
        live.push(ptr);
    }

    let mut runs = Vec::new();
    buddy.walk_heap(|run| runs.push(run));
    let used_blocks: usize = runs.iter().filter(|run| run.used).map(|run| run.blocks).sum();
    assert_eq!(used_blocks, live.len());
    for pair in runs.windows(2) {
        assert_eq!(pair[0].offset + pair[0].size, pair[1].offset);
        assert_ne!(pair[0].used, pair[1].used);
    }

    for ptr in live {
        buddy.free(ptr);
    }
    assert_eq!(buddy.max_free_block_size(), ARENA);
}

#[test]
fn test_fill_with_min_blocks_then_drain() {
    let mut arena = HeapArena::new(4096);
    let mut book = HeapArena::new(BuddyAllocator::bookkeeping_bytes(4096, MIN_BLOCK).unwrap());
    let mut buddy = BuddyAllocator::create(arena.as_bytes_mut(), MIN_BLOCK, book.as_bytes_mut()).unwrap();

    let blocks: Vec<_> = std::iter::from_fn(|| buddy.malloc(1)).collect();
    assert_eq!(blocks.len(), 4096 / MIN_BLOCK);
    assert_eq!(buddy.free_bytes(), 0);

    // Free odd blocks first so no buddy pair completes until the second pass.
    for ptr in blocks.iter().skip(1).step_by(2) {
        buddy.free(*ptr);
    }
    assert_eq!(buddy.max_free_block_size(), MIN_BLOCK);
    for ptr in blocks.iter().step_by(2) {
        buddy.free(*ptr);
    }
    assert_eq!(buddy.max_free_block_size(), 4096);
}
