use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::BuddyBlockPool;
use crate::error::Error;

const KIB: u32 = 1024;

fn pool_64k() -> BuddyBlockPool {
    BuddyBlockPool::init(64 * KIB, 16 * KIB, 512).unwrap()
}

#[test]
fn test_init_rejects_bad_block_sizes() {
    assert_eq!(
        BuddyBlockPool::init(64 * KIB, 0, 512).unwrap_err(),
        Error::ErrInvalidParameter
    );
    assert_eq!(
        BuddyBlockPool::init(64 * KIB, 12 * KIB, 512).unwrap_err(),
        Error::ErrInvalidParameter
    );
    assert_eq!(
        BuddyBlockPool::init(64 * KIB, 16 * KIB, 500).unwrap_err(),
        Error::ErrInvalidParameter
    );
    assert_eq!(
        BuddyBlockPool::init(64 * KIB, 512, 16 * KIB).unwrap_err(),
        Error::ErrInvalidParameter
    );
    // Pool smaller than one max block.
    assert_eq!(
        BuddyBlockPool::init(8 * KIB, 16 * KIB, 512).unwrap_err(),
        Error::ErrInsufficientMemory
    );
}

#[test]
fn test_exhaustion_and_reuse() {
    let mut pool = pool_64k();

    let mut blocks = Vec::new();
    for _ in 0..4 {
        blocks.push(pool.alloc(16 * KIB).expect("pool should hold 4 blocks"));
    }
    assert_eq!(pool.alloc(16 * KIB), None);
    assert_eq!(pool.alloc(512), None);

    for addr in &blocks {
        pool.free(*addr, 16 * KIB);
    }
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.max_free_block(), 16 * KIB);

    // The whole pool is usable again.
    for _ in 0..4 {
        assert!(pool.alloc(16 * KIB).is_some());
    }
}

#[test]
fn test_allocations_do_not_overlap() {
    let mut pool = pool_64k();
    let a = pool.alloc(4 * KIB).unwrap();
    let b = pool.alloc(4 * KIB).unwrap();
    let c = pool.alloc(16 * KIB).unwrap();
    let regions = [(a, 4 * KIB), (b, 4 * KIB), (c, 16 * KIB)];
    for (i, (start, len)) in regions.iter().enumerate() {
        for (other_start, other_len) in regions.iter().skip(i + 1) {
            let disjoint =
                start + len <= *other_start || other_start + other_len <= *start;
            assert!(disjoint, "regions overlap");
        }
    }
}

#[test]
fn test_partial_sizes_restore_the_pool() {
    let mut pool = pool_64k();

    // Sizes that are not powers of two, nor multiples of the minimum block.
    for size in [1u32, 500, 513, 5000, 12 * KIB, 16 * KIB - 1] {
        let addr = pool.alloc(size).expect("allocation failed");
        pool.free(addr, size);
        assert_eq!(pool.used(), 0);
        assert_eq!(
            pool.max_free_block(),
            16 * KIB,
            "pool not coalesced after freeing {} bytes",
            size
        );
    }
}

#[test]
fn test_buddies_coalesce_only_when_aligned() {
    let mut pool = pool_64k();

    // Carve one max block into two 8 KiB halves.
    let a = pool.alloc(8 * KIB).unwrap();
    let b = pool.alloc(8 * KIB).unwrap();
    // Freeing the unaligned half alone cannot rebuild a max block.
    let unaligned = if a % (16 * KIB) == 0 { b } else { a };
    let aligned = if unaligned == a { b } else { a };
    pool.free(unaligned, 8 * KIB);
    pool.free(aligned, 8 * KIB);
    assert_eq!(pool.max_free_block(), 16 * KIB);
}

#[test]
fn test_alloc_counters() {
    let mut pool = pool_64k();
    let addr = pool.alloc(2 * KIB).unwrap();
    assert_eq!(pool.alloc_count(), 1);
    pool.free(addr, 2 * KIB);
    assert_eq!(pool.free_count(), 1);
    assert_eq!(pool.peak_used(), 2 * KIB);
}

#[test]
fn test_random_alloc_free_conserves_bytes() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut pool = BuddyBlockPool::init(256 * KIB, 32 * KIB, 512).unwrap();
    let mut live: Vec<(u32, u32)> = Vec::new();

    for _ in 0..500 {
        if live.is_empty() || (rng.gen_bool(0.55) && live.len() < 64) {
            let size = rng.gen_range(1..=32 * KIB);
            if let Some(addr) = pool.alloc(size) {
                // New region must not overlap any live one.
                for (start, len) in &live {
                    let end = start + ((len + 511) / 512) * 512;
                    let new_end = addr + ((size + 511) / 512) * 512;
                    assert!(addr >= end || new_end <= *start, "pool handed out overlap");
                }
                live.push((addr, size));
            }
        } else {
            let index = rng.gen_range(0..live.len());
            let (addr, size) = live.swap_remove(index);
            pool.free(addr, size);
        }
        // alloc/free verify list order, alignment and byte conservation on
        // every call in test builds.
    }

    for (addr, size) in live {
        pool.free(addr, size);
    }
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.max_free_block(), 32 * KIB);
}
