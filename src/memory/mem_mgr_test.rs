use crate::config::DeviceSettings;
use crate::error::Error;
use crate::memory::block::BlockState;
use crate::memory::mem_mgr::IoMemMgr;

const KIB: u32 = 1024;

fn mgr(pool_size: u32, granularity: u32) -> IoMemMgr {
    let settings = DeviceSettings::default()
        .with_io_memory_size(pool_size)
        .with_granularity(granularity)
        .with_stream_cache(true);
    IoMemMgr::init(&settings).unwrap()
}

/// Acquires a block, tags it, and parks it on the free list, as a completed
/// transfer would.
fn cache_block(mgr: &mut IoMemMgr, file_id: u32, position: u64, size: u32) {
    let id = mgr.get_oldest_free_block(size, 512).expect("out of pool");
    mgr.tag_block(id, BlockState::Idle, Some(file_id), position, size);
    assert_eq!(mgr.release_block(id), 0);
}

#[test]
fn test_init_rejects_memory_smaller_than_granularity() {
    let settings = DeviceSettings::default()
        .with_io_memory_size(8 * KIB)
        .with_granularity(16 * KIB);
    assert_eq!(IoMemMgr::init(&settings).unwrap_err(), Error::ErrInvalidParameter);
}

#[test]
fn test_no_pool_disables_automatic_streaming() {
    let settings = DeviceSettings::default().with_io_memory_size(0);
    let mgr = IoMemMgr::init(&settings).unwrap();
    assert!(!mgr.has_pool());
    assert!(!mgr.use_cache());
}

#[test]
fn test_untagged_blocks_free_on_release() {
    let mut mgr = mgr(64 * KIB, 16 * KIB);
    let before = mgr.total_alloced();
    let id = mgr.get_oldest_free_block(16 * KIB, 512).unwrap();
    assert_eq!(mgr.block(id).ref_count, 1);
    assert_eq!(mgr.release_block(id), 0);
    // Not tagged: returned straight to the pool.
    assert_eq!(mgr.total_alloced(), before);
    assert_eq!(mgr.unreferenced_cached_bytes(), 0);
}

#[test]
fn test_tagged_blocks_stay_cached_on_release() {
    let mut mgr = mgr(64 * KIB, 16 * KIB);
    cache_block(&mut mgr, 1, 0, 16 * KIB);
    assert_eq!(mgr.unreferenced_cached_bytes(), 16 * KIB);
    assert_eq!(mgr.total_alloced(), 16 * KIB);

    let mut requested = 16 * KIB;
    let hit = mgr.get_cached_block(1, 0, 512, 512, false, &mut requested);
    let (id, offset) = hit.expect("cached data lost");
    assert_eq!(offset, 0);
    assert_eq!(requested, 16 * KIB);
    assert_eq!(mgr.block(id).ref_count, 1);
    assert_eq!(mgr.unreferenced_cached_bytes(), 0);
}

#[test]
fn test_cache_lookup_with_offset() {
    let mut mgr = mgr(64 * KIB, 16 * KIB);
    cache_block(&mut mgr, 1, 0, 16 * KIB);

    // A position inside the cached range is served from the same block.
    let mut requested = 16 * KIB;
    let (id, offset) = mgr
        .get_cached_block(1, 4 * KIB as u64, 512, 512, false, &mut requested)
        .expect("offset lookup failed");
    assert_eq!(offset, 4 * KIB);
    assert_eq!(requested, 12 * KIB);
    assert_eq!(mgr.release_block(id), 0);
}

#[test]
fn test_cache_lookup_misses() {
    let mut mgr = mgr(128 * KIB, 16 * KIB);
    cache_block(&mut mgr, 1, 0, 16 * KIB);
    cache_block(&mut mgr, 3, 32 * KIB as u64, 16 * KIB);

    let mut requested = 16 * KIB;
    // Wrong file.
    assert!(mgr
        .get_cached_block(2, 0, 512, 512, false, &mut requested)
        .is_none());
    // Right file, uncovered range.
    assert!(mgr
        .get_cached_block(1, 48 * KIB as u64, 512, 512, false, &mut requested)
        .is_none());
    // Too little data left before the end of the block.
    assert!(mgr
        .get_cached_block(1, (16 * KIB - 256) as u64, 512, 512, false, &mut requested)
        .is_none());
}

#[test]
fn test_cache_index_stays_sorted() {
    let mut mgr = mgr(256 * KIB, 16 * KIB);
    // Insert in an order that exercises the in-place move: same file with
    // descending-position key, plus neighbors on both sides.
    cache_block(&mut mgr, 2, 0, 16 * KIB);
    cache_block(&mut mgr, 2, 32 * KIB as u64, 16 * KIB);
    cache_block(&mut mgr, 1, 16 * KIB as u64, 16 * KIB);
    cache_block(&mut mgr, 3, 0, 16 * KIB);
    cache_block(&mut mgr, 2, 16 * KIB as u64, 16 * KIB);
    mgr.check_cache_consistency(None);

    // Each entry is retrievable.
    for (file, position) in [(2u32, 0u64), (2, 32 * KIB as u64), (1, 16 * KIB as u64), (3, 0)] {
        let mut requested = 16 * KIB;
        let (id, _) = mgr
            .get_cached_block(file, position, 512, 512, false, &mut requested)
            .unwrap_or_else(|| panic!("lost ({}, {})", file, position));
        assert_eq!(mgr.release_block(id), 0);
    }
}

#[test]
fn test_retagging_moves_the_entry() {
    let mut mgr = mgr(16 * KIB, 16 * KIB);
    cache_block(&mut mgr, 1, 0, 16 * KIB);

    // The single slot is recycled for new content: the old identity must be
    // replaced, not duplicated.
    let id = mgr.get_oldest_free_block(16 * KIB, 512).expect("reuse failed");
    mgr.tag_block(id, BlockState::Idle, Some(1), 16 * KIB as u64, 16 * KIB);
    mgr.check_cache_consistency(Some(id));
    assert_eq!(mgr.release_block(id), 0);

    let mut requested = 16 * KIB;
    assert!(mgr.get_cached_block(1, 0, 512, 512, false, &mut requested).is_none());
    assert!(mgr
        .get_cached_block(1, 16 * KIB as u64, 512, 512, false, &mut requested)
        .is_some());
}

#[test]
fn test_mis_sized_free_blocks_are_recycled() {
    let mut mgr = mgr(64 * KIB, 16 * KIB);
    cache_block(&mut mgr, 1, 0, 16 * KIB);
    cache_block(&mut mgr, 2, 0, 16 * KIB);
    cache_block(&mut mgr, 3, 0, 16 * KIB);
    cache_block(&mut mgr, 4, 0, 16 * KIB);

    // The pool is out of fresh memory and every free block has the wrong
    // bucket size: the manager must untag and recycle until it can serve.
    let id = mgr
        .get_oldest_free_block(8 * KIB, 512)
        .expect("recycling failed");
    assert_eq!(mgr.block(id).alloc_size, 8 * KIB);

    // The oldest entries were sacrificed first.
    let mut requested = 16 * KIB;
    assert!(mgr.get_cached_block(1, 0, 512, 512, false, &mut requested).is_none());
}

#[test]
fn test_memory_exhaustion_raises_mem_idle() {
    let mut mgr = mgr(16 * KIB, 16 * KIB);
    let held = mgr.get_oldest_free_block(16 * KIB, 512).unwrap();
    assert!(mgr.get_oldest_free_block(16 * KIB, 512).is_none());
    let (_, idle) = mgr.take_signals();
    assert!(idle);
    assert_eq!(mgr.release_block(held), 0);
    let (changed, _) = mgr.take_signals();
    assert!(changed);
}

#[test]
fn test_flush_cache_is_idempotent() {
    let mut mgr = mgr(64 * KIB, 16 * KIB);
    cache_block(&mut mgr, 1, 0, 16 * KIB);
    cache_block(&mut mgr, 2, 0, 16 * KIB);

    mgr.flush_cache();
    assert_eq!(mgr.unreferenced_cached_bytes(), 0);
    assert_eq!(mgr.total_alloced(), 0);
    let mut requested = 16 * KIB;
    assert!(mgr.get_cached_block(1, 0, 512, 512, false, &mut requested).is_none());

    // A second flush leaves identical state.
    mgr.flush_cache();
    assert_eq!(mgr.unreferenced_cached_bytes(), 0);
    assert_eq!(mgr.total_alloced(), 0);
}

#[test]
fn test_flush_cache_keeps_referenced_blocks() {
    let mut mgr = mgr(64 * KIB, 16 * KIB);
    let id = mgr.get_oldest_free_block(16 * KIB, 512).unwrap();
    mgr.tag_block(id, BlockState::Idle, Some(7), 0, 16 * KIB);

    mgr.flush_cache();
    // Still referenced: unfreed, but no longer addressable by identity.
    assert!(!mgr.block(id).is_tagged());
    assert_eq!(mgr.total_alloced(), 16 * KIB);
    assert_eq!(mgr.release_block(id), 0);
    assert_eq!(mgr.total_alloced(), 0);
}

#[test]
fn test_temp_clones_alias_and_die() {
    let mut mgr = mgr(64 * KIB, 16 * KIB);
    let base = mgr.get_oldest_free_block(16 * KIB, 512).unwrap();
    let clone = mgr.clone_temp_block(base);
    assert_ne!(base, clone);
    assert_eq!(mgr.block(clone).data, mgr.block(base).data);
    assert!(mgr.block(clone).temp);

    // Destroying the base through the temp path is a no-op.
    mgr.destroy_temp_block(base, base);
    mgr.destroy_temp_block(base, clone);
    assert_eq!(mgr.release_block(base), 0);
}
