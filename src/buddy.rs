#[cfg(test)]
mod buddy_test;

use std::sync::Arc;

use log::warn;

use crate::error::{Error, Result};
use crate::memory::storage::PoolStorage;

const MAX_LEVELS: usize = 32;
/// Embedded free-list terminator.
const NIL: u32 = u32::MAX;

/// Power-of-two block allocator over a fixed pre-reserved region.
///
/// The pool keeps one free list per level (block size `min << level`), each a
/// singly-linked list sorted by address whose next-offset header lives inside
/// the free memory itself. Allocations of arbitrary size are carved from the
/// smallest satisfying block, the unused tail split back into the lower
/// levels; frees reconstruct the block set covering the freed region and
/// coalesce with naturally-aligned buddies.
pub(crate) struct BuddyBlockPool {
    storage: Arc<PoolStorage>,
    pool_size: u32,
    max_block_size: u32,
    min_block_size: u32,
    shift_min: u32,
    num_levels: u32,
    free_heads: [u32; MAX_LEVELS],
    free_counts: [u32; MAX_LEVELS],

    used: u32,
    internal_frag: u32,
    allocs: u32,
    frees: u32,
    peak_used: u32,
}

impl std::fmt::Debug for BuddyBlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyBlockPool").finish()
    }
}

impl BuddyBlockPool {
    pub fn init(pool_size: u32, max_block_size: u32, min_block_size: u32) -> Result<BuddyBlockPool> {
        if max_block_size == 0
            || !max_block_size.is_power_of_two()
            || min_block_size == 0
            || !min_block_size.is_power_of_two()
            || min_block_size > max_block_size
        {
            return Err(Error::ErrInvalidParameter);
        }

        let shift_min = min_block_size.trailing_zeros();
        let num_levels = max_block_size.trailing_zeros() - shift_min + 1;
        if num_levels as usize > MAX_LEVELS {
            return Err(Error::ErrInvalidParameter);
        }

        let pool_size = (pool_size / max_block_size) * max_block_size;
        if pool_size == 0 {
            return Err(Error::ErrInsufficientMemory);
        }

        let storage = match PoolStorage::new(pool_size, min_block_size) {
            Some(storage) => Arc::new(storage),
            None => {
                warn!("could not reserve {} bytes of I/O memory", pool_size);
                return Err(Error::ErrInsufficientMemory);
            }
        };

        let mut pool = BuddyBlockPool {
            storage,
            pool_size,
            max_block_size,
            min_block_size,
            shift_min,
            num_levels,
            free_heads: [NIL; MAX_LEVELS],
            free_counts: [0; MAX_LEVELS],
            used: 0,
            internal_frag: 0,
            allocs: 0,
            frees: 0,
            peak_used: 0,
        };

        // Seed the top level with one block per max-size slot, kept sorted by
        // inserting from the highest address down.
        let top = pool.largest_level();
        let mut addr = pool_size - max_block_size;
        loop {
            pool.push_front(top, addr);
            if addr == 0 {
                break;
            }
            addr -= max_block_size;
        }

        Ok(pool)
    }

    pub fn storage(&self) -> &Arc<PoolStorage> {
        &self.storage
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn alloc_count(&self) -> u32 {
        self.allocs
    }

    pub fn free_count(&self) -> u32 {
        self.frees
    }

    pub fn peak_used(&self) -> u32 {
        self.peak_used
    }

    pub fn alloc(&mut self, num_bytes: u32) -> Option<u32> {
        if num_bytes == 0 || num_bytes > self.max_block_size {
            return None;
        }

        let addr = self.subdivide(num_bytes)?;

        self.internal_frag += self.min_remainder(num_bytes);
        self.allocs += 1;
        self.used += num_bytes;
        if self.used > self.peak_used {
            self.peak_used = self.used;
        }
        self.check_pool();
        Some(addr)
    }

    pub fn free(&mut self, addr: u32, num_bytes: u32) {
        debug_assert!(num_bytes <= self.max_block_size);
        debug_assert!(addr < self.pool_size);

        self.coalesce_mem(addr, num_bytes);

        self.internal_frag -= self.min_remainder(num_bytes);
        self.frees += 1;
        self.used -= num_bytes;
        self.check_pool();
    }

    // Level geometry.

    fn largest_level(&self) -> u32 {
        self.num_levels - 1
    }

    fn block_size_for_level(&self, level: u32) -> u32 {
        debug_assert!(level < self.num_levels);
        1u32 << (self.shift_min + level)
    }

    fn level_bit(&self, level: u32) -> u64 {
        1u64 << (self.shift_min + level)
    }

    /// Offset, relative to the allocation start, of the last level-aligned
    /// boundary covered by an allocation of `alloc_size` bytes.
    fn alloc_block_offset(&self, level: u32, alloc_size: u32) -> u32 {
        (alloc_size as u64 & !(((self.level_bit(level) << 1) - 1) as u64)) as u32
    }

    /// Offset of the free sub-block at `level` within a max-size block, for
    /// an allocation of `alloc_size` bytes carved at its start.
    fn free_block_offset(&self, level: u32, alloc_size: u32) -> u32 {
        let tail = (self.max_block_size - alloc_size) as u64 & !(self.level_bit(level) - 1);
        self.max_block_size - tail as u32
    }

    fn alloc_sub_block_size(&self, level: u32, alloc_size: u32) -> u32 {
        (alloc_size as u64 & self.level_bit(level)) as u32
    }

    fn free_sub_block_size(&self, level: u32, alloc_size: u32) -> u32 {
        ((self.max_block_size - alloc_size) as u64 & self.level_bit(level)) as u32
    }

    fn remainder_alloc_size(&self, level: u32, alloc_size: u32) -> u32 {
        (alloc_size as u64 & (self.level_bit(level) - 1)) as u32
    }

    /// Bytes lost below the minimum block size for an allocation of
    /// `alloc_size` bytes.
    fn min_remainder(&self, alloc_size: u32) -> u32 {
        (self.min_block_size - (alloc_size % self.min_block_size)) % self.min_block_size
    }

    // Embedded free lists.

    fn next_of(&self, block: u32) -> u32 {
        self.storage.read_header(block)
    }

    fn set_next(&mut self, block: u32, next: u32) {
        self.storage.write_header(block, next);
    }

    fn push_front(&mut self, level: u32, block: u32) {
        let head = self.free_heads[level as usize];
        self.set_next(block, head);
        self.free_heads[level as usize] = block;
        self.free_counts[level as usize] += 1;
    }

    fn pop_front(&mut self, level: u32) -> Option<u32> {
        let head = self.free_heads[level as usize];
        if head == NIL {
            return None;
        }
        self.free_heads[level as usize] = self.next_of(head);
        self.free_counts[level as usize] -= 1;
        Some(head)
    }

    /// Finds the insertion point for `block`: returns `(prev, next)` where
    /// `next` is the first list entry greater than `block`.
    fn find_spot(&self, level: u32, block: u32) -> (u32, u32) {
        let mut prev = NIL;
        let mut cur = self.free_heads[level as usize];
        while cur != NIL && cur < block {
            prev = cur;
            cur = self.next_of(cur);
        }
        (prev, cur)
    }

    fn insert_after(&mut self, level: u32, prev: u32, block: u32, next: u32) {
        self.set_next(block, next);
        if prev == NIL {
            self.free_heads[level as usize] = block;
        } else {
            self.set_next(prev, block);
        }
        self.free_counts[level as usize] += 1;
    }

    fn insert_sorted(&mut self, level: u32, block: u32) {
        let (prev, next) = self.find_spot(level, block);
        self.insert_after(level, prev, block, next);
    }

    fn unlink(&mut self, level: u32, prev: u32, block: u32) {
        let next = self.next_of(block);
        if prev == NIL {
            debug_assert_eq!(self.free_heads[level as usize], block);
            self.free_heads[level as usize] = next;
        } else {
            self.set_next(prev, next);
        }
        self.free_counts[level as usize] -= 1;
    }

    // Allocation path.

    fn subdivide(&mut self, size_needed: u32) -> Option<u32> {
        let mut level = None;
        for l in 0..self.num_levels {
            if self.block_size_for_level(l) >= size_needed && self.free_heads[l as usize] != NIL {
                level = Some(l);
                break;
            }
        }
        let level = level?;
        let addr = self.pop_front(level)?;

        // Walk back down, splitting: wherever the unused tail crosses a lower
        // level boundary, insert that sub-block back into its free list.
        let mut l = level;
        while l > 0 {
            l -= 1;
            if self.free_sub_block_size(l, size_needed) != 0 {
                let free_block = addr + self.free_block_offset(l, size_needed);
                self.insert_sorted(l, free_block);
            }
        }

        Some(addr)
    }

    // Free path.

    fn coalesce_mem(&mut self, addr: u32, bytes_to_free: u32) {
        let mut level = 0;
        while self.remainder_alloc_size(level + 1, bytes_to_free) == 0 {
            level += 1;
        }

        // When the tail of the allocation partially fills a second block at
        // this level, that second block becomes a floating block to merge.
        let mut floating = if self.alloc_sub_block_size(level, bytes_to_free) != 0
            && self.remainder_alloc_size(level, bytes_to_free) != 0
        {
            Some(
                addr + self.alloc_block_offset(level, bytes_to_free)
                    + self.block_size_for_level(level),
            )
        } else {
            None
        };

        floating = self.join_allocd_block(level, floating, addr, bytes_to_free);

        level += 1;
        while level < self.largest_level() && self.block_size_for_level(level) < bytes_to_free {
            if self.alloc_sub_block_size(level, bytes_to_free) != 0 {
                floating = self.join_allocd_block(level, floating, addr, bytes_to_free);
            } else if floating.is_some() && self.free_sub_block_size(level, bytes_to_free) != 0 {
                floating = self.join_free_block(level, floating.unwrap());
            }
            level += 1;
        }

        if let Some(block) = floating {
            self.coalesce_block(level, block);
        }
    }

    /// Joins the level-sized piece of the freed allocation with the floating
    /// block to its right, if any. Returns the new floating block.
    fn join_allocd_block(
        &mut self,
        level: u32,
        right: Option<u32>,
        addr: u32,
        mem_size: u32,
    ) -> Option<u32> {
        let left = addr + self.alloc_block_offset(level, mem_size);

        if right.is_none() {
            if level < self.largest_level() && self.block_size_for_level(level + 1) < mem_size {
                return self.join_free_block(level, left);
            }
            // At the highest relevant level: full recursive coalesce.
            self.coalesce_block(level, left);
            return None;
        }

        Some(left)
    }

    /// Tries to absorb the free neighbor to the right of `block`. Returns the
    /// grown block, or inserts `block` and returns `None` when the buddy is
    /// in use.
    fn join_free_block(&mut self, level: u32, block: u32) -> Option<u32> {
        let (prev, next) = self.find_spot(level, block);

        if level < self.largest_level()
            && next != NIL
            && next - block == self.block_size_for_level(level)
        {
            self.unlink(level, prev, next);
            Some(block)
        } else {
            self.insert_after(level, prev, block, next);
            None
        }
    }

    fn coalesce_block(&mut self, level: u32, block: u32) {
        let (prev, next) = self.find_spot(level, block);

        if level < self.largest_level() {
            let size_above = self.block_size_for_level(level + 1);
            let size_here = self.block_size_for_level(level);

            if prev != NIL && (prev & (size_above - 1)) == 0 && block - prev == size_here {
                // prev is the naturally-aligned left buddy.
                let (pp, _) = self.find_spot(level, prev);
                self.unlink(level, pp, prev);
                self.coalesce_block(level + 1, prev);
                return;
            }
            if next != NIL && (block & (size_above - 1)) == 0 && next - block == size_here {
                // block is the naturally-aligned left buddy of next.
                self.unlink(level, prev, next);
                self.coalesce_block(level + 1, block);
                return;
            }
        }

        self.insert_after(level, prev, block, next);
    }

    /// Walks every free list verifying order, alignment and byte
    /// conservation. Compiled into debug and test builds only.
    #[cfg(any(test, debug_assertions))]
    pub fn check_pool(&self) {
        let mut total_free = 0u64;
        for level in 0..self.num_levels {
            let size = self.block_size_for_level(level);
            let mut count = 0u32;
            let mut prev = NIL;
            let mut cur = self.free_heads[level as usize];
            while cur != NIL {
                assert!(prev == NIL || prev < cur, "free list out of order");
                assert_eq!(cur % size, 0, "free block misaligned for its level");
                if prev != NIL && level < self.largest_level() {
                    let size_above = self.block_size_for_level(level + 1);
                    assert!(
                        (prev % size_above) != 0 || cur - prev != size,
                        "coalescible buddies left split"
                    );
                }
                total_free += size as u64;
                count += 1;
                prev = cur;
                cur = self.next_of(cur);
            }
            assert_eq!(count, self.free_counts[level as usize]);
        }
        assert_eq!(
            self.used as u64 + self.internal_frag as u64 + total_free,
            self.pool_size as u64,
            "pool bytes not conserved"
        );
    }

    #[cfg(not(any(test, debug_assertions)))]
    #[inline]
    pub fn check_pool(&self) {}

    /// Size of the largest free block, for monitoring.
    #[allow(dead_code)]
    pub fn max_free_block(&self) -> u32 {
        for level in (0..self.num_levels).rev() {
            if self.free_heads[level as usize] != NIL {
                return self.block_size_for_level(level);
            }
        }
        0
    }
}
