use std::sync::Arc;

use log::trace;
use slab::Slab;

use crate::buddy::BuddyBlockPool;
use crate::config::{DeviceSettings, ABSOLUTE_MIN_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::file::FileId;
use crate::memory::block::{BlockData, BlockId, BlockState, MemBlock};
use crate::memory::storage::PoolStorage;

#[inline]
fn round_to_block_size(requested: u32, alignment: u32) -> u32 {
    (((requested - 1) / alignment) + 1) * alignment
}

/// Manages a device's streaming I/O memory and data caching.
///
/// Not internally synchronized: every method must run under the device lock.
/// The manager records scheduler notifications (`mem_changed`, `mem_idle`)
/// for the device to drain after each call, still under the lock.
pub(crate) struct IoMemMgr {
    pool: Option<BuddyBlockPool>,
    blocks: Slab<MemBlock>,

    /// Free blocks (ref count 0), linked oldest-first so the buffer that has
    /// been free the longest is reused first.
    free_head: Option<BlockId>,
    free_tail: Option<BlockId>,

    /// Repository of tagged blocks, kept sorted for binary searching.
    /// Keys: file ID (increasing), file position (decreasing), data offset
    /// (increasing). The first two locate a suitable cached block; all three
    /// locate a unique block.
    cache_index: Vec<BlockId>,

    use_cache: bool,
    total_cached: u32,
    total_alloced: u32,
    pool_size: u32,
    peak_used: u32,
    allocs: u32,
    frees: u32,

    mem_changed: bool,
    mem_idle: bool,
}

impl std::fmt::Debug for IoMemMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoMemMgr").finish()
    }
}

impl IoMemMgr {
    pub fn init(settings: &DeviceSettings) -> Result<IoMemMgr> {
        let num_buffers = settings.io_memory_size / settings.granularity;
        let memory_size = num_buffers * settings.granularity;

        let mut pool = None;
        if memory_size > 0 {
            let mut min_block_size = ABSOLUTE_MIN_BLOCK_SIZE;
            while min_block_size < settings.io_memory_alignment {
                min_block_size <<= 1;
            }
            let mut max_block_size = min_block_size;
            while max_block_size < settings.granularity {
                max_block_size <<= 1;
            }

            pool = Some(BuddyBlockPool::init(
                memory_size,
                max_block_size,
                min_block_size,
            )?);
        } else if settings.io_memory_size > 0 {
            // I/O memory size is smaller than the granularity.
            return Err(Error::ErrInvalidParameter);
        }
        // Otherwise the device does not support automatic streams.

        let use_cache = settings.use_stream_cache && pool.is_some();
        Ok(IoMemMgr {
            pool,
            blocks: Slab::with_capacity(num_buffers as usize),
            free_head: None,
            free_tail: None,
            cache_index: Vec::with_capacity(num_buffers as usize),
            use_cache,
            total_cached: 0,
            total_alloced: 0,
            pool_size: memory_size,
            peak_used: 0,
            allocs: 0,
            frees: 0,
            mem_changed: false,
            mem_idle: false,
        })
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    pub fn storage(&self) -> Option<&Arc<PoolStorage>> {
        self.pool.as_ref().map(|p| p.storage())
    }

    pub fn block(&self, id: BlockId) -> &MemBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut MemBlock {
        &mut self.blocks[id]
    }

    /// Registers a block wrapping client memory (standard streams). Never
    /// pooled, never indexed.
    pub fn add_client_block(&mut self, data: BlockData) -> BlockId {
        self.blocks.insert(MemBlock::new(data))
    }

    pub fn remove_client_block(&mut self, id: BlockId) {
        debug_assert!(!self.blocks[id].is_tagged());
        self.blocks.remove(id);
    }

    /// Scheduler notifications recorded since the last drain:
    /// `(mem_changed, mem_idle)`.
    pub fn take_signals(&mut self) -> (bool, bool) {
        let signals = (self.mem_changed, self.mem_idle);
        self.mem_changed = false;
        self.mem_idle = false;
        signals
    }

    fn update_peak_mem_used(&mut self) {
        let refd = self.total_alloced - self.total_cached;
        if refd > self.peak_used {
            self.peak_used = refd;
        }
    }

    fn alloc_mem_block(&mut self, alloc_size: u32, requested_size: u32) -> Option<BlockId> {
        let pool = self.pool.as_mut()?;
        let offset = pool.alloc(alloc_size)?;
        let mut block = MemBlock::new(BlockData::Pool { offset });
        block.alloc_size = alloc_size;
        block.avail_size = requested_size;
        self.total_alloced += alloc_size;
        self.update_peak_mem_used();
        Some(self.blocks.insert(block))
    }

    fn free_mem_block(&mut self, id: BlockId) {
        let block = self.blocks.remove(id);
        debug_assert!(!block.is_tagged(), "freeing block still in cache index");
        match block.data {
            BlockData::Pool { offset } => {
                self.total_alloced -= block.alloc_size;
                if let Some(pool) = self.pool.as_mut() {
                    pool.free(offset, block.alloc_size);
                }
            }
            BlockData::Client(_) => unreachable!("client blocks are not pool-freed"),
        }
        self.mem_changed = true;
    }

    // MRU free list.

    fn push_free_last(&mut self, id: BlockId) {
        self.blocks[id].state = BlockState::Free { next: None };
        match self.free_tail {
            Some(tail) => match self.blocks[tail].state {
                BlockState::Free { ref mut next } => *next = Some(id),
                _ => unreachable!("free tail not free"),
            },
            None => self.free_head = Some(id),
        }
        self.free_tail = Some(id);
    }

    fn pop_free_first(&mut self) -> Option<BlockId> {
        let head = self.free_head?;
        let next = match self.blocks[head].state {
            BlockState::Free { next } => next,
            _ => unreachable!("free head not free"),
        };
        self.free_head = next;
        if next.is_none() {
            self.free_tail = None;
        }
        self.blocks[head].state = BlockState::Idle;
        Some(head)
    }

    fn remove_from_free_list(&mut self, id: BlockId) {
        let mut prev: Option<BlockId> = None;
        let mut cur = self.free_head;
        while let Some(c) = cur {
            let next = match self.blocks[c].state {
                BlockState::Free { next } => next,
                _ => unreachable!("non-free block on free list"),
            };
            if c == id {
                match prev {
                    Some(p) => match self.blocks[p].state {
                        BlockState::Free { next: ref mut pn } => *pn = next,
                        _ => unreachable!(),
                    },
                    None => self.free_head = next,
                }
                if self.free_tail == Some(id) {
                    self.free_tail = prev;
                }
                self.blocks[id].state = BlockState::Idle;
                return;
            }
            prev = cur;
            cur = next;
        }
        unreachable!("block not on free list");
    }

    fn clear_free_list(&mut self) {
        let mut cur = self.free_head;
        while let Some(c) = cur {
            let next = match self.blocks[c].state {
                BlockState::Free { next } => next,
                _ => unreachable!(),
            };
            self.blocks[c].state = BlockState::Idle;
            cur = next;
        }
        self.free_head = None;
        self.free_tail = None;
    }

    /// Decrements a block's reference. At zero the block either joins the
    /// tail of the free list (tagged: its data remains reachable through the
    /// cache index) or returns to the pool.
    pub fn release_block(&mut self, id: BlockId) -> u16 {
        debug_assert!(self.blocks[id].ref_count > 0);
        self.blocks[id].ref_count -= 1;
        let ref_count = self.blocks[id].ref_count;
        if ref_count == 0 {
            debug_assert!(!self.blocks[id].is_busy(), "freeing block that has transfer");
            if self.blocks[id].is_tagged() {
                self.total_cached += self.blocks[id].avail_size;
                self.push_free_last(id);
                // The block is now up for grabs by some other stream.
                self.mem_changed = true;
            } else {
                self.free_mem_block(id);
            }
            self.frees += 1;
        }
        ref_count
    }

    /// Acquires a block of memory for a new transfer, evicting mis-sized free
    /// blocks until the pool can serve the allocation. Returns a block with
    /// ref count 1, or `None` with the mem-idle signal raised.
    pub fn get_oldest_free_block(
        &mut self,
        requested_buffer_size: u32,
        block_align: u32,
    ) -> Option<BlockId> {
        self.check_cache_consistency(None);

        let allocation_size = round_to_block_size(requested_buffer_size, block_align);
        loop {
            if let Some(id) = self.alloc_mem_block(allocation_size, requested_buffer_size) {
                self.blocks[id].ref_count = 1;
                self.allocs += 1;
                self.check_cache_consistency(Some(id));
                return Some(id);
            }

            let id = match self.pop_free_first() {
                Some(id) => id,
                None => {
                    // No available memory. Bail out.
                    self.mem_idle = true;
                    return None;
                }
            };

            debug_assert_eq!(self.blocks[id].ref_count, 0);
            self.total_cached -= self.blocks[id].avail_size;
            self.update_peak_mem_used();

            if self.blocks[id].alloc_size != allocation_size {
                // Too small, or too big. Ditch it and try to scrape up some
                // more memory from the allocator.
                if self.blocks[id].is_tagged() {
                    self.untag_block(id);
                }
                self.free_mem_block(id);
                continue;
            }

            self.blocks[id].ref_count = 1;
            self.allocs += 1;
            self.check_cache_consistency(Some(id));
            return Some(id);
        }
    }

    /// Comparison for cache binary search on the first two keys. Returns < 0
    /// if a better match could be found before the sorted entry, > 0 after,
    /// 0 on a perfect match. Positions sort decreasing, so bisection
    /// converges toward the block with the largest position not above the
    /// target.
    fn compare_file_position(&self, id: BlockId, file_id: FileId, position: u64) -> i32 {
        let block = &self.blocks[id];
        let block_file = block.file_id.expect("untagged block in cache index");
        if file_id < block_file {
            -1
        } else if file_id > block_file {
            1
        } else if position > block.position {
            -1
        } else if position < block.position {
            1
        } else {
            0
        }
    }

    /// Comparison using all three keys; 0 only on the exact record.
    fn compare_all_keys(&self, id: BlockId, file_id: FileId, position: u64, data: BlockData) -> i32 {
        let block = &self.blocks[id];
        let block_file = block.file_id.expect("untagged block in cache index");
        if file_id < block_file {
            return -1;
        }
        if file_id > block_file {
            return 1;
        }
        if position > block.position {
            return -1;
        }
        if position < block.position {
            return 1;
        }
        let searched = match data {
            BlockData::Pool { offset } => offset,
            BlockData::Client(_) => unreachable!("client block in cache index"),
        };
        let sorted = match block.data {
            BlockData::Pool { offset } => offset,
            BlockData::Client(_) => unreachable!("client block in cache index"),
        };
        match searched.cmp(&sorted) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Equal => 0,
        }
    }

    fn find_exact(&self, file_id: FileId, position: u64, data: BlockData) -> Option<usize> {
        let mut top: i32 = 0;
        let mut bottom: i32 = self.cache_index.len() as i32 - 1;
        while top <= bottom {
            let this = (bottom - top) / 2 + top;
            let cmp = self.compare_all_keys(self.cache_index[this as usize], file_id, position, data);
            if cmp == 0 {
                return Some(this as usize);
            } else if cmp < 0 {
                bottom = this - 1;
            } else {
                top = this + 1;
            }
        }
        None
    }

    /// Finds a cached memory block covering `position`, if available.
    ///
    /// On a match the block is addref'd (and popped from the free list if it
    /// was there), `requested_size` is narrowed to the valid size, and the
    /// usable offset within the block is returned. Alignment and minimum-size
    /// constraints applicable to cache reuse are handled herein.
    pub fn get_cached_block(
        &mut self,
        file_id: FileId,
        position: u64,
        min_size: u32,
        required_align: u32,
        eof: bool,
        requested_size: &mut u32,
    ) -> Option<(BlockId, u32)> {
        debug_assert!(self.use_cache());
        debug_assert!(required_align >= 1 && *requested_size >= min_size);

        if self.cache_index.is_empty() {
            return None;
        }

        let mut found: Option<BlockId> = None;
        let mut top: i32 = 0;
        let mut bottom: i32 = self.cache_index.len() as i32 - 1;
        let mut this: i32 = 0;
        while top <= bottom {
            this = (bottom - top) / 2 + top;
            let cmp = self.compare_file_position(self.cache_index[this as usize], file_id, position);
            if cmp == 0 {
                found = Some(self.cache_index[this as usize]);
                break;
            } else if cmp < 0 {
                bottom = this - 1;
            } else {
                top = this + 1;
            }
        }

        // Without a perfect match, `this` points at the item just before the
        // would-be location (which, if it has the right file ID, holds the
        // next larger position). That entry or its successor may still cover
        // the requested range.
        let covers = |mgr: &IoMemMgr, id: BlockId| -> bool {
            let b = &mgr.blocks[id];
            b.file_id == Some(file_id)
                && position >= b.position
                && position as i64 <= b.position as i64 + b.avail_size as i64 - min_size as i64
        };

        let mut block = found;
        let perfect_invalid = match block {
            Some(id) => position > self.blocks[id].position + (*requested_size - min_size) as u64,
            None => true,
        };
        if perfect_invalid {
            let current_pick = self.cache_index[this as usize];
            if covers(self, current_pick) {
                block = Some(current_pick);
            } else if (this + 1) < self.cache_index.len() as i32
                && covers(self, self.cache_index[(this + 1) as usize])
            {
                block = Some(self.cache_index[(this + 1) as usize]);
            } else {
                return None;
            }
        }

        let id = block?;
        debug_assert!(position >= self.blocks[id].position);
        let position_offset = (position - self.blocks[id].position) as u32;
        let available_valid_size = self.blocks[id].avail_size - position_offset;

        let data_aligned = match self.blocks[id].data {
            BlockData::Pool { offset } => {
                let storage = self.pool.as_ref().expect("cache without pool").storage();
                storage.ptr(offset + position_offset) as usize % required_align as usize == 0
            }
            BlockData::Client(_) => unreachable!("client block in cache index"),
        };

        // Cannot overshoot the desired size, and the effective size must
        // respect alignment (relaxed for the last buffer of the file).
        if available_valid_size <= *requested_size
            && (available_valid_size % required_align == 0
                || (eof && available_valid_size == *requested_size))
            && data_aligned
            && available_valid_size >= min_size
        {
            *requested_size = available_valid_size;

            if self.blocks[id].ref_count == 0 {
                self.remove_from_free_list(id);
                self.total_cached -= self.blocks[id].avail_size;
                self.update_peak_mem_used();
                self.allocs += 1;
            }
            self.blocks[id].ref_count += 1;
            trace!(
                "cache hit: file {} position {} (+{})",
                file_id,
                position,
                position_offset
            );
            return Some((id, position_offset));
        }

        None
    }

    /// Moves one entry of the sorted index to `destination` (an insertion
    /// index computed with the source still present), shifting everything in
    /// between.
    fn move_entry(&mut self, source: usize, destination: usize) {
        let item = self.cache_index[source];
        if source >= destination {
            self.cache_index
                .copy_within(destination..source, destination + 1);
            self.cache_index[destination] = item;
        } else {
            // The source sits before the destination, so removing it shifts
            // the actual target down by one.
            let destination = destination - 1;
            self.cache_index.copy_within(source + 1..destination + 1, source);
            self.cache_index[destination] = item;
        }
    }

    /// Tags a block with caching info before its transfer starts. An already
    /// indexed block (reused cache hit) is relocated with a single in-place
    /// move; the index is never resorted.
    pub fn tag_block(
        &mut self,
        id: BlockId,
        state: BlockState,
        file_id: Option<FileId>,
        position: u64,
        data_size: u32,
    ) {
        debug_assert_eq!(self.blocks[id].ref_count, 1);

        let file_id = match file_id {
            Some(f) if self.use_cache() => f,
            _ => {
                // Not caching: blocks are never kept ordered. Just set the
                // data identity and leave.
                let block = &mut self.blocks[id];
                block.position = position;
                block.avail_size = data_size;
                block.state = state;
                return;
            }
        };

        debug_assert!(!self.blocks[id].is_busy(), "block already has transfer");
        self.check_cache_consistency(Some(id));

        let data = self.blocks[id].data;
        let original_location = if self.blocks[id].is_tagged() {
            self.find_exact(
                self.blocks[id].file_id.unwrap(),
                self.blocks[id].position,
                data,
            )
            .expect("tagged block missing from cache index")
        } else {
            self.cache_index.push(id);
            self.cache_index.len() - 1
        };

        // Find where the block belongs with its new identity. The search runs
        // with the old entry still in place; `move_entry` accounts for it.
        let mut top: i32 = 0;
        let mut bottom: i32 = self.cache_index.len() as i32 - 1;
        while top <= bottom {
            let this = (bottom - top) / 2 + top;
            let cmp = self.compare_all_keys(self.cache_index[this as usize], file_id, position, data);
            if cmp == 0 {
                top = this;
                bottom = this;
                break;
            } else if cmp < 0 {
                bottom = this - 1;
            } else {
                top = this + 1;
            }
        }
        let new_location = top.max(bottom).max(0) as usize;

        self.move_entry(original_location, new_location);

        let block = &mut self.blocks[id];
        block.file_id = Some(file_id);
        block.position = position;
        block.avail_size = data_size;
        block.state = state;

        self.check_cache_consistency(Some(id));
    }

    /// Drops a block's cache identity after a cancelled or failed transfer.
    pub fn untag_block(&mut self, id: BlockId) {
        debug_assert!(self.blocks[id].is_tagged());
        self.check_cache_consistency(Some(id));

        let index = self
            .find_exact(
                self.blocks[id].file_id.unwrap(),
                self.blocks[id].position,
                self.blocks[id].data,
            )
            .expect("tagged block missing from cache index");
        self.cache_index.remove(index);
        self.blocks[id].file_id = None;

        self.check_cache_consistency(None);
    }

    /// Untags every block; frees those not referenced by any view.
    pub fn flush_cache(&mut self) {
        if !self.use_cache {
            return;
        }
        self.check_cache_consistency(None);

        self.clear_free_list();
        self.total_cached = 0;

        let index = std::mem::take(&mut self.cache_index);
        for id in index {
            self.blocks[id].file_id = None;
            if self.blocks[id].ref_count == 0 {
                self.free_mem_block(id);
            }
        }

        self.check_cache_consistency(None);
    }

    /// Clones a block record aliasing the same memory, so a new low-level
    /// transfer can run against a region whose primary block is still busy
    /// with an earlier one (standard streams on the deferred device). The
    /// clone is never indexed nor pooled.
    pub fn clone_temp_block(&mut self, base: BlockId) -> BlockId {
        let mut clone = MemBlock::new(self.blocks[base].data);
        clone.avail_size = self.blocks[base].avail_size;
        clone.position = self.blocks[base].position;
        clone.temp = true;
        self.blocks.insert(clone)
    }

    pub fn destroy_temp_block(&mut self, base: BlockId, id: BlockId) {
        if id != base {
            debug_assert!(self.blocks[id].temp);
            self.blocks.remove(id);
        }
    }

    // Monitoring.

    pub fn total_alloced(&self) -> u32 {
        self.total_alloced
    }

    pub fn unreferenced_cached_bytes(&self) -> u32 {
        self.total_cached
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn peak_used(&self) -> u32 {
        self.peak_used
    }

    pub fn alloc_count(&self) -> u32 {
        self.allocs
    }

    pub fn free_count(&self) -> u32 {
        self.frees
    }

    #[cfg(any(test, debug_assertions))]
    pub fn check_cache_consistency(&self, must_find: Option<BlockId>) {
        let mut found = must_find.is_none();
        let mut prev: Option<BlockId> = None;
        for &id in &self.cache_index {
            let this = &self.blocks[id];
            if let Some(p) = prev {
                let pb = &self.blocks[p];
                let this_off = match this.data {
                    BlockData::Pool { offset } => offset,
                    BlockData::Client(_) => unreachable!(),
                };
                let prev_off = match pb.data {
                    BlockData::Pool { offset } => offset,
                    BlockData::Client(_) => unreachable!(),
                };
                let ordered = pb.file_id < this.file_id
                    || (pb.file_id == this.file_id && pb.position > this.position)
                    || (pb.file_id == this.file_id
                        && pb.position == this.position
                        && prev_off < this_off);
                debug_assert!(ordered, "cache index out of order");
            }
            if Some(id) == must_find {
                found = true;
            }
            prev = Some(id);
        }
        if let Some(id) = must_find {
            debug_assert!(found || !self.blocks[id].is_tagged());
        }
    }

    #[cfg(not(any(test, debug_assertions)))]
    #[inline]
    pub fn check_cache_consistency(&self, _must_find: Option<BlockId>) {}
}
