use crate::file::FileId;
use crate::hook::TransferId;

/// Handle into the device's block arena.
pub(crate) type BlockId = usize;

/// Raw pointer into a client-owned buffer, pinned for the duration of the
/// operation that wrapped it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ClientPtr(pub *mut u8);

unsafe impl Send for ClientPtr {}
unsafe impl Sync for ClientPtr {}

/// Where a block's bytes live.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BlockData {
    /// Offset into the device's pool storage.
    Pool { offset: u32 },
    /// Client-provided memory wrapped by a standard stream.
    Client(ClientPtr),
}

/// A free block sits on the MRU list (next link), a busy block is owned by an
/// in-flight transfer. The two never coexist. Busy blocks on the blocking
/// device have no transfer record; the single synchronous request is implied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BlockState {
    Idle,
    Free { next: Option<BlockId> },
    Busy { transfer: Option<TransferId> },
}

/// One unit of cache memory, with the identity of the data it holds.
#[derive(Debug)]
pub(crate) struct MemBlock {
    /// Absolute byte offset of the data in its source file.
    pub position: u64,
    pub data: BlockData,
    /// Bytes of valid data in this block.
    pub avail_size: u32,
    /// Bucket size actually allocated from the pool.
    pub alloc_size: u32,
    /// `Some` makes the block a cache entry addressable by
    /// `(file_id, position)`.
    pub file_id: Option<FileId>,
    /// Number of views referencing this block. Zero makes it eligible for
    /// eviction.
    pub ref_count: u16,
    pub state: BlockState,
    /// Temporary clone aliasing another block's memory; never indexed, never
    /// on the free list.
    pub temp: bool,
}

impl MemBlock {
    pub fn new(data: BlockData) -> Self {
        MemBlock {
            position: 0,
            data,
            avail_size: 0,
            alloc_size: 0,
            file_id: None,
            ref_count: 0,
            state: BlockState::Idle,
            temp: false,
        }
    }

    /// A block is busy while a low-level transfer is refilling it.
    pub fn is_busy(&self) -> bool {
        matches!(self.state, BlockState::Busy { .. })
    }

    pub fn is_tagged(&self) -> bool {
        self.file_id.is_some()
    }

    pub fn transfer(&self) -> Option<TransferId> {
        match self.state {
            BlockState::Busy { transfer } => transfer,
            _ => None,
        }
    }
}
