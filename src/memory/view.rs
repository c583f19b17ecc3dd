use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::memory::block::{BlockId, ClientPtr};
use crate::memory::storage::PoolStorage;
use crate::stream::Task;

/// Resolved location of a view's first byte.
#[derive(Debug, Copy, Clone)]
pub(crate) enum DataRef {
    /// Absolute offset into the device's pool storage.
    Pool { offset: u32 },
    Client(ClientPtr),
}

/// Mem view status. While it is not `Ready`, a view is a logical data
/// transfer from the point of view of stream objects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ViewStatus {
    Pending = 0,
    Completed = 1,
    Cancelled = 2,
    Ready = 3,
}

impl From<u8> for ViewStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ViewStatus::Pending,
            1 => ViewStatus::Completed,
            2 => ViewStatus::Cancelled,
            _ => ViewStatus::Ready,
        }
    }
}

/// A window into a memory block, owned by a stream.
///
/// Geometry is fixed when the view is attached to its block, under the device
/// lock; the mutable bits (status, remaining size) are guarded by the owner
/// stream's status lock and stored as atomics so observer lists can share the
/// record across threads.
pub(crate) struct MemView {
    pub block: BlockId,
    /// Byte offset of this view into its block.
    pub offset_in_block: u32,
    pub data: DataRef,
    /// File position of the first byte visible through this view.
    pub start_position: u64,
    /// File position one past the block's valid data.
    pub end_position: u64,
    pub alloc_size: u32,
    /// Task notified when the transfer backing this view settles. Set on
    /// deferred devices.
    pub owner: Option<Task>,

    status: AtomicU8,
    size: AtomicU32,
}

impl MemView {
    pub fn new(
        block: BlockId,
        offset_in_block: u32,
        data: DataRef,
        start_position: u64,
        end_position: u64,
        alloc_size: u32,
        owner: Option<Task>,
    ) -> Arc<MemView> {
        debug_assert!(end_position >= start_position);
        Arc::new(MemView {
            block,
            offset_in_block,
            data,
            start_position,
            end_position,
            alloc_size,
            owner,
            status: AtomicU8::new(ViewStatus::Pending as u8),
            size: AtomicU32::new((end_position - start_position) as u32),
        })
    }

    pub fn status(&self) -> ViewStatus {
        self.status.load(Ordering::Acquire).into()
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// True if the transfer's data can be added to the stream in `update`.
    pub fn do_store_data(&self) -> bool {
        self.status() != ViewStatus::Cancelled
    }

    /// Call before pushing the view on the cancelled list.
    pub fn tag_as_cancelled(&self) {
        debug_assert_eq!(self.status(), ViewStatus::Pending);
        self.status
            .store(ViewStatus::Cancelled as u8, Ordering::Release);
    }

    /// Tags a pending transfer that completed out of order. `Ready` views are
    /// already complete and are never re-tagged.
    pub fn tag_as_completed(&self) {
        debug_assert_eq!(self.status(), ViewStatus::Pending);
        self.status
            .store(ViewStatus::Completed as u8, Ordering::Release);
    }

    pub fn tag_as_ready(&self) {
        debug_assert_ne!(self.status(), ViewStatus::Cancelled);
        self.status.store(ViewStatus::Ready as u8, Ordering::Release);
    }

    /// Zeroes the view after its buffering contribution has been corrected.
    pub fn clear_size(&self) {
        self.size.store(0, Ordering::Release);
    }
}

impl fmt::Debug for MemView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemView")
            .field("block", &self.block)
            .field("offset_in_block", &self.offset_in_block)
            .field("start_position", &self.start_position)
            .field("end_position", &self.end_position)
            .field("status", &self.status())
            .field("size", &self.size())
            .finish()
    }
}

/// Zero-copy window into streaming memory granted to the client by
/// [`AutoStream::get_buffer`](crate::AutoStream::get_buffer).
///
/// The bytes stay valid until the grant is returned with `release_buffer`;
/// reading a handle kept across its release returns whatever the recycled
/// block holds by then.
pub struct GrantedBuffer {
    storage: Arc<PoolStorage>,
    offset: u32,
    size: u32,
}

impl GrantedBuffer {
    pub(crate) fn new(storage: Arc<PoolStorage>, offset: u32, size: u32) -> Self {
        GrantedBuffer {
            storage,
            offset,
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn data(&self) -> &[u8] {
        // No transfer writes this region while the grant holds its block
        // reference.
        unsafe { self.storage.slice(self.offset, self.size) }
    }
}

impl fmt::Debug for GrantedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantedBuffer")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}
