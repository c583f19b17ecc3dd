use std::fmt;
use std::slice;
use std::sync::Weak;

use crate::error::{Error, Result};
use crate::file::{FileDescriptor, Priority};

/// Handle to one in-flight deferred request, unique among requests currently
/// in flight on its device.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransferId(pub(crate) usize);

/// Heuristics forwarded with every low-level request.
#[derive(Debug, Copy, Clone)]
pub struct IoHeuristics {
    pub priority: Priority,
    /// Operation deadline, in seconds. 0 means the requester is starving.
    pub deadline_sec: f32,
}

/// Parameters of one low-level transfer.
#[derive(Debug, Copy, Clone)]
pub struct TransferInfo {
    /// Absolute byte position within the backend container (the stream
    /// position plus the descriptor's sector offset).
    pub file_position: u64,
    /// Size of the target memory region. May exceed `requested_size`; the
    /// backend may legally write up to this much on a read.
    pub buffer_size: u32,
    /// Number of bytes the device expects transferred.
    pub requested_size: u32,
}

/// Static description of a device, for monitoring.
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    pub name: String,
    pub can_read: bool,
    pub can_write: bool,
}

/// Monitoring counters aggregated by the device. Counters reset at each
/// query; sizes are instantaneous.
#[derive(Debug, Clone, Default)]
pub struct DeviceData {
    pub device_id: u32,
    pub granularity: u32,
    pub mem_size: u32,
    pub mem_used: u32,
    pub allocs: u32,
    pub frees: u32,
    pub peak_refd_mem_used: u32,
    pub unreferenced_cached_bytes: u32,
    pub num_active_streams: u32,
    pub total_bytes_transferred: u32,
    pub low_level_bytes_transferred: u32,
    /// Percentage of bytes served from cache over the session.
    pub avg_cache_efficiency: f32,
    pub num_low_level_requests_completed: u32,
    pub num_low_level_requests_cancelled: u32,
    pub num_low_level_requests_pending: u32,
    pub cache_pinned_bytes: u32,
    pub custom_param: u64,
}

/// Surface shared by both hook flavors.
pub trait IoHookCommon: Send + Sync {
    /// Releases backend resources attached to the descriptor. Called once,
    /// when the stream owning the descriptor is destroyed.
    fn close(&self, desc: &FileDescriptor);

    /// Minimum raw I/O unit for this file. Must be >= 1, must divide the
    /// device granularity evenly, and must not exceed it.
    fn block_size(&self, desc: &FileDescriptor) -> u32;

    fn device_desc(&self) -> DeviceDesc {
        DeviceDesc::default()
    }

    fn device_data(&self) -> u64 {
        0
    }
}

/// Synchronous backend. At most one call is in flight at a time, serialized
/// by the device's I/O thread.
pub trait BlockingIoHook: IoHookCommon {
    /// Reads `info.requested_size` bytes at `info.file_position` into
    /// `buffer`. Returns the number of bytes transferred.
    fn read(
        &self,
        desc: &FileDescriptor,
        heuristics: &IoHeuristics,
        buffer: &mut [u8],
        info: &TransferInfo,
    ) -> Result<u32>;

    /// Writes `buffer` at `info.file_position`. Returns the number of bytes
    /// transferred.
    fn write(
        &self,
        desc: &FileDescriptor,
        heuristics: &IoHeuristics,
        buffer: &[u8],
        info: &TransferInfo,
    ) -> Result<u32>;
}

/// Asynchronous backend. Up to the device's `max_concurrent_io` requests may
/// be in flight; each completes through its [`AsyncTransfer`], possibly on an
/// arbitrary thread and possibly out of order.
pub trait DeferredIoHook: IoHookCommon {
    /// Starts an asynchronous read into the transfer's buffer. Failures are
    /// reported by completing (or dropping) the transfer.
    fn read(&self, desc: &FileDescriptor, heuristics: &IoHeuristics, transfer: AsyncTransfer);

    /// Starts an asynchronous write from the transfer's data.
    fn write(&self, desc: &FileDescriptor, heuristics: &IoHeuristics, transfer: AsyncTransfer);

    /// Requests cancellation of an in-flight transfer. The backend must still
    /// complete the transfer (any result), from its normal completion
    /// context: completing from within `cancel` itself is not allowed.
    /// `all_cancelled` is a hint: when true on input, the backend may cancel
    /// every pending request on this descriptor at once and leave it true; it
    /// must never flip it back to true after clearing it.
    fn cancel(&self, desc: &FileDescriptor, transfer: TransferId, all_cancelled: &mut bool);
}

/// Either hook flavor, fixed at device creation.
#[derive(Clone)]
pub enum IoHook {
    Blocking(std::sync::Arc<dyn BlockingIoHook>),
    Deferred(std::sync::Arc<dyn DeferredIoHook>),
}

impl IoHook {
    pub(crate) fn close(&self, desc: &FileDescriptor) {
        match self {
            IoHook::Blocking(h) => h.close(desc),
            IoHook::Deferred(h) => h.close(desc),
        }
    }

    pub(crate) fn block_size(&self, desc: &FileDescriptor) -> u32 {
        match self {
            IoHook::Blocking(h) => h.block_size(desc),
            IoHook::Deferred(h) => h.block_size(desc),
        }
    }

    pub(crate) fn device_desc(&self) -> DeviceDesc {
        match self {
            IoHook::Blocking(h) => h.device_desc(),
            IoHook::Deferred(h) => h.device_desc(),
        }
    }

    pub(crate) fn device_data(&self) -> u64 {
        match self {
            IoHook::Blocking(h) => h.device_data(),
            IoHook::Deferred(h) => h.device_data(),
        }
    }
}

impl fmt::Debug for IoHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoHook::Blocking(_) => write!(f, "IoHook::Blocking"),
            IoHook::Deferred(_) => write!(f, "IoHook::Deferred"),
        }
    }
}

/// Receives deferred completions. Implemented by the device.
pub(crate) trait TransferCompleter: Send + Sync {
    fn transfer_complete(&self, id: TransferId, result: Result<u32>);
}

/// Raw window into memory owned by the core (a pool block or a client
/// buffer). The owner keeps the region alive and un-aliased while the
/// transfer referencing it is in flight.
#[derive(Copy, Clone)]
pub(crate) struct RawRegion {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

// The region points into a pool allocation or a client buffer pinned for the
// duration of the transfer.
unsafe impl Send for RawRegion {}

/// One asynchronous request handed to a [`DeferredIoHook`].
///
/// The transfer owns exclusive access to its target region until completed.
/// Completing reports the result back to the device; dropping an uncompleted
/// transfer reports a device failure.
pub struct AsyncTransfer {
    info: TransferInfo,
    id: TransferId,
    write: bool,
    region: RawRegion,
    completer: Option<Weak<dyn TransferCompleter>>,
}

impl AsyncTransfer {
    pub(crate) fn new(
        info: TransferInfo,
        id: TransferId,
        write: bool,
        region: RawRegion,
        completer: Weak<dyn TransferCompleter>,
    ) -> Self {
        AsyncTransfer {
            info,
            id,
            write,
            region,
            completer: Some(completer),
        }
    }

    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Target region for a read. The backend fills up to
    /// `info().requested_size` bytes.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.write);
        unsafe { slice::from_raw_parts_mut(self.region.ptr, self.region.len) }
    }

    /// Source data for a write.
    pub fn data(&self) -> &[u8] {
        debug_assert!(self.write);
        unsafe { slice::from_raw_parts(self.region.ptr, self.info.requested_size as usize) }
    }

    /// Completes the transfer. `Ok` carries the transferred size.
    pub fn complete(mut self, result: Result<u32>) {
        self.dispatch(result);
    }

    fn dispatch(&mut self, result: Result<u32>) {
        if let Some(completer) = self.completer.take() {
            if let Some(completer) = completer.upgrade() {
                completer.transfer_complete(self.id, result);
            }
        }
    }
}

impl Drop for AsyncTransfer {
    fn drop(&mut self) {
        // An uncompleted transfer counts as a backend failure.
        self.dispatch(Err(Error::ErrIoDevice));
    }
}

impl fmt::Debug for AsyncTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTransfer")
            .field("info", &self.info)
            .field("id", &self.id)
            .field("write", &self.write)
            .finish()
    }
}
