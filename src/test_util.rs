//! In-memory backend used by the unit tests: a fake storage medium with
//! blocking and deferred hook implementations, plus a resolver mapping file
//! IDs straight to descriptors. The deferred hook queues requests so tests
//! can complete them manually, in or out of order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::file::{
    DeviceId, FileDescriptor, FileId, FileLocationResolver, FileSystemFlags, OpenMode, OpenOutcome,
};
use crate::hook::{
    AsyncTransfer, BlockingIoHook, DeferredIoHook, IoHeuristics, IoHookCommon, TransferId,
    TransferInfo,
};

pub(crate) struct MemoryMedia {
    files: Mutex<FxHashMap<FileId, Vec<u8>>>,
    pub ll_block_size: u32,
    pub reads: AtomicU32,
    pub writes: AtomicU32,
    pub cancels: AtomicU32,
    pub closes: AtomicU32,
}

impl MemoryMedia {
    pub fn new(ll_block_size: u32) -> Arc<MemoryMedia> {
        Arc::new(MemoryMedia {
            files: Mutex::new(FxHashMap::default()),
            ll_block_size,
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        })
    }

    /// Creates a file filled with a position-dependent pattern.
    pub fn add_patterned_file(&self, file_id: FileId, size: usize) {
        let data = (0..size).map(|i| pattern(file_id, i)).collect();
        self.files.lock().insert(file_id, data);
    }

    pub fn add_file(&self, file_id: FileId, data: Vec<u8>) {
        self.files.lock().insert(file_id, data);
    }

    pub fn file_size(&self, file_id: FileId) -> Option<usize> {
        self.files.lock().get(&file_id).map(|d| d.len())
    }

    pub fn file_data(&self, file_id: FileId) -> Option<Vec<u8>> {
        self.files.lock().get(&file_id).cloned()
    }

    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> u32 {
        self.cancels.load(Ordering::SeqCst)
    }

    fn read_at(&self, file_id: FileId, position: u64, buffer: &mut [u8], requested: u32) -> u32 {
        let files = self.files.lock();
        let data = match files.get(&file_id) {
            Some(data) => data,
            None => return 0,
        };
        let start = (position as usize).min(data.len());
        let end = (start + requested as usize).min(data.len());
        let n = end - start;
        buffer[..n].copy_from_slice(&data[start..end]);
        n as u32
    }

    fn write_at(&self, file_id: FileId, position: u64, data: &[u8]) -> u32 {
        let mut files = self.files.lock();
        let file = files.entry(file_id).or_default();
        let end = position as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[position as usize..end].copy_from_slice(data);
        data.len() as u32
    }
}

pub(crate) fn pattern(file_id: FileId, index: usize) -> u8 {
    (file_id as usize)
        .wrapping_mul(31)
        .wrapping_add(index.wrapping_mul(7))
        .wrapping_add(index >> 8) as u8
}

/// Resolver mapping file IDs (or their decimal names) to descriptors on one
/// device.
pub(crate) struct TestResolver {
    media: Arc<MemoryMedia>,
    device_id: DeviceId,
    /// Defer every open not requested synchronously.
    pub defer_opens: AtomicBool,
}

impl TestResolver {
    pub fn new(media: Arc<MemoryMedia>, device_id: DeviceId) -> Arc<TestResolver> {
        Arc::new(TestResolver {
            media,
            device_id,
            defer_opens: AtomicBool::new(false),
        })
    }

    fn descriptor(&self, file_id: FileId) -> Result<FileDescriptor> {
        let size = self.media.file_size(file_id);
        match size {
            Some(size) => Ok(FileDescriptor {
                file_size: size as i64,
                sector_offset: 0,
                device_id: self.device_id,
                custom_param: file_id as u64,
            }),
            None => Err(Error::ErrFileNotFound),
        }
    }
}

impl FileLocationResolver for TestResolver {
    fn open_by_name(
        &self,
        name: &str,
        open_mode: OpenMode,
        flags: Option<&FileSystemFlags>,
        sync_open: bool,
    ) -> Result<OpenOutcome> {
        let file_id: FileId = name.parse().map_err(|_| Error::ErrFileNotFound)?;
        self.open_by_id(file_id, open_mode, flags, sync_open)
    }

    fn open_by_id(
        &self,
        file_id: FileId,
        open_mode: OpenMode,
        _flags: Option<&FileSystemFlags>,
        sync_open: bool,
    ) -> Result<OpenOutcome> {
        if !sync_open && self.defer_opens.load(Ordering::SeqCst) {
            return Ok(OpenOutcome::deferred(FileDescriptor {
                file_size: -1,
                sector_offset: 0,
                device_id: self.device_id,
                custom_param: file_id as u64,
            }));
        }
        match self.descriptor(file_id) {
            Ok(desc) => Ok(OpenOutcome::opened(desc)),
            Err(e) => {
                if open_mode == OpenMode::Read {
                    Err(e)
                } else {
                    // Writable files spring into existence.
                    Ok(OpenOutcome::opened(FileDescriptor {
                        file_size: 0,
                        sector_offset: 0,
                        device_id: self.device_id,
                        custom_param: file_id as u64,
                    }))
                }
            }
        }
    }
}

/// Synchronous test backend.
pub(crate) struct BlockingMedia {
    pub media: Arc<MemoryMedia>,
}

impl BlockingMedia {
    pub fn new(media: Arc<MemoryMedia>) -> Arc<BlockingMedia> {
        Arc::new(BlockingMedia { media })
    }
}

impl IoHookCommon for BlockingMedia {
    fn close(&self, _desc: &FileDescriptor) {
        self.media.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn block_size(&self, _desc: &FileDescriptor) -> u32 {
        self.media.ll_block_size
    }
}

impl BlockingIoHook for BlockingMedia {
    fn read(
        &self,
        desc: &FileDescriptor,
        _heuristics: &IoHeuristics,
        buffer: &mut [u8],
        info: &TransferInfo,
    ) -> Result<u32> {
        self.media.reads.fetch_add(1, Ordering::SeqCst);
        let n = self.media.read_at(
            desc.custom_param as FileId,
            info.file_position,
            buffer,
            info.requested_size,
        );
        if n == 0 {
            return Err(Error::ErrIoDevice);
        }
        Ok(n)
    }

    fn write(
        &self,
        desc: &FileDescriptor,
        _heuristics: &IoHeuristics,
        buffer: &[u8],
        info: &TransferInfo,
    ) -> Result<u32> {
        self.media.writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.media.write_at(
            desc.custom_param as FileId,
            info.file_position,
            &buffer[..info.requested_size as usize],
        ))
    }
}

struct QueuedTransfer {
    transfer: AsyncTransfer,
    file_id: FileId,
}

/// Asynchronous test backend: requests queue up until the test pumps them,
/// in order or not. `auto_pump` completes requests inline instead.
pub(crate) struct DeferredMedia {
    pub media: Arc<MemoryMedia>,
    queue: Mutex<VecDeque<QueuedTransfer>>,
    cancelled: Mutex<FxHashSet<usize>>,
    pub auto_pump: AtomicBool,
}

impl DeferredMedia {
    pub fn new(media: Arc<MemoryMedia>, auto_pump: bool) -> Arc<DeferredMedia> {
        Arc::new(DeferredMedia {
            media,
            queue: Mutex::new(VecDeque::new()),
            cancelled: Mutex::new(FxHashSet::default()),
            auto_pump: AtomicBool::new(auto_pump),
        })
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn run(&self, queued: QueuedTransfer) {
        let QueuedTransfer { mut transfer, file_id } = queued;
        if self.cancelled.lock().remove(&transfer.id().0) {
            transfer.complete(Err(Error::ErrCancelled));
            return;
        }
        let info = *transfer.info();
        if transfer.is_write() {
            let n = self.media.write_at(file_id, info.file_position, transfer.data());
            transfer.complete(Ok(n));
        } else {
            let n = self.media.read_at(
                file_id,
                info.file_position,
                transfer.buffer_mut(),
                info.requested_size,
            );
            if n == 0 {
                transfer.complete(Err(Error::ErrIoDevice));
            } else {
                transfer.complete(Ok(n));
            }
        }
    }

    /// Completes the oldest queued request. Returns false when none is
    /// queued.
    pub fn pump_one(&self) -> bool {
        let next = self.queue.lock().pop_front();
        match next {
            Some(queued) => {
                self.run(queued);
                true
            }
            None => false,
        }
    }

    /// Completes the queued request at `index`, enabling out-of-order
    /// delivery.
    pub fn pump_index(&self, index: usize) -> bool {
        let next = self.queue.lock().remove(index);
        match next {
            Some(queued) => {
                self.run(queued);
                true
            }
            None => false,
        }
    }

    pub fn pump_all(&self) {
        while self.pump_one() {}
    }
}

impl IoHookCommon for DeferredMedia {
    fn close(&self, _desc: &FileDescriptor) {
        self.media.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn block_size(&self, _desc: &FileDescriptor) -> u32 {
        self.media.ll_block_size
    }
}

impl DeferredIoHook for DeferredMedia {
    fn read(&self, desc: &FileDescriptor, _heuristics: &IoHeuristics, transfer: AsyncTransfer) {
        self.media.reads.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedTransfer {
            transfer,
            file_id: desc.custom_param as FileId,
        };
        if self.auto_pump.load(Ordering::SeqCst) {
            self.run(queued);
        } else {
            self.queue.lock().push_back(queued);
        }
    }

    fn write(&self, desc: &FileDescriptor, _heuristics: &IoHeuristics, transfer: AsyncTransfer) {
        self.media.writes.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedTransfer {
            transfer,
            file_id: desc.custom_param as FileId,
        };
        if self.auto_pump.load(Ordering::SeqCst) {
            self.run(queued);
        } else {
            self.queue.lock().push_back(queued);
        }
    }

    fn cancel(&self, _desc: &FileDescriptor, transfer: TransferId, all_cancelled: &mut bool) {
        self.media.cancels.fetch_add(1, Ordering::SeqCst);
        // This backend cancels one request at a time.
        *all_cancelled = false;
        self.cancelled.lock().insert(transfer.0);
    }
}
