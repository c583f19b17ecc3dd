pub(crate) mod auto_stream;
pub(crate) mod std_stream;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicI8, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::file::{
    FileDescriptor, FileId, FileSystemFlags, OpenMode, Priority, MAX_PRIORITY, MIN_PRIORITY,
};

pub use auto_stream::AutoStream;
pub use std_stream::StdStream;

/// Operation status of a standard stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// No operation in progress, or every slice of the current request has
    /// been scheduled.
    Idle,
    /// An operation is in progress.
    Pending,
    /// The last operation completed.
    Completed,
    /// The stream hit an I/O error and will not be scheduled again.
    Error,
    /// The last operation was cancelled.
    Cancelled,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            StreamStatus::Idle => "Idle",
            StreamStatus::Pending => "Pending",
            StreamStatus::Completed => "Completed",
            StreamStatus::Error => "Error",
            StreamStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A stream task owned by a device: either flavor, behind its Arc.
#[derive(Clone)]
pub(crate) enum Task {
    Std(Arc<StdStream>),
    Auto(Arc<AutoStream>),
}

impl Task {
    pub fn common(&self) -> &TaskCommon {
        match self {
            Task::Std(s) => &s.common,
            Task::Auto(s) => &s.common,
        }
    }

    pub fn is_std(&self) -> bool {
        matches!(self, Task::Std(_))
    }

    pub fn same_as(&self, other: &Task) -> bool {
        match (self, other) {
            (Task::Std(a), Task::Std(b)) => Arc::ptr_eq(a, b),
            (Task::Auto(a), Task::Auto(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn effective_deadline_ms(&self) -> f32 {
        match self {
            Task::Std(s) => s.effective_deadline_ms(),
            Task::Auto(s) => s.effective_deadline_ms(),
        }
    }

    pub fn can_be_destroyed(&self) -> bool {
        match self {
            Task::Std(s) => s.can_be_destroyed(),
            Task::Auto(s) => s.can_be_destroyed(),
        }
    }

    pub fn kill(&self) {
        match self {
            Task::Std(s) => s.kill(),
            Task::Auto(s) => s.kill(),
        }
    }

    pub fn update(
        &self,
        view: Option<Arc<crate::memory::view::MemView>>,
        result: Result<()>,
        required_low_level: bool,
    ) -> bool {
        match self {
            Task::Std(s) => s.update(view, result, required_low_level),
            Task::Auto(s) => s.update(view, result, required_low_level),
        }
    }

    pub fn prepare_transfer(&self, cache_only: bool) -> Prepared {
        match self {
            Task::Std(s) => s.prepare_transfer(cache_only),
            Task::Auto(s) => s.prepare_transfer(cache_only),
        }
    }

    /// Final cleanup, run by the I/O thread once the task is reaped.
    pub fn instant_destroy(&self) {
        debug_assert!(self.common().to_be_destroyed() && self.can_be_destroyed());
        match self {
            Task::Std(s) => s.instant_destroy(),
            Task::Auto(s) => s.instant_destroy(),
        }
    }

    // Caching stream surface. Meaningful for automatic streams only.

    pub fn nominal_buffering(&self) -> u32 {
        match self {
            Task::Std(_) => 0,
            Task::Auto(s) => s.nominal_buffering(),
        }
    }

    pub fn virtual_buffering(&self) -> u32 {
        match self {
            Task::Std(_) => 0,
            Task::Auto(s) => s.virtual_buffering(),
        }
    }

    pub fn start_caching(&self) {
        if let Task::Auto(s) = self {
            s.start_caching();
        }
    }

    pub fn stop_caching(&self, mem_needed: u32) -> u32 {
        match self {
            Task::Std(_) => 0,
            Task::Auto(s) => s.stop_caching(mem_needed),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Std(_) => write!(f, "Task::Std"),
            Task::Auto(_) => write!(f, "Task::Auto"),
        }
    }
}

/// What the scheduler got out of `prepare_transfer`.
pub(crate) enum Prepared {
    /// The transfer was cancelled at the last minute (for instance the client
    /// destroyed the stream).
    Aborted,
    /// Data was found in cache with no transfer in flight; the view is usable
    /// as soon as the task is updated with it.
    Ready(Arc<crate::memory::view::MemView>),
    /// The view was attached as an observer of a transfer already in flight
    /// (deferred device). It will be resolved by that transfer's completion.
    Attached,
    /// A low-level request must be pushed to the backend.
    Launch(LaunchInfo),
}

pub(crate) struct LaunchInfo {
    pub view: Arc<crate::memory::view::MemView>,
    /// Deferred transfer record, `None` on the blocking device.
    pub transfer: Option<crate::hook::TransferId>,
    pub info: crate::hook::TransferInfo,
    pub region: crate::hook::RawRegion,
    pub write: bool,
}

/// Pending open command, executed from the I/O thread.
#[derive(Debug, Clone)]
pub(crate) enum DeferredOpen {
    ByName {
        name: String,
        flags: Option<FileSystemFlags>,
        open_mode: OpenMode,
    },
    ById {
        file_id: FileId,
        flags: Option<FileSystemFlags>,
        open_mode: OpenMode,
    },
}

/// State shared by both stream flavors. Scheduler-facing bits are atomics so
/// the I/O thread can take decisions without the stream's status lock; the
/// worst a stale read costs is one suboptimal pick.
pub(crate) struct TaskCommon {
    pub device: Arc<crate::device::Device>,

    pub desc: Mutex<FileDescriptor>,
    pub file_size: AtomicI64,
    pub file_open: AtomicBool,
    pub file_closed: AtomicBool,
    pub deferred_open: Mutex<Option<DeferredOpen>>,
    pub stream_name: Mutex<Option<String>>,

    /// Low-level I/O block size, queried once at init.
    pub ll_block_size: u32,

    pub priority: AtomicI8,
    /// Device time of the last transfer start, in ms.
    pub io_start_time: AtomicU64,

    pub to_be_destroyed: AtomicBool,
    pub ready_for_io: AtomicBool,
    /// Whether this task currently counts in the scheduler semaphore.
    pub requires_scheduling: AtomicBool,
    pub is_caching: AtomicBool,
    /// A client thread is blocked on this stream's completion event.
    pub blocked: AtomicBool,
    pub is_write_op: AtomicBool,
    pub has_reached_eof: AtomicBool,
    pub is_auto: bool,

    // Monitoring.
    pub bytes_transferred: AtomicU32,
    pub bytes_transferred_ll: AtomicU32,
    pub stream_id: u32,
}

impl TaskCommon {
    pub fn new(
        device: Arc<crate::device::Device>,
        desc: FileDescriptor,
        ll_block_size: u32,
        is_auto: bool,
        stream_id: u32,
    ) -> Self {
        let file_size = desc.file_size;
        TaskCommon {
            device,
            desc: Mutex::new(desc),
            file_size: AtomicI64::new(file_size),
            file_open: AtomicBool::new(false),
            file_closed: AtomicBool::new(false),
            deferred_open: Mutex::new(None),
            stream_name: Mutex::new(None),
            ll_block_size,
            priority: AtomicI8::new(crate::file::DEFAULT_PRIORITY),
            io_start_time: AtomicU64::new(0),
            to_be_destroyed: AtomicBool::new(false),
            ready_for_io: AtomicBool::new(false),
            requires_scheduling: AtomicBool::new(false),
            is_caching: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            is_write_op: AtomicBool::new(false),
            has_reached_eof: AtomicBool::new(false),
            is_auto,
            bytes_transferred: AtomicU32::new(0),
            bytes_transferred_ll: AtomicU32::new(0),
            stream_id,
        }
    }

    pub fn priority(&self) -> Priority {
        let priority = self.priority.load(Ordering::Relaxed);
        debug_assert!((MIN_PRIORITY..=MAX_PRIORITY).contains(&priority));
        priority
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire).max(0) as u64
    }

    pub fn is_file_open(&self) -> bool {
        self.file_open.load(Ordering::Acquire)
    }

    pub fn to_be_destroyed(&self) -> bool {
        self.to_be_destroyed.load(Ordering::Acquire)
    }

    pub fn set_to_be_destroyed(&self) {
        self.to_be_destroyed.store(true, Ordering::Release);
        self.set_ready_for_io(false);
    }

    pub fn ready_for_io(&self) -> bool {
        self.ready_for_io.load(Ordering::Acquire)
    }

    pub fn set_ready_for_io(&self, ready: bool) {
        self.ready_for_io.store(ready, Ordering::Release);
    }

    pub fn requires_scheduling(&self) -> bool {
        self.requires_scheduling.load(Ordering::Acquire)
    }

    pub fn is_caching_stream(&self) -> bool {
        self.is_caching.load(Ordering::Relaxed)
    }

    pub fn time_since_last_transfer_ms(&self, now_ms: u64) -> f32 {
        now_ms.saturating_sub(self.io_start_time.load(Ordering::Relaxed)) as f32
    }

    pub fn stamp_io_start(&self) {
        self.io_start_time
            .store(self.device.time_ms(), Ordering::Relaxed);
    }

    /// Takes (or keeps) this task's slot in the scheduler semaphore. The
    /// status lock of the owning stream must be held.
    pub fn signal_scheduling(&self, signal: bool) {
        if signal {
            if !self.requires_scheduling.swap(true, Ordering::AcqRel) {
                self.device.sem_incr(self.is_auto);
            }
        } else if self.requires_scheduling.swap(false, Ordering::AcqRel) {
            self.device.sem_decr(self.is_auto);
        }
    }

    pub fn set_file_open(&self, desc: FileDescriptor) {
        self.file_size.store(desc.file_size, Ordering::Release);
        *self.desc.lock() = desc;
        self.file_open.store(true, Ordering::Release);
    }

    pub fn set_deferred_open(&self, desc: FileDescriptor, open: DeferredOpen) {
        *self.desc.lock() = desc;
        *self.deferred_open.lock() = Some(open);
    }

    /// Resolves a pending open command, if any. Always called from the I/O
    /// thread, before a transfer is prepared. `Ok(true)` means an open was
    /// actually executed.
    pub fn ensure_file_is_open(&self) -> Result<bool> {
        let pending = self.deferred_open.lock().take();
        let open = match pending {
            Some(open) => open,
            None => return Ok(false),
        };
        if self.to_be_destroyed() {
            return Ok(false);
        }

        let resolver = self.device.resolver().ok_or(Error::ErrNoResolver)?;
        let outcome = match &open {
            DeferredOpen::ByName {
                name,
                flags,
                open_mode,
            } => resolver.open_by_name(name, *open_mode, flags.as_ref(), true),
            DeferredOpen::ById {
                file_id,
                flags,
                open_mode,
            } => resolver.open_by_id(*file_id, *open_mode, flags.as_ref(), true),
        };

        let read_mode = matches!(
            &open,
            DeferredOpen::ByName {
                open_mode: OpenMode::Read,
                ..
            } | DeferredOpen::ById {
                open_mode: OpenMode::Read,
                ..
            }
        );

        match outcome {
            Ok(outcome) if !outcome.deferred => {
                if outcome.desc.file_size <= 0 && read_mode {
                    warn!("deferred open resolved a file with no data to read");
                    return Err(Error::ErrFileSizeZero);
                }
                self.set_file_open(outcome.desc);
                Ok(true)
            }
            Ok(_) => {
                warn!("resolver deferred an open requested synchronously");
                Err(Error::ErrIoDevice)
            }
            Err(e) => {
                warn!("deferred open failed: {}", e);
                Err(e)
            }
        }
    }

    /// Closes the file in the low-level hook, once.
    pub fn close_file(&self) {
        if self.file_open.load(Ordering::Acquire) && !self.file_closed.swap(true, Ordering::AcqRel)
        {
            let desc = self.desc.lock().clone();
            self.device.hook().close(&desc);
        }
    }

    /// Clamps a request to the end of file. Caching streams additionally
    /// never read past their nominal buffering.
    pub fn clamp_request_size_to_eof(
        &self,
        position: u64,
        desired_size: u32,
        nominal_buffering: u32,
    ) -> (u32, bool) {
        let eof_position = self.file_size();
        let (mut clamped, eof) = if position + desired_size as u64 <= eof_position {
            (desired_size, false)
        } else if position < eof_position {
            ((eof_position - position) as u32, true)
        } else {
            (0, true)
        };

        if self.is_caching_stream() && position + clamped as u64 > nominal_buffering as u64 {
            clamped = nominal_buffering.saturating_sub(position as u32);
        }

        (clamped, eof)
    }
}
