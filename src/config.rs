use crate::error::{Error, Result};
use crate::file::{Priority, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};

/// 2 MiB of I/O memory per device, split up in blocks of at most
/// `granularity` bytes. The smaller the granularity, the smaller this pool
/// can be to serve the same number of streams; a small granularity is often
/// inefficient regarding raw I/O throughput, however.
pub(crate) const DEFAULT_IO_MEMORY_SIZE: u32 = 2 * 1024 * 1024;
pub(crate) const DEFAULT_GRANULARITY: u32 = 16 * 1024;
pub(crate) const DEFAULT_IO_MEMORY_ALIGNMENT: u32 = 16;
/// Target buffering ahead of consumption for automatic streams, in
/// milliseconds.
pub(crate) const DEFAULT_TARGET_BUFFER_LENGTH_MS: f32 = 380.0;
pub(crate) const DEFAULT_MAX_CONCURRENT_IO: u32 = 8;
/// Smallest buddy bucket the pool will ever hand out. Smaller would decrease
/// fragmentation but costs allocator passes.
pub(crate) const ABSOLUTE_MIN_BLOCK_SIZE: u32 = 512;
/// Floor for the nominal buffering of a caching stream.
pub(crate) const CACHING_STREAM_MIN_BUFFER_SIZE: u32 = 2048;
/// Minimal throughput heuristic, bytes per millisecond.
pub(crate) const MINIMAL_THROUGHPUT: f32 = 1.0;

/// How the device talks to its low-level hook.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedulerType {
    /// One request in flight, executed synchronously on the I/O thread.
    Blocking,
    /// Up to `max_concurrent_io` asynchronous requests with completion
    /// callbacks. Requests are issued lined up; completions may arrive out of
    /// order.
    DeferredLinedUp,
}

/// Properties of the per-device I/O worker thread.
///
/// The worker spends most of its time sleeping or waiting for the device, so
/// a priority above normal is appropriate where the platform honors it.
#[derive(Debug, Clone)]
pub struct ThreadProperties {
    pub stack_size: Option<usize>,
    pub name: Option<String>,
}

impl Default for ThreadProperties {
    fn default() -> Self {
        ThreadProperties {
            stack_size: None,
            name: None,
        }
    }
}

/// Global settings for the stream manager.
#[derive(Debug, Clone, Default)]
pub struct StreamMgrSettings {
    /// Current language directory name used by the resolver for
    /// language-specific files.
    pub language: Option<String>,
}

/// Per-device settings.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// I/O pool byte budget. Zero disables automatic streams on this device.
    pub io_memory_size: u32,
    /// Required alignment of I/O buffers.
    pub io_memory_alignment: u32,
    /// Maximum transfer size for a single low-level I/O call. Streaming
    /// buffers are at most this big.
    pub granularity: u32,
    pub scheduler_type: SchedulerType,
    pub thread_properties: ThreadProperties,
    /// Target buffering ahead of consumption for automatic streams, in
    /// milliseconds of playback at the stream's throughput.
    pub target_auto_stream_buffer_length_ms: f32,
    /// Maximum number of transfers in flight on a deferred device, in
    /// `[1, 1024]`. A blocking device always runs one at a time.
    pub max_concurrent_io: u32,
    /// Enables the content-addressed cache (block reuse across streams).
    pub use_stream_cache: bool,
    /// Budget for data held by caching (pinned-file) streams.
    pub max_cache_pinned_bytes: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            io_memory_size: DEFAULT_IO_MEMORY_SIZE,
            io_memory_alignment: DEFAULT_IO_MEMORY_ALIGNMENT,
            granularity: DEFAULT_GRANULARITY,
            scheduler_type: SchedulerType::Blocking,
            thread_properties: ThreadProperties::default(),
            target_auto_stream_buffer_length_ms: DEFAULT_TARGET_BUFFER_LENGTH_MS,
            max_concurrent_io: DEFAULT_MAX_CONCURRENT_IO,
            use_stream_cache: false,
            max_cache_pinned_bytes: u32::MAX,
        }
    }
}

impl DeviceSettings {
    pub fn with_io_memory_size(mut self, value: u32) -> Self {
        self.io_memory_size = value;
        self
    }

    pub fn with_granularity(mut self, value: u32) -> Self {
        self.granularity = value;
        self
    }

    pub fn with_scheduler_type(mut self, value: SchedulerType) -> Self {
        self.scheduler_type = value;
        self
    }

    pub fn with_target_buffer_length_ms(mut self, value: f32) -> Self {
        self.target_auto_stream_buffer_length_ms = value;
        self
    }

    pub fn with_max_concurrent_io(mut self, value: u32) -> Self {
        self.max_concurrent_io = value;
        self
    }

    pub fn with_stream_cache(mut self, value: bool) -> Self {
        self.use_stream_cache = value;
        self
    }

    pub fn with_max_cache_pinned_bytes(mut self, value: u32) -> Self {
        self.max_cache_pinned_bytes = value;
        self
    }

    /// Rejects setting combinations the device cannot run with.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.granularity == 0 {
            return Err(Error::ErrInvalidParameter);
        }
        if self.io_memory_size != 0 && self.target_auto_stream_buffer_length_ms < 0.0 {
            return Err(Error::ErrInvalidParameter);
        }
        if self.scheduler_type == SchedulerType::DeferredLinedUp
            && !(1..=1024).contains(&self.max_concurrent_io)
        {
            return Err(Error::ErrInvalidParameter);
        }
        if self.io_memory_alignment == 0 || !self.io_memory_alignment.is_power_of_two() {
            return Err(Error::ErrInvalidParameter);
        }
        Ok(())
    }
}

/// Streaming heuristics of an automatic stream.
#[derive(Debug, Clone)]
pub struct AutoStmHeuristics {
    /// Average consumption rate, in bytes per millisecond.
    pub throughput: f32,
    /// Start of the loop region (byte offset), 0 when not looping. Snapped
    /// down to the low-level block size.
    pub loop_start: u32,
    /// End of the loop region (byte offset), 0 when not looping. Clamped to
    /// the file size.
    pub loop_end: u32,
    /// Minimal number of buffers the client plans to own at a time, 0 or 1
    /// otherwise.
    pub min_num_buffers: u8,
    pub priority: Priority,
}

impl Default for AutoStmHeuristics {
    fn default() -> Self {
        AutoStmHeuristics {
            throughput: 0.0,
            loop_start: 0,
            loop_end: 0,
            min_num_buffers: 0,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl AutoStmHeuristics {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.throughput < 0.0
            || self.priority < MIN_PRIORITY
            || self.priority > MAX_PRIORITY
        {
            return Err(Error::ErrInvalidParameter);
        }
        Ok(())
    }
}

/// Client constraints on an automatic stream's buffers. All zeros means
/// unconstrained (recommended).
#[derive(Debug, Clone, Default)]
pub struct AutoStmBufSettings {
    /// Hard buffer size. Must divide evenly into the device granularity and
    /// the effective buffer alignment.
    pub buffer_size: u32,
    /// Minimal buffer size handed out to the client (except the last buffer
    /// before EOF).
    pub min_buffer_size: u32,
    /// Client-side block size. The effective buffer alignment becomes the
    /// least common multiple of this and the low-level block size.
    pub block_size: u32,
}
