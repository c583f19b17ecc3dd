use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::{
    AutoStmBufSettings, AutoStmHeuristics, SchedulerType, CACHING_STREAM_MIN_BUFFER_SIZE,
    MINIMAL_THROUGHPUT,
};
use crate::error::{Error, Result};
use crate::file::{FileDescriptor, FileId, MoveMethod, Priority, MAX_PRIORITY, MIN_PRIORITY};
use crate::hook::{RawRegion, TransferInfo};
use crate::memory::block::{BlockData, BlockState};
use crate::memory::view::{DataRef, GrantedBuffer, MemView, ViewStatus};
use crate::stream::{LaunchInfo, Prepared, Task, TaskCommon};

/// Outcome of [`AutoStream::get_buffer`].
#[derive(Debug)]
pub enum GetBufferResult {
    /// A buffer was granted.
    DataReady(GrantedBuffer),
    /// No data is ready yet; more is coming.
    NoDataReady,
    /// End of file: the granted buffer, if any, is the last one.
    NoMoreData(Option<GrantedBuffer>),
}

/// Outcome of [`AutoStream::query_buffering_status`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferingStatus {
    DataReady,
    NoDataReady,
    NoMoreData,
}

/// Transfers in flight, per device flavor.
enum AutoXfers {
    Blocking {
        current: Option<Arc<MemView>>,
        /// The last transfer was cancelled and has not settled yet.
        cancelled: bool,
    },
    Deferred {
        /// Oldest first; never holds cancelled views.
        pending: VecDeque<Arc<MemView>>,
        cancelled: Vec<Arc<MemView>>,
    },
}

struct AutoState {
    running: bool,
    io_error: bool,
    /// Caching stream fully constructed and started.
    caching_ready: bool,

    throughput: f32,
    caching_buffer_size: u32,
    loop_start: u32,
    loop_end: u32,
    min_num_buffers: u8,

    buffer_size: u32,
    min_buffer_size: u32,
    /// LCM of the low-level block size and the client block size.
    buffer_alignment: u32,

    /// Expected position of the next `get_buffer` (relative to file start).
    next_expected_user_position: u64,
    /// Views whose concatenation is the buffered prefix of the file. The
    /// first `next_to_grant` entries are held by the client.
    buffers: VecDeque<Arc<MemView>>,
    next_to_grant: u8,
    /// Sum of buffered data and pending transfers, minus what is granted to
    /// the client; loop-aware. Drives scheduling without walking the lists.
    virtual_buffering: u32,

    xfers: AutoXfers,
}

/// Automatic stream: a continuously refilled window over a file, granted to
/// the client buffer by buffer.
pub struct AutoStream {
    pub(crate) common: TaskCommon,
    pub(crate) weak_self: Weak<AutoStream>,
    /// Cache identity shared with other streams on the same file.
    file_id: Option<FileId>,
    state: Mutex<AutoState>,
    completion: Condvar,
    /// Mirror of the virtual buffering size for lock-free scheduler reads.
    virtual_buffering: AtomicU32,
    /// Mirror of the throughput heuristic (f32 bits).
    throughput_bits: AtomicU32,
}

impl std::fmt::Debug for AutoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoStream").finish()
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    debug_assert!(a > 0 && b > 0);
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

impl AutoStream {
    pub(crate) fn create(
        device: Arc<crate::device::Device>,
        desc: FileDescriptor,
        file_id: Option<FileId>,
        heuristics: &AutoStmHeuristics,
        buffer_settings: Option<&AutoStmBufSettings>,
    ) -> Result<Arc<AutoStream>> {
        heuristics.validate()?;

        if !device.has_pool() {
            warn!("streaming pool does not exist: cannot create automatic stream");
            return Err(Error::ErrStreamingDisabled);
        }
        if desc.file_size < 0 {
            return Err(Error::ErrInvalidParameter);
        }

        let granularity = device.granularity();
        let ll_block_size = device.hook().block_size(&desc);
        if ll_block_size == 0 || ll_block_size > granularity || granularity % ll_block_size != 0 {
            warn!(
                "low-level block size {} incompatible with granularity {}",
                ll_block_size, granularity
            );
            return Err(Error::ErrIncompatibleSettings);
        }

        let throughput = heuristics.throughput.max(MINIMAL_THROUGHPUT);
        let loop_start = heuristics.loop_start - (heuristics.loop_start % ll_block_size);
        let loop_end = if (heuristics.loop_end as i64) <= desc.file_size {
            heuristics.loop_end
        } else {
            desc.file_size as u32
        };
        let min_num_buffers = heuristics.min_num_buffers.max(1);
        let file_size = desc.file_size;
        let scheduler_type = device.scheduler_type();
        let stream_id = device.new_stream_id();

        let mut state = AutoState {
            running: false,
            io_error: false,
            caching_ready: false,
            throughput,
            caching_buffer_size: 0,
            loop_start,
            loop_end,
            min_num_buffers,
            buffer_size: 0,
            min_buffer_size: 0,
            buffer_alignment: ll_block_size,
            next_expected_user_position: 0,
            buffers: VecDeque::new(),
            next_to_grant: 0,
            virtual_buffering: 0,
            xfers: match scheduler_type {
                SchedulerType::Blocking => AutoXfers::Blocking {
                    current: None,
                    cancelled: false,
                },
                SchedulerType::DeferredLinedUp => AutoXfers::Deferred {
                    pending: VecDeque::new(),
                    cancelled: Vec::new(),
                },
            },
        };
        Self::apply_buffering_settings(&mut state, buffer_settings, granularity, ll_block_size)?;

        let stream = Arc::new_cyclic(|weak| AutoStream {
            common: TaskCommon::new(device, desc, ll_block_size, true, stream_id),
            weak_self: weak.clone(),
            file_id,
            state: Mutex::new(state),
            completion: Condvar::new(),
            virtual_buffering: AtomicU32::new(0),
            throughput_bits: AtomicU32::new(throughput.to_bits()),
        });
        stream
            .common
            .priority
            .store(heuristics.priority, Ordering::Release);
        if file_size == 0 {
            stream.common.has_reached_eof.store(true, Ordering::Release);
        }
        Ok(stream)
    }

    fn task(&self) -> Task {
        Task::Auto(self.weak_self.upgrade().expect("stream destroyed"))
    }

    /// Sets up buffer size and alignment according to the device granularity
    /// and the client's constraints.
    fn apply_buffering_settings(
        state: &mut AutoState,
        settings: Option<&AutoStmBufSettings>,
        granularity: u32,
        ll_block_size: u32,
    ) -> Result<()> {
        match settings {
            Some(settings) => {
                if settings.block_size > 0 {
                    // Effective alignment is the smallest common multiple of
                    // the client and low-level block sizes.
                    state.buffer_alignment = ll_block_size
                        * (settings.block_size / gcd(ll_block_size, settings.block_size));
                }

                state.buffer_size = granularity - (granularity % state.buffer_alignment);
                state.min_buffer_size = state.buffer_alignment;

                if settings.buffer_size != 0 {
                    if settings.buffer_size > granularity
                        || settings.buffer_size % state.buffer_alignment > 0
                    {
                        return Err(Error::ErrIncompatibleBufferSettings);
                    }
                    state.buffer_size = settings.buffer_size;
                    // Hard constraint: grants are exactly this big.
                    state.min_buffer_size = settings.buffer_size;
                } else if settings.min_buffer_size > 0
                    && state.min_buffer_size < settings.min_buffer_size
                {
                    let aligned = ((settings.min_buffer_size + state.buffer_alignment - 1)
                        / state.buffer_alignment)
                        * state.buffer_alignment;
                    if aligned > state.buffer_size {
                        return Err(Error::ErrIncompatibleBufferSettings);
                    }
                    state.min_buffer_size = aligned;
                }
            }
            None => {
                state.buffer_size = granularity - (granularity % ll_block_size);
                state.min_buffer_size = ll_block_size;
            }
        }
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.common.ll_block_size
    }

    pub fn set_stream_name(&self, name: &str) {
        *self.common.stream_name.lock() = Some(name.to_string());
    }

    pub fn file_size(&self) -> u64 {
        self.common.file_size()
    }

    pub fn is_open(&self) -> bool {
        self.common.is_file_open()
    }

    fn throughput(&self) -> f32 {
        f32::from_bits(self.throughput_bits.load(Ordering::Relaxed))
    }

    fn set_throughput(&self, state: &mut AutoState, throughput: f32) {
        state.throughput = throughput;
        self.throughput_bits
            .store(throughput.to_bits(), Ordering::Relaxed);
    }

    fn set_virtual_buffering(&self, state: &mut AutoState, value: u32) {
        state.virtual_buffering = value;
        self.virtual_buffering.store(value, Ordering::Release);
    }

    /// Amount of data buffered or scheduled beyond what the client holds.
    pub fn virtual_buffering_size(&self) -> u32 {
        self.virtual_buffering.load(Ordering::Acquire)
    }

    pub(crate) fn virtual_buffering(&self) -> u32 {
        self.virtual_buffering_size()
    }

    /// Target buffering: throughput over the device's target buffer length,
    /// or the pinned size for caching streams.
    pub fn nominal_buffering(&self) -> u32 {
        if self.common.is_caching_stream() {
            self.state.lock().caching_buffer_size
        } else {
            (self.common.device.target_buffer_length_ms() * self.throughput()) as u32
        }
    }

    fn needs_buffering(&self, virtual_buffering: u32) -> bool {
        virtual_buffering < self.nominal_buffering()
    }

    /// True when no further transfer is coming for the data the stream
    /// already committed to.
    fn needs_no_more_transfer(&self, state: &AutoState, actual_buffering: u32) -> bool {
        !self.common.requires_scheduling() && state.virtual_buffering <= actual_buffering
    }


    fn blocking_current(state: &AutoState) -> Option<Arc<MemView>> {
        match &state.xfers {
            AutoXfers::Blocking { current, .. } => current.clone(),
            AutoXfers::Deferred { .. } => None,
        }
    }

    /// Effective view size, taking looping heuristics into consideration: a
    /// view straddling the loop end only counts up to it.
    fn effective_view_size(state: &AutoState, view: &MemView) -> u32 {
        if view.start_position < state.loop_end as u64 && view.end_position > state.loop_end as u64
        {
            (state.loop_end as u64 - view.start_position) as u32
        } else {
            view.size()
        }
    }

    /// Starts automatic scheduling.
    pub fn start(&self) -> Result<()> {
        let io_error;
        let mut started = false;
        {
            let mut state = self.state.lock();
            io_error = state.io_error;
            if !state.running {
                self.set_running(&mut state, true);
                self.update_scheduling_status(&mut state);
                state.caching_ready = true;
                self.common.stamp_io_start();
                started = true;
            }
        }
        if started {
            // The scheduler should reevaluate memory usage.
            self.common.device.notify_mem_change();
        }
        if io_error {
            Err(Error::ErrIoDevice)
        } else {
            Ok(())
        }
    }

    /// Stops automatic scheduling and flushes everything not granted.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.stop_locked(&mut state);
        Ok(())
    }

    fn stop_locked(&self, state: &mut AutoState) {
        self.set_running(state, false);
        self.flush(state);
    }

    fn set_running(&self, state: &mut AutoState, running: bool) {
        state.running = running;
        self.common.set_ready_for_io(
            running
                && !self.common.has_reached_eof.load(Ordering::Acquire)
                && !self.common.to_be_destroyed(),
        );
    }

    fn set_reached_eof(&self, state: &AutoState, eof: bool) {
        self.common.has_reached_eof.store(eof, Ordering::Release);
        self.common
            .set_ready_for_io(state.running && !eof && !self.common.to_be_destroyed());
    }

    pub fn heuristics(&self) -> AutoStmHeuristics {
        let state = self.state.lock();
        AutoStmHeuristics {
            throughput: state.throughput,
            loop_start: state.loop_start,
            loop_end: state.loop_end,
            min_num_buffers: state.min_num_buffers,
            priority: self.common.priority(),
        }
    }

    pub fn set_priority(&self, priority: Priority) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(Error::ErrInvalidParameter);
        }
        self.common.priority.store(priority, Ordering::Release);
        Ok(())
    }

    /// Run-time heuristics change. A loop-bound change flushes every buffered
    /// view and pending transfer inconsistent with the new expected read
    /// sequence, and recomputes the virtual buffering from scratch.
    pub fn set_heuristics(&self, heuristics: &AutoStmHeuristics) -> Result<()> {
        self.set_priority(heuristics.priority)?;

        let new_throughput = heuristics.throughput.max(MINIMAL_THROUGHPUT);
        let file_size = self.common.file_size.load(Ordering::Acquire);
        let loop_end = if heuristics.loop_end as i64 <= file_size || !self.common.is_file_open() {
            heuristics.loop_end
        } else {
            file_size as u32
        };
        let new_min_num_buffers = heuristics.min_num_buffers.max(1);

        let mut state = self.state.lock();
        let loop_start =
            heuristics.loop_start - (heuristics.loop_start % self.common.ll_block_size);

        if state.loop_end != loop_end || state.loop_start != loop_start {
            self.set_throughput(&mut state, new_throughput);
            state.min_num_buffers = new_min_num_buffers;

            state.loop_start = loop_start;
            // Loop end changed: recompute virtual buffering from scratch.
            self.set_loop_end(&mut state, loop_end);

            // Inspect current views, ready and pending; flush anything
            // incompatible with the new looping heuristics.

            // 1) Expected position after the buffers already granted.
            let mut next_expected = state.next_expected_user_position;
            debug_assert!(state.buffers.len() >= state.next_to_grant as usize);
            for view in state.buffers.iter().take(state.next_to_grant as usize) {
                next_expected = view.end_position;
            }
            if loop_end > 0 && next_expected >= loop_end as u64 {
                next_expected = loop_start as u64;
            }

            // 2) Dequeue buffered views inconsistent with the expected
            // sequence.
            let mut keep = VecDeque::new();
            let mut remove = Vec::new();
            let granted = state.next_to_grant as usize;
            let mut index = 0;
            while let Some(view) = state.buffers.pop_front() {
                if index < granted {
                    index += 1;
                    keep.push_back(view);
                    continue;
                }
                if view.start_position != next_expected {
                    remove.push(view);
                } else {
                    next_expected = view.end_position;
                    if loop_end > 0 && next_expected >= loop_end as u64 {
                        next_expected = loop_start as u64;
                    }
                    keep.push_back(view);
                }
                index += 1;
            }
            state.buffers = keep;

            // 3) Release the dequeued buffers.
            for view in remove {
                self.destroy_buffer(&mut state, &view);
            }

            // 4) Do the same with pending transfers.
            self.cancel_inconsistent_pending_transfers(&mut state, next_expected);

            self.update_scheduling_status(&mut state);
        } else if state.throughput != new_throughput
            || state.min_num_buffers != new_min_num_buffers
        {
            state.min_num_buffers = new_min_num_buffers;
            self.set_throughput(&mut state, new_throughput);
            self.update_scheduling_status(&mut state);
        }
        Ok(())
    }

    /// Run-time change of the minimal buffer size handed out to the client.
    pub fn set_minimal_buffer_size(&self, min_buffer_size: u32) -> Result<()> {
        let settings = AutoStmBufSettings {
            buffer_size: 0,
            min_buffer_size,
            block_size: 0,
        };

        let mut state = self.state.lock();
        let old_min = state.min_buffer_size;
        let result = Self::apply_buffering_settings(
            &mut state,
            Some(&settings),
            self.common.device.granularity(),
            self.common.ll_block_size,
        );

        match result {
            Ok(()) => {
                if state.min_buffer_size > old_min {
                    self.flush_small_buffers_and_pending_transfers(&mut state, min_buffer_size);
                    self.update_scheduling_status(&mut state);
                }
                Ok(())
            }
            Err(e) => {
                self.update_task_status(&mut state, Err(Error::ErrIoDevice));
                Err(e)
            }
        }
    }

    /// Stream position as seen by the client.
    pub fn position(&self) -> (u64, bool) {
        let state = self.state.lock();
        let position = match state.buffers.front() {
            Some(first) => first.start_position,
            None => state.next_expected_user_position,
        };
        (position, position >= self.common.file_size())
    }

    /// Seeks the stream, floored to the low-level block size. Everything
    /// buffered ahead that does not match the new position is flushed.
    pub fn set_position(&self, move_offset: i64, move_method: MoveMethod) -> Result<i64> {
        let base = match move_method {
            MoveMethod::Begin => 0,
            MoveMethod::Current => self.position().0 as i64,
            MoveMethod::End => self.common.file_size.load(Ordering::Acquire),
        };
        let mut position = base + move_offset;
        if position < 0 {
            return Err(Error::ErrPositionOutOfRange);
        }
        position -= position % self.common.ll_block_size as i64;

        let real_offset = match move_method {
            MoveMethod::Begin => position,
            MoveMethod::Current => position - base,
            MoveMethod::End => position - self.common.file_size.load(Ordering::Acquire),
        };

        self.force_file_position(position as u64);
        Ok(real_offset)
    }

    fn force_file_position(&self, new_position: u64) {
        let mut state = self.state.lock();
        state.next_expected_user_position = new_position;

        // If the next buffer to grant matches the new position, keep
        // everything; otherwise flush all that was not granted.
        if (state.next_to_grant as usize) < state.buffers.len() {
            let next_start = state.buffers[state.next_to_grant as usize].start_position;
            if next_start != new_position {
                self.flush(&mut state);
                debug_assert_eq!(state.buffers.len(), state.next_to_grant as usize);
            } else {
                self.update_scheduling_status(&mut state);
            }
        } else {
            // Nothing buffered; there might still be pending transfers
            // inconsistent with the new position.
            self.cancel_inconsistent_pending_transfers(&mut state, new_position);
            self.update_scheduling_status(&mut state);
        }
    }

    /// Grants the next ready buffer.
    ///
    /// With `wait` set, blocks until data is ready or the end of file is
    /// reached; a cache pull is attempted before blocking.
    pub fn get_buffer(&self, wait: bool) -> Result<GetBufferResult> {
        let mut state = self.state.lock();

        if state.next_to_grant == u8::MAX {
            return Err(Error::ErrTooManyBuffersGranted);
        }

        let mut grant = self.get_read_buffer(&mut state);

        if grant.is_none() && !state.io_error {
            debug_assert!(
                state.running || !wait,
                "blocking get_buffer on a stopped stream"
            );

            // Retry through the cache; only then consider blocking.
            let retried = self.get_buffer_or_reserve_cache_block(&mut state);
            if retried.is_some() {
                grant = retried;
            } else if wait {
                while grant.is_none() && !state.io_error && !self.needs_no_more_transfer(&state, 0)
                {
                    self.common.blocked.store(true, Ordering::Release);
                    self.completion.wait(&mut state);
                    grant = self.get_read_buffer(&mut state);
                }
                self.common.blocked.store(false, Ordering::Release);
            }
        }

        let io_error = state.io_error;
        let end_of_data = self.common.has_reached_eof.load(Ordering::Acquire)
            && state.next_expected_user_position >= self.common.file_size();
        drop(state);

        if io_error {
            return Err(Error::ErrStreamInError);
        }
        match grant {
            None => {
                if end_of_data {
                    Ok(GetBufferResult::NoMoreData(None))
                } else {
                    debug_assert!(!wait, "blocking get_buffer cannot return no-data-ready");
                    Ok(GetBufferResult::NoDataReady)
                }
            }
            Some(buffer) => {
                if end_of_data {
                    Ok(GetBufferResult::NoMoreData(Some(buffer)))
                } else {
                    Ok(GetBufferResult::DataReady(buffer))
                }
            }
        }
    }

    /// Releases the oldest buffer granted through `get_buffer`.
    pub fn release_buffer(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.next_to_grant == 0 {
            return Err(Error::ErrNoBufferGranted);
        }

        let first = state.buffers.pop_front().expect("granted buffer missing");
        self.common.device.destroy_mem_view(&first);
        state.next_to_grant -= 1;
        self.update_scheduling_status(&mut state);
        Ok(())
    }

    /// Returns the next ungranted view as a client grant, and accounts for
    /// it. Status lock held.
    fn get_read_buffer(&self, state: &mut AutoState) -> Option<GrantedBuffer> {
        debug_assert!(state.next_to_grant < u8::MAX);

        if (state.next_to_grant as usize) >= state.buffers.len() {
            return None;
        }

        let view = state.buffers[state.next_to_grant as usize].clone();
        if view.start_position != state.next_expected_user_position {
            // The client read past the loop-end heuristic without seeking
            // accordingly. Flush and clear looping so the mistake does not
            // repeat.
            self.set_loop_end(state, 0);
            self.flush(state);
            return None;
        }

        state.next_to_grant += 1;
        state.next_expected_user_position = view.end_position;

        let size = view.size();
        let effective = Self::effective_view_size(state, &view);
        let virtual_buffering = state.virtual_buffering - effective;
        self.set_virtual_buffering(state, virtual_buffering);

        self.update_scheduling_status(state);

        let offset = match view.data {
            DataRef::Pool { offset } => offset,
            DataRef::Client(_) => unreachable!("automatic stream data is pooled"),
        };
        let storage = self
            .common
            .device
            .storage()
            .expect("automatic stream without pool");
        Some(GrantedBuffer::new(storage, offset, size))
    }

    /// Returns a grant for the next expected data, pulling it synchronously
    /// from cache if possible. Status lock held.
    fn get_buffer_or_reserve_cache_block(&self, state: &mut AutoState) -> Option<GrantedBuffer> {
        if !self.common.is_file_open() {
            return None;
        }
        if let Some(buffer) = self.get_read_buffer(state) {
            return Some(buffer);
        }
        if self.execute_cached_transfer(state) {
            return self.get_read_buffer(state);
        }
        None
    }

    /// Performs a direct transfer from the cache, from the client thread.
    /// Status lock held. Returns true if a buffer was added.
    pub(crate) fn execute_cached_transfer(&self, state: &mut AutoState) -> bool {
        let prepared = self.prepare_transfer_locked(state, true);
        if self.common.device.is_deferred() {
            self.common.device.decrement_io_count();
        }
        match prepared {
            Prepared::Ready(view) => {
                let added = self.update_locked(state, Some(view), &Ok(()), false);
                self.update_task_status(state, Ok(()));
                added
            }
            Prepared::Aborted => false,
            _ => unreachable!("cache-only transfers never reach the backend"),
        }
    }

    /// Amount of ready data not yet granted. Status lock held.
    fn calc_unconsumed_buffer_size(&self, state: &AutoState) -> u32 {
        state
            .buffers
            .iter()
            .skip(state.next_to_grant as usize)
            .map(|view| view.size())
            .sum()
    }

    /// Reports the stream's buffering level, draining the cache while the
    /// target is not met.
    pub fn query_buffering_status(&self) -> Result<(u32, BufferingStatus)> {
        let mut state = self.state.lock();
        if state.io_error {
            return Err(Error::ErrStreamInError);
        }
        if !self.common.is_file_open() {
            return Ok((0, BufferingStatus::NoDataReady));
        }

        let mut available;
        let mut buffering_ready;
        loop {
            available = self.calc_unconsumed_buffer_size(&state);
            // Pull readily available cache data as long as more is needed.
            buffering_ready = self.needs_no_more_transfer(&state, available);
            if buffering_ready || !self.execute_cached_transfer(&mut state) {
                break;
            }
        }

        let mut status = if available > 0 {
            BufferingStatus::DataReady
        } else {
            BufferingStatus::NoDataReady
        };
        // Let the client know when the device cannot stream in any more
        // data, to avoid hangs.
        if buffering_ready || self.common.device.cannot_schedule_auto_streams() {
            status = BufferingStatus::NoMoreData;
        }
        Ok((available, status))
    }

    // Caching stream surface.

    pub(crate) fn set_caching_buffer_size(&self, num_bytes: u32) {
        debug_assert!(self.common.is_caching_stream());
        let mut state = self.state.lock();
        state.caching_buffer_size = CACHING_STREAM_MIN_BUFFER_SIZE
            .max((((num_bytes - 1) / state.buffer_alignment) + 1) * state.buffer_alignment);
    }

    pub(crate) fn start_caching(&self) {
        let ready = self.state.lock().caching_ready;
        if ready {
            let _ = self.start();
        }
    }

    /// Stops caching and releases held buffers, up to `mem_needed` bytes.
    /// Returns the amount freed.
    pub(crate) fn stop_caching(&self, mem_needed: u32) -> u32 {
        let mut state = self.state.lock();
        let freed = self.release_caching_buffers(&mut state, mem_needed);
        self.set_running(&mut state, false);
        self.update_scheduling_status(&mut state);
        freed
    }

    /// Frees caching data starting with the most recent pending transfer and
    /// working backwards. Status lock held.
    fn release_caching_buffers(&self, state: &mut AutoState, target: u32) -> u32 {
        let mut freed = 0u32;

        // Newest pending transfers go first.
        let mut moved = Vec::new();
        let is_deferred = matches!(state.xfers, AutoXfers::Deferred { .. });
        if is_deferred {
            let mut completed = Vec::new();
            while freed < target {
                let view = match state.xfers {
                    AutoXfers::Deferred {
                        ref mut pending, ..
                    } => pending.pop_back(),
                    AutoXfers::Blocking { .. } => None,
                };
                let view = match view {
                    Some(view) => view,
                    None => break,
                };
                debug_assert!(view.status() != ViewStatus::Cancelled);
                freed += view.size();
                if view.status() == ViewStatus::Pending {
                    moved.push(view);
                } else {
                    completed.push(view);
                }
            }
            for view in completed {
                self.cancel_completed(state, &view);
            }
        }
        match state.xfers {
            AutoXfers::Deferred { .. } => {}
            AutoXfers::Blocking { .. } => {
                if freed < target {
                    if let Some(view) = Self::blocking_current(state) {
                        freed += view.size();
                        self.cancel_current_transfer(state, &view);
                    }
                }
            }
        }
        for view in &moved {
            self.add_to_cancelled_list(state, view);
        }

        // Some remaining pending transfers may have completed out of order.
        self.update_completed_transfers(state);

        // Then the ready buffers, newest first.
        while freed < target {
            if state.buffers.len() <= state.next_to_grant as usize {
                break;
            }
            let last = match state.buffers.pop_back() {
                Some(last) => last,
                None => break,
            };
            freed += last.size();
            self.destroy_buffer(state, &last);
        }

        // Notify the backend for the transfers just cancelled.
        if !moved.is_empty() {
            let all_cancelled_init = match &state.xfers {
                AutoXfers::Deferred { pending, .. } => pending.is_empty(),
                AutoXfers::Blocking { .. } => false,
            };
            self.notify_cancelled(state, all_cancelled_init);
        }

        freed
    }

    // Transfer plumbing.

    /// File position right after the last valid (non-cancelled) pending
    /// transfer; falls back to the end of buffering, then to the expected
    /// user position. Status lock held.
    fn get_virtual_file_position(&self, state: &AutoState) -> u64 {
        match &state.xfers {
            AutoXfers::Blocking { current, .. } => {
                if let Some(current) = current {
                    return current.end_position;
                }
            }
            AutoXfers::Deferred { pending, .. } => {
                if let Some(last) = pending.back() {
                    return last.end_position;
                }
            }
        }
        if state.buffers.len() > state.next_to_grant as usize {
            state.buffers.back().expect("non-empty").end_position
        } else {
            state.next_expected_user_position
        }
    }

    /// Position and size of the next transfer, with loop wrap applied.
    fn get_position_for_next_transfer(&self, state: &AutoState) -> (u64, u32, bool) {
        let mut position = self.get_virtual_file_position(state);
        if state.loop_end != 0 && position >= state.loop_end as u64 {
            // Wrap to the beginning of the loop region.
            position = state.loop_start as u64;
        }
        let (requested, eof) = self.common.clamp_request_size_to_eof(
            position,
            state.buffer_size,
            self.nominal_buffering_locked(state),
        );
        (position, requested, eof)
    }

    fn nominal_buffering_locked(&self, state: &AutoState) -> u32 {
        if self.common.is_caching_stream() {
            state.caching_buffer_size
        } else {
            (self.common.device.target_buffer_length_ms() * state.throughput) as u32
        }
    }

    pub(crate) fn prepare_transfer(&self, cache_only: bool) -> Prepared {
        let mut state = self.state.lock();
        self.prepare_transfer_locked(&mut state, cache_only)
    }

    fn prepare_transfer_locked(&self, state: &mut AutoState, cache_only: bool) -> Prepared {
        let device = self.common.device.clone();
        let deferred = device.is_deferred();

        if deferred {
            // From here on, update() must run to balance the count, whether
            // the transfer happens or not.
            device.increment_io_count();
        }

        if self.common.to_be_destroyed() || !self.common.ready_for_io() {
            return Prepared::Aborted;
        }
        if let AutoXfers::Blocking { ref current, .. } = state.xfers {
            // Need to test for a current transfer to avoid reading a cache
            // block in progress.
            if current.is_some() {
                return Prepared::Aborted;
            }
        }

        let (position, mut requested_size, eof) = self.get_position_for_next_transfer(state);
        // Caching streams can be exactly at the end of their prefetch
        // buffer.
        if requested_size == 0 {
            return Prepared::Aborted;
        }

        let min_size = state.min_buffer_size.min(requested_size);
        let alignment = state.buffer_alignment;
        let file_id = self.file_id;
        let sector_offset = self.common.desc.lock().sector_offset;
        let owner = || {
            if deferred {
                Some(self.task())
            } else {
                None
            }
        };

        enum Staged {
            Abort,
            Ready(Arc<MemView>, u32),
            Attached(Arc<MemView>, u32),
            Launch(LaunchInfo, u32),
        }

        let staged = device.with_inner(|inner| {
            let cached = match file_id {
                Some(file_id) if inner.mem.use_cache() => inner.mem.get_cached_block(
                    file_id,
                    position,
                    min_size,
                    alignment,
                    eof,
                    &mut requested_size,
                ),
                _ => None,
            };

            if cache_only {
                match cached {
                    None => return Staged::Abort,
                    Some((id, _)) if inner.mem.block(id).is_busy() => {
                        // Cached data still being filled up cannot be used
                        // synchronously.
                        inner.mem.release_block(id);
                        return Staged::Abort;
                    }
                    _ => {}
                }
            }

            match cached {
                Some((id, offset)) => {
                    let block = inner.mem.block(id);
                    let data_offset = match block.data {
                        BlockData::Pool { offset: o } => o + offset,
                        BlockData::Client(_) => unreachable!(),
                    };
                    let view = MemView::new(
                        id,
                        offset,
                        DataRef::Pool {
                            offset: data_offset,
                        },
                        position,
                        block.position + block.avail_size as u64,
                        block.alloc_size,
                        owner(),
                    );
                    match block.transfer() {
                        Some(transfer) => {
                            // The block is being refilled: observe the
                            // transfer in flight instead of issuing our own.
                            debug_assert!(deferred);
                            inner.add_observer(transfer, view.clone());
                            Staged::Attached(view, requested_size)
                        }
                        None => {
                            debug_assert!(!inner.mem.block(id).is_busy());
                            Staged::Ready(view, requested_size)
                        }
                    }
                }
                None => {
                    let id = match inner.mem.get_oldest_free_block(requested_size, alignment) {
                        Some(id) => id,
                        None => return Staged::Abort,
                    };
                    let block = inner.mem.block(id);
                    let alloc_size = block.alloc_size;
                    let data_offset = match block.data {
                        BlockData::Pool { offset } => offset,
                        BlockData::Client(_) => unreachable!(),
                    };
                    let view = MemView::new(
                        id,
                        0,
                        DataRef::Pool {
                            offset: data_offset,
                        },
                        position,
                        position + requested_size as u64,
                        alloc_size,
                        owner(),
                    );
                    let region = RawRegion {
                        ptr: inner
                            .mem
                            .storage()
                            .expect("automatic stream without pool")
                            .ptr(data_offset),
                        // The low-level may legally write up to the block's
                        // full (aligned) allocation.
                        len: alloc_size as usize,
                    };
                    let info = TransferInfo {
                        file_position: position + sector_offset,
                        buffer_size: alloc_size,
                        requested_size,
                    };

                    let transfer = if deferred {
                        Some(inner.new_transfer(
                            info,
                            id,
                            self.task(),
                            view.clone(),
                            region,
                            false,
                        ))
                    } else {
                        None
                    };

                    // Tagging can fail to make the block shareable (no cache
                    // identity); the transfer proceeds regardless.
                    inner.mem.tag_block(
                        id,
                        BlockState::Busy { transfer },
                        file_id,
                        position,
                        requested_size,
                    );

                    Staged::Launch(
                        LaunchInfo {
                            view,
                            transfer,
                            info,
                            region,
                            write: false,
                        },
                        requested_size,
                    )
                }
            }
        });

        let (view, accepted, prepared) = match staged {
            Staged::Abort => return Prepared::Aborted,
            Staged::Ready(view, accepted) => (view.clone(), accepted, Prepared::Ready(view)),
            Staged::Attached(view, accepted) => (view.clone(), accepted, Prepared::Attached),
            Staged::Launch(launch, accepted) => {
                (launch.view.clone(), accepted, Prepared::Launch(launch))
            }
        };

        match state.xfers {
            AutoXfers::Blocking {
                ref mut current, ..
            } => *current = Some(view),
            AutoXfers::Deferred {
                ref mut pending, ..
            } => pending.push_back(view),
        }

        // The virtual buffering size takes looping heuristics into account;
        // clamp the contribution of a transfer straddling the loop end.
        let mut accounted = accepted;
        if position < state.loop_end as u64 && position + accepted as u64 > state.loop_end as u64 {
            accounted = (state.loop_end as u64 - position) as u32;
        }
        let virtual_buffering = state.virtual_buffering + accounted;
        self.set_virtual_buffering(state, virtual_buffering);

        self.update_scheduling_status(state);
        self.common.stamp_io_start();

        prepared
    }

    pub(crate) fn update(
        &self,
        view: Option<Arc<MemView>>,
        result: Result<()>,
        required_low_level: bool,
    ) -> bool {
        let mut state = self.state.lock();
        let added = self.update_locked(&mut state, view, &result, required_low_level);
        if self.common.device.is_deferred() {
            self.common.device.decrement_io_count();
        }
        self.update_task_status(&mut state, result);
        added
    }

    fn update_locked(
        &self,
        state: &mut AutoState,
        view: Option<Arc<MemView>>,
        result: &Result<()>,
        required_low_level: bool,
    ) -> bool {
        let view = match view {
            Some(view) => view,
            None => return false,
        };
        let mut buffer_added = false;

        match state.xfers {
            AutoXfers::Blocking { .. } => {
                let had_current = matches!(
                    state.xfers,
                    AutoXfers::Blocking {
                        current: Some(_),
                        ..
                    }
                );
                let store = result.is_ok() && had_current && view.do_store_data();
                // Using cache: the view is ready without a low-level
                // transfer.
                if !required_low_level && store {
                    view.tag_as_ready();
                }
                self.add_mem_view(state, &view, store);
                if let AutoXfers::Blocking {
                    ref mut current,
                    ref mut cancelled,
                } = state.xfers
                {
                    *current = None;
                    *cancelled = false;
                }
                buffer_added = true;
            }
            AutoXfers::Deferred { .. } => {
                if view.status() == ViewStatus::Cancelled {
                    if let AutoXfers::Deferred {
                        ref mut cancelled, ..
                    } = state.xfers
                    {
                        if let Some(pos) = cancelled.iter().position(|v| Arc::ptr_eq(v, &view)) {
                            cancelled.remove(pos);
                        }
                    }
                    self.add_mem_view(state, &view, false);
                } else if result.is_err() {
                    Self::remove_pending(state, &view);
                    self.add_mem_view(state, &view, false);
                } else if Self::is_oldest_pending(state, &view) {
                    Self::remove_pending(state, &view);
                    if !required_low_level {
                        view.tag_as_ready();
                    }
                    self.add_mem_view(state, &view, true);
                    buffer_added = true;
                    self.update_completed_transfers(state);
                } else {
                    // Completed out of order: hold it until its predecessors
                    // complete.
                    view.tag_as_completed();
                }
            }
        }

        buffer_added
    }

    fn is_oldest_pending(state: &AutoState, view: &Arc<MemView>) -> bool {
        match &state.xfers {
            AutoXfers::Deferred { pending, .. } => pending
                .front()
                .map(|front| Arc::ptr_eq(front, view))
                .unwrap_or(false),
            AutoXfers::Blocking { .. } => false,
        }
    }

    fn remove_pending(state: &mut AutoState, view: &Arc<MemView>) {
        if let AutoXfers::Deferred {
            ref mut pending, ..
        } = state.xfers
        {
            if let Some(pos) = pending.iter().position(|v| Arc::ptr_eq(v, view)) {
                pending.remove(pos);
            }
        }
    }

    /// Promotes transfers that completed out of order, now that their
    /// predecessors have settled. Status lock held.
    fn update_completed_transfers(&self, state: &mut AutoState) {
        loop {
            let front = match &state.xfers {
                AutoXfers::Deferred { pending, .. } => match pending.front() {
                    Some(front) if front.status() == ViewStatus::Completed => front.clone(),
                    _ => break,
                },
                AutoXfers::Blocking { .. } => break,
            };
            Self::remove_pending(state, &front);
            self.add_mem_view(state, &front, true);
        }
    }

    /// Enqueues a resolved transfer in the ready-buffer list, or disposes of
    /// it. All logical transfers end up here, even cancelled ones. Status
    /// lock held.
    fn add_mem_view(&self, state: &mut AutoState, view: &Arc<MemView>, store_data: bool) {
        if store_data && !self.common.to_be_destroyed() && !state.io_error {
            let transfer_size = view.size();
            debug_assert!(transfer_size > 0);
            debug_assert!(view.end_position <= self.common.file_size());

            let from_low_level = view.status() != ViewStatus::Ready;
            self.common
                .bytes_transferred
                .fetch_add(transfer_size, Ordering::Relaxed);
            if from_low_level {
                self.common
                    .bytes_transferred_ll
                    .fetch_add(transfer_size, Ordering::Relaxed);
            }
            self.common
                .device
                .push_transfer_statistics(transfer_size, from_low_level);

            view.tag_as_ready();
            state.buffers.push_back(view.clone());
        } else {
            // The stream was scheduled for destruction, stopped, or its
            // position was set dirty while I/O was occurring. Flush the data.
            self.destroy_buffer(state, view);
        }
    }

    fn update_task_status(&self, state: &mut AutoState, result: Result<()>) {
        if let Err(e) = result {
            if e != Error::ErrCancelled {
                state.io_error = true;
                self.stop_locked(state);
            }
        }

        self.update_scheduling_status(state);

        if self.common.blocked.load(Ordering::Acquire) {
            self.completion.notify_all();
        }
    }

    /// Keeps the EOF flag and the scheduler semaphore in sync with the
    /// stream's buffering. Status lock held.
    fn update_scheduling_status(&self, state: &mut AutoState) {
        if state.loop_end == 0
            && self.get_virtual_file_position(state) >= self.common.file_size()
            && self.common.is_file_open()
        {
            self.set_reached_eof(state, true);
        } else {
            self.set_reached_eof(state, false);
        }

        let signal = (self.common.ready_for_io() && self.needs_buffering(state.virtual_buffering))
            || (self.common.to_be_destroyed() && self.can_be_destroyed_locked(state));
        self.common.signal_scheduling(signal);
    }

    /// Releases a view after dequeuing it from any list; corrects the
    /// virtual buffering accordingly.
    fn destroy_buffer(&self, state: &mut AutoState, view: &Arc<MemView>) {
        let effective = Self::effective_view_size(state, view);
        debug_assert!(state.virtual_buffering >= effective);
        let virtual_buffering = state.virtual_buffering - effective;
        self.set_virtual_buffering(state, virtual_buffering);
        self.common.device.destroy_mem_view(view);
    }

    /// Flushes all stream buffers not currently granted, and cancels pending
    /// transfers. Status lock held.
    fn flush(&self, state: &mut AutoState) {
        self.cancel_all_pending_transfers(state);

        while state.buffers.len() > state.next_to_grant as usize {
            let view = state.buffers.pop_back().expect("non-empty");
            self.destroy_buffer(state, &view);
        }

        self.update_scheduling_status(state);
    }

    // Cancellation.

    fn cancel_current_transfer(&self, state: &mut AutoState, view: &Arc<MemView>) {
        view.tag_as_cancelled();
        let effective = Self::effective_view_size(state, view);
        debug_assert!(state.virtual_buffering >= effective);
        let virtual_buffering = state.virtual_buffering - effective;
        self.set_virtual_buffering(state, virtual_buffering);
        view.clear_size();
        if let AutoXfers::Blocking {
            ref mut current,
            ref mut cancelled,
        } = state.xfers
        {
            *current = None;
            *cancelled = true;
        }
    }

    /// Tags a pending transfer cancelled and parks it on the cancelled list
    /// until the backend settles it.
    fn add_to_cancelled_list(&self, state: &mut AutoState, view: &Arc<MemView>) {
        view.tag_as_cancelled();
        let effective = Self::effective_view_size(state, view);
        debug_assert!(state.virtual_buffering >= effective);
        let virtual_buffering = state.virtual_buffering - effective;
        self.set_virtual_buffering(state, virtual_buffering);
        view.clear_size();
        if let AutoXfers::Deferred {
            ref mut cancelled, ..
        } = state.xfers
        {
            cancelled.push(view.clone());
        }
    }

    /// Disposes of a transfer that already returned from the backend but was
    /// still waiting in line.
    fn cancel_completed(&self, state: &mut AutoState, view: &Arc<MemView>) {
        self.destroy_buffer(state, view);
    }

    /// Runs the low-level cancel handshake over the cancelled list. Status
    /// lock held.
    fn notify_cancelled(&self, state: &mut AutoState, all_cancelled_init: bool) {
        let snapshot: Vec<Arc<MemView>> = match &state.xfers {
            AutoXfers::Deferred { cancelled, .. } => cancelled.clone(),
            AutoXfers::Blocking { .. } => return,
        };
        let desc = self.common.desc.lock().clone();
        let mut all_cancelled = all_cancelled_init;
        let mut call_llio = true;
        for view in &snapshot {
            self.common
                .device
                .cancel_view(&desc, view, call_llio, &mut all_cancelled);
            call_llio = !all_cancelled;
        }
    }

    /// Cancels every pending transfer. Status lock held.
    fn cancel_all_pending_transfers(&self, state: &mut AutoState) {
        match state.xfers {
            AutoXfers::Blocking { .. } => {
                if let Some(view) = Self::blocking_current(state) {
                    self.cancel_current_transfer(state, &view);
                }
            }
            AutoXfers::Deferred { .. } => {
                // The all-cancelled hint must stay false whenever cached
                // blocks may outlive this stream's interest in them.
                let all_cancelled = !self.common.device.use_cache();
                let to_cancel: Vec<Arc<MemView>> = match state.xfers {
                    AutoXfers::Deferred {
                        ref mut pending, ..
                    } => pending.drain(..).collect(),
                    AutoXfers::Blocking { .. } => Vec::new(),
                };
                self.cancel_transfers(state, to_cancel, all_cancelled);
            }
        }
    }

    /// Cancels every pending transfer inconsistent with the expected next
    /// position, honoring the loop heuristic. Status lock held.
    fn cancel_inconsistent_pending_transfers(
        &self,
        state: &mut AutoState,
        mut next_expected: u64,
    ) {
        match state.xfers {
            AutoXfers::Blocking { .. } => {
                if let Some(view) = Self::blocking_current(state) {
                    if view.start_position != next_expected {
                        self.cancel_current_transfer(state, &view);
                    }
                }
            }
            AutoXfers::Deferred { .. } => {
                let loop_start = state.loop_start;
                let loop_end = state.loop_end;
                let mut keep = VecDeque::new();
                let mut to_cancel = Vec::new();
                let drained: Vec<Arc<MemView>> = match state.xfers {
                    AutoXfers::Deferred {
                        ref mut pending, ..
                    } => pending.drain(..).collect(),
                    AutoXfers::Blocking { .. } => Vec::new(),
                };
                for view in drained {
                    debug_assert!(
                        view.status() != ViewStatus::Cancelled,
                        "a cancelled transfer is in the pending queue"
                    );
                    if view.start_position != next_expected {
                        to_cancel.push(view);
                    } else {
                        next_expected = view.end_position;
                        if loop_end > 0 && next_expected >= loop_end as u64 {
                            next_expected = loop_start as u64;
                        }
                        keep.push_back(view);
                    }
                }
                if let AutoXfers::Deferred {
                    ref mut pending, ..
                } = state.xfers
                {
                    *pending = keep;
                }

                let all_cancelled = !self.common.device.use_cache()
                    && match &state.xfers {
                        AutoXfers::Deferred { pending, .. } => pending.is_empty(),
                        AutoXfers::Blocking { .. } => false,
                    };
                self.cancel_transfers(state, to_cancel, all_cancelled);
            }
        }
    }

    /// Marks the given transfers cancelled and notifies the backend. Status
    /// lock held.
    fn cancel_transfers(
        &self,
        state: &mut AutoState,
        to_cancel: Vec<Arc<MemView>>,
        all_cancelled: bool,
    ) {
        if to_cancel.is_empty() {
            return;
        }
        let mut any_moved = false;
        for view in to_cancel {
            if view.status() == ViewStatus::Pending {
                self.add_to_cancelled_list(state, &view);
                any_moved = true;
            } else {
                self.cancel_completed(state, &view);
            }
        }
        if any_moved {
            self.notify_cancelled(state, all_cancelled);
        }
    }

    /// Flushes ready buffers smaller than `min_buffer_size` and everything
    /// after them, pending transfers included. Status lock held.
    fn flush_small_buffers_and_pending_transfers(
        &self,
        state: &mut AutoState,
        min_buffer_size: u32,
    ) {
        let mut flush = false;

        if state.buffers.len() > state.next_to_grant as usize {
            let granted = state.next_to_grant as usize;
            let mut keep = VecDeque::new();
            let mut remove = Vec::new();
            let mut index = 0;
            while let Some(view) = state.buffers.pop_front() {
                if index < granted {
                    keep.push_back(view);
                } else if flush || view.size() < min_buffer_size {
                    // From now on, flush everything.
                    flush = true;
                    remove.push(view);
                } else {
                    keep.push_back(view);
                }
                index += 1;
            }
            state.buffers = keep;
            for view in remove {
                self.destroy_buffer(state, &view);
            }
        }

        match state.xfers {
            AutoXfers::Blocking { .. } => {
                if let Some(view) = Self::blocking_current(state) {
                    if flush || view.size() < min_buffer_size {
                        self.cancel_current_transfer(state, &view);
                    }
                }
            }
            AutoXfers::Deferred { .. } => {
                let mut keep = VecDeque::new();
                let mut to_cancel = Vec::new();
                let drained: Vec<Arc<MemView>> = match state.xfers {
                    AutoXfers::Deferred {
                        ref mut pending, ..
                    } => pending.drain(..).collect(),
                    AutoXfers::Blocking { .. } => Vec::new(),
                };
                for view in drained {
                    debug_assert!(view.status() != ViewStatus::Cancelled);
                    if flush || view.size() < min_buffer_size {
                        flush = true;
                        to_cancel.push(view);
                    } else {
                        keep.push_back(view);
                    }
                }
                if let AutoXfers::Deferred {
                    ref mut pending, ..
                } = state.xfers
                {
                    *pending = keep;
                }
                let all_cancelled = flush && !self.common.device.use_cache();
                self.cancel_transfers(state, to_cancel, all_cancelled);
            }
        }
    }

    /// Recomputes the virtual buffering from scratch; the loop end changes
    /// every view's effective size.
    fn set_loop_end(&self, state: &mut AutoState, loop_end: u32) {
        state.loop_end = loop_end;
        let recomputed = self.compute_virtual_buffering(state);
        self.set_virtual_buffering(state, recomputed);
    }

    fn compute_virtual_buffering(&self, state: &AutoState) -> u32 {
        let mut total = 0u32;
        for view in state.buffers.iter().skip(state.next_to_grant as usize) {
            total += Self::effective_view_size(state, view);
        }
        match &state.xfers {
            AutoXfers::Blocking { current, .. } => {
                if let Some(view) = current {
                    total += Self::effective_view_size(state, view);
                }
            }
            AutoXfers::Deferred { pending, .. } => {
                for view in pending {
                    total += Self::effective_view_size(state, view);
                }
            }
        }
        total
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn check_virtual_buffering_consistency(&self) {
        let state = self.state.lock();
        debug_assert_eq!(
            self.compute_virtual_buffering(&state),
            state.virtual_buffering
        );
        if let AutoXfers::Deferred { ref cancelled, .. } = state.xfers {
            for view in cancelled {
                debug_assert_eq!(view.size(), 0);
            }
        }
    }

    // Scheduling interface.

    /// Scheduler heuristic: how long the buffered data lasts at the
    /// heuristic throughput, in ms. Zero means the stream is starving.
    pub(crate) fn effective_deadline_ms(&self) -> f32 {
        let throughput = self.throughput();
        debug_assert!(throughput >= MINIMAL_THROUGHPUT);
        self.virtual_buffering_size() as f32 / throughput
    }

    fn can_be_destroyed_locked(&self, state: &AutoState) -> bool {
        match &state.xfers {
            AutoXfers::Blocking {
                current,
                cancelled,
            } => current.is_none() && !cancelled,
            AutoXfers::Deferred { pending, cancelled } => {
                pending.is_empty() && cancelled.is_empty()
            }
        }
    }

    pub(crate) fn can_be_destroyed(&self) -> bool {
        let state = self.state.lock();
        self.can_be_destroyed_locked(&state)
    }

    pub(crate) fn kill(&self) {
        let mut state = self.state.lock();
        self.update_task_status(&mut state, Err(Error::ErrIoDevice));
    }

    /// Re-clamps the loop-end heuristic once a deferred open resolves the
    /// file size.
    pub(crate) fn on_file_deferred_open(&self) {
        let heuristics = self.heuristics();
        if heuristics.loop_end as u64 > self.common.file_size() {
            let clamped = AutoStmHeuristics {
                loop_end: self.common.file_size() as u32,
                ..heuristics
            };
            let _ = self.set_heuristics(&clamped);
        }
    }

    /// Flags the stream for destruction; the I/O thread reaps it on its next
    /// pass.
    pub fn destroy(&self) {
        debug!("destroying automatic stream {}", self.common.stream_id);
        let mut state = self.state.lock();
        self.common.set_to_be_destroyed();

        // The client may still hold granted buffers: reclaim them into the
        // virtual buffering, then flush everything.
        let mut reclaimed = state.virtual_buffering;
        for view in state.buffers.iter().take(state.next_to_grant as usize) {
            reclaimed += Self::effective_view_size(&state, view);
        }
        state.next_to_grant = 0;
        self.set_virtual_buffering(&mut state, reclaimed);

        self.flush(&mut state);
    }

    pub(crate) fn instant_destroy(&self) {
        self.common.signal_scheduling(false);
        self.common.close_file();
    }
}

impl Drop for AutoStream {
    fn drop(&mut self) {
        debug_assert!(!self.common.requires_scheduling());
    }
}
