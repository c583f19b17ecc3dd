use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerType;
use crate::error::{Error, Result};
use crate::file::{FileDescriptor, MoveMethod, OpenMode, Priority, MAX_PRIORITY, MIN_PRIORITY};
use crate::hook::{RawRegion, TransferInfo};
use crate::memory::block::{BlockData, BlockId, BlockState, ClientPtr};
use crate::memory::view::{DataRef, MemView, ViewStatus};
use crate::stream::{LaunchInfo, Prepared, StreamStatus, Task, TaskCommon};

/// The client buffer wrapped by the operation in progress.
pub(crate) enum ClientBuffer {
    None,
    Read(BytesMut),
    Write(Bytes),
}

impl ClientBuffer {
    fn ptr(&mut self) -> *mut u8 {
        match self {
            ClientBuffer::None => std::ptr::null_mut(),
            ClientBuffer::Read(b) => b.as_mut_ptr(),
            ClientBuffer::Write(b) => b.as_ptr() as *mut u8,
        }
    }
}

/// Transfers in flight, per device flavor.
enum StdXfers {
    Blocking {
        current: Option<Arc<MemView>>,
        /// The client is waiting for the in-flight transfer to settle after a
        /// cancel; the task must not be reaped while set.
        cancelling: bool,
    },
    Deferred {
        /// Oldest first. Holds pending and out-of-order completed slices.
        pending: VecDeque<Arc<MemView>>,
        cancelled: Vec<Arc<MemView>>,
    },
}

struct StdState {
    status: StreamStatus,
    op_complete: bool,
    buffer: ClientBuffer,
    /// Size of the client request; clamped to the end of file once the
    /// operation completes.
    request_size: u32,
    /// Stream position as seen by the client; advances when an operation
    /// completes or the client seeks.
    cur_position: u64,
    /// Append-only cursor of bytes handed to the scheduler for the current
    /// operation.
    total_scheduled: u32,
    deadline_ms: f32,
    /// Arena record standing for the client buffer (busy tracking, temp
    /// clones on the deferred device).
    client_block: BlockId,
    xfers: StdXfers,
}

/// Standard stream: one-shot bounded reads and writes into client memory.
///
/// The buffer is moved into the stream for the duration of the operation and
/// recovered with [`take_data`](StdStream::take_data) (reads); this is the
/// owned-buffer pattern asynchronous I/O requires.
pub struct StdStream {
    pub(crate) common: TaskCommon,
    pub(crate) weak_self: Weak<StdStream>,
    state: Mutex<StdState>,
    completion: Condvar,
}

impl std::fmt::Debug for StdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdStream").finish()
    }
}

impl StdStream {
    pub(crate) fn create(
        device: Arc<crate::device::Device>,
        desc: FileDescriptor,
        _open_mode: OpenMode,
    ) -> Result<Arc<StdStream>> {
        if desc.file_size < 0 {
            return Err(Error::ErrInvalidParameter);
        }

        let ll_block_size = device.hook().block_size(&desc);
        if ll_block_size == 0
            || ll_block_size > device.granularity()
            || device.granularity() % ll_block_size != 0
        {
            warn!(
                "low-level block size {} incompatible with granularity {}",
                ll_block_size,
                device.granularity()
            );
            return Err(Error::ErrIncompatibleSettings);
        }

        let scheduler_type = device.scheduler_type();
        let stream_id = device.new_stream_id();
        let client_block =
            device.with_inner(|inner| inner.mem.add_client_block(BlockData::Client(ClientPtr(
                std::ptr::null_mut(),
            ))));

        let stream = Arc::new_cyclic(|weak| StdStream {
            common: TaskCommon::new(device, desc, ll_block_size, false, stream_id),
            weak_self: weak.clone(),
            state: Mutex::new(StdState {
                status: StreamStatus::Idle,
                op_complete: true,
                buffer: ClientBuffer::None,
                request_size: 0,
                cur_position: 0,
                total_scheduled: 0,
                deadline_ms: 0.0,
                client_block,
                xfers: match scheduler_type {
                    SchedulerType::Blocking => StdXfers::Blocking {
                        current: None,
                        cancelling: false,
                    },
                    SchedulerType::DeferredLinedUp => StdXfers::Deferred {
                        pending: VecDeque::new(),
                        cancelled: Vec::new(),
                    },
                },
            }),
            completion: Condvar::new(),
        });
        Ok(stream)
    }

    fn task(&self) -> Task {
        Task::Std(self.weak_self.upgrade().expect("stream destroyed"))
    }

    /// Returns the low-level block size for optimal unbuffered I/O. Read
    /// requests must be a multiple of it.
    pub fn block_size(&self) -> u32 {
        self.common.ll_block_size
    }

    pub fn set_stream_name(&self, name: &str) {
        *self.common.stream_name.lock() = Some(name.to_string());
    }

    pub fn file_size(&self) -> u64 {
        self.common.file_size()
    }

    /// Current operation status.
    pub fn status(&self) -> StreamStatus {
        let state = self.state.lock();
        // On the deferred device "idle" only means all slices have been
        // scheduled; report pending while any is still in flight.
        if let StdXfers::Deferred { ref pending, .. } = state.xfers {
            if !pending.is_empty() {
                return StreamStatus::Pending;
            }
        }
        state.status
    }

    /// Stream position as seen by the client. Inaccurate while an operation
    /// is pending.
    pub fn position(&self) -> (u64, bool) {
        let state = self.state.lock();
        debug_assert!(
            state.status != StreamStatus::Pending,
            "inaccurate stream position while an operation is pending"
        );
        (
            state.cur_position,
            self.common.has_reached_eof.load(Ordering::Acquire),
        )
    }

    /// Moves the position of the next operation, floored to the low-level
    /// block size. Returns the effective offset relative to the requested
    /// origin.
    pub fn set_position(&self, move_offset: i64, move_method: MoveMethod) -> Result<i64> {
        let mut state = self.state.lock();
        if state.status == StreamStatus::Pending {
            return Err(Error::ErrOperationPending);
        }

        let base = match move_method {
            MoveMethod::Begin => 0,
            MoveMethod::Current => state.cur_position as i64,
            MoveMethod::End => self.common.file_size.load(Ordering::Acquire),
        };
        let mut position = base + move_offset;
        if position < 0 {
            return Err(Error::ErrPositionOutOfRange);
        }

        position -= position % self.common.ll_block_size as i64;

        let real_offset = match move_method {
            MoveMethod::Begin => position,
            MoveMethod::Current => position - state.cur_position as i64,
            MoveMethod::End => position - self.common.file_size.load(Ordering::Acquire),
        };

        state.cur_position = position as u64;
        Ok(real_offset)
    }

    /// Schedules a read of `buffer.len()` bytes into `buffer`. The size must
    /// be a multiple of the low-level block size; it is clamped to the end of
    /// file. Returns the accepted size.
    pub fn read(
        &self,
        buffer: BytesMut,
        wait: bool,
        priority: Priority,
        deadline_sec: f32,
    ) -> Result<u32> {
        let len = buffer.len() as u32;
        self.execute_op(false, ClientBuffer::Read(buffer), len, wait, priority, deadline_sec)
    }

    /// Schedules a write of `buffer.len()` bytes from `buffer`. Returns the
    /// accepted size.
    pub fn write(
        &self,
        buffer: Bytes,
        wait: bool,
        priority: Priority,
        deadline_sec: f32,
    ) -> Result<u32> {
        let len = buffer.len() as u32;
        self.execute_op(true, ClientBuffer::Write(buffer), len, wait, priority, deadline_sec)
    }

    /// Recovers the buffer of a completed read, truncated to the bytes
    /// actually transferred.
    pub fn take_data(&self) -> Option<BytesMut> {
        let mut state = self.state.lock();
        if state.status != StreamStatus::Completed {
            return None;
        }
        match std::mem::replace(&mut state.buffer, ClientBuffer::None) {
            ClientBuffer::Read(mut b) => {
                b.truncate(state.request_size as usize);
                Some(b)
            }
            other => {
                state.buffer = other;
                None
            }
        }
    }

    fn execute_op(
        &self,
        write: bool,
        buffer: ClientBuffer,
        req_size: u32,
        wait: bool,
        priority: Priority,
        deadline_sec: f32,
    ) -> Result<u32> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) || deadline_sec < 0.0 {
            return Err(Error::ErrInvalidParameter);
        }

        let mut state = self.state.lock();
        match state.status {
            StreamStatus::Pending => return Err(Error::ErrOperationPending),
            StreamStatus::Error => return Err(Error::ErrStreamInError),
            _ => {}
        }

        let mut req_size = req_size;
        if !write {
            if req_size % self.common.ll_block_size != 0 {
                return Err(Error::ErrRequestSizeNotBlockAligned);
            }
            if self.common.is_file_open() {
                let (clamped, _) =
                    self.common
                        .clamp_request_size_to_eof(state.cur_position, req_size, 0);
                req_size = clamped;
            }
        }

        state.total_scheduled = 0;
        state.op_complete = false;
        state.buffer = buffer;
        state.request_size = req_size;
        state.deadline_ms = deadline_sec * 1000.0;
        self.common.is_write_op.store(write, Ordering::Release);
        self.common.priority.store(priority, Ordering::Release);

        if req_size == 0 {
            self.set_status(&mut state, StreamStatus::Completed);
            return Ok(0);
        }

        self.common.stamp_io_start();

        if wait {
            self.common.blocked.store(true, Ordering::Release);
            self.set_status(&mut state, StreamStatus::Pending);
            while state.status == StreamStatus::Pending || state.status == StreamStatus::Idle {
                self.completion.wait(&mut state);
            }
            self.common.blocked.store(false, Ordering::Release);
            if state.status == StreamStatus::Completed {
                Ok(req_size)
            } else {
                Err(Error::ErrIoDevice)
            }
        } else {
            self.set_status(&mut state, StreamStatus::Pending);
            Ok(req_size)
        }
    }

    /// Cancels the operation in progress. Blocks until every in-flight
    /// transfer settles; the stream ends up `Cancelled`.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        self.set_status(&mut state, StreamStatus::Cancelled);

        match state.xfers {
            StdXfers::Blocking { ref current, .. } => {
                if current.is_some() {
                    if let StdXfers::Blocking {
                        ref mut cancelling, ..
                    } = state.xfers
                    {
                        *cancelling = true;
                    }
                    self.common.blocked.store(true, Ordering::Release);
                    while matches!(state.xfers, StdXfers::Blocking { ref current, .. } if current.is_some())
                    {
                        self.completion.wait(&mut state);
                    }
                    self.common.blocked.store(false, Ordering::Release);
                    if let StdXfers::Blocking {
                        ref mut cancelling, ..
                    } = state.xfers
                    {
                        *cancelling = false;
                    }
                }
            }
            StdXfers::Deferred { .. } => {
                if self.has_inflight(&state) {
                    self.common.blocked.store(true, Ordering::Release);
                    self.cancel_all_pending_transfers(&mut state);
                    while self.has_inflight(&state) {
                        self.completion.wait(&mut state);
                    }
                    self.common.blocked.store(false, Ordering::Release);
                }
            }
        }
    }

    /// Flags the stream for destruction; the I/O thread reaps it on its next
    /// pass. Blocks while transfers are in flight.
    pub fn destroy(&self) {
        debug!("destroying standard stream {}", self.common.stream_id);
        let mut state = self.state.lock();
        self.common.set_to_be_destroyed();
        self.set_status(&mut state, StreamStatus::Cancelled);

        match state.xfers {
            StdXfers::Blocking { ref current, .. } => {
                if current.is_some() {
                    if let StdXfers::Blocking {
                        ref mut cancelling, ..
                    } = state.xfers
                    {
                        *cancelling = true;
                    }
                    self.common.blocked.store(true, Ordering::Release);
                    while matches!(state.xfers, StdXfers::Blocking { ref current, .. } if current.is_some())
                    {
                        self.completion.wait(&mut state);
                    }
                    self.common.blocked.store(false, Ordering::Release);
                    if let StdXfers::Blocking {
                        ref mut cancelling, ..
                    } = state.xfers
                    {
                        *cancelling = false;
                    }
                    // The task could not be reaped while we were waiting;
                    // re-signal for cleanup.
                    self.set_status(&mut state, StreamStatus::Cancelled);
                }
            }
            StdXfers::Deferred { .. } => {
                if self.has_inflight(&state) {
                    self.common.blocked.store(true, Ordering::Release);
                    self.cancel_all_pending_transfers(&mut state);
                    while self.has_inflight(&state) {
                        self.completion.wait(&mut state);
                    }
                    self.common.blocked.store(false, Ordering::Release);
                    self.set_status(&mut state, StreamStatus::Cancelled);
                }
            }
        }
    }

    fn has_inflight(&self, state: &StdState) -> bool {
        match &state.xfers {
            StdXfers::Blocking { current, .. } => current.is_some(),
            StdXfers::Deferred { pending, cancelled } => {
                !pending.is_empty() || !cancelled.is_empty()
            }
        }
    }

    fn can_be_destroyed_locked(&self, state: &StdState) -> bool {
        match &state.xfers {
            StdXfers::Blocking {
                current,
                cancelling,
            } => current.is_none() && !cancelling,
            StdXfers::Deferred { pending, cancelled } => {
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

    /// Marks every pending slice cancelled and runs the low-level cancel
    /// handshake. Status lock held by the caller.
    fn cancel_all_pending_transfers(&self, state: &mut StdState) {
        let device = self.common.device.clone();
        let desc = self.common.desc.lock().clone();
        let base = state.client_block;
        let mut completed = Vec::new();
        let to_cancel: Vec<Arc<MemView>> = match state.xfers {
            StdXfers::Deferred {
                ref mut pending,
                ref mut cancelled,
            } => {
                let mut moved = Vec::new();
                while let Some(view) = pending.pop_front() {
                    if view.status() == ViewStatus::Pending {
                        view.tag_as_cancelled();
                        view.clear_size();
                        cancelled.push(view.clone());
                        moved.push(view);
                    } else {
                        // Already completed out of order: settle it now.
                        completed.push(view);
                    }
                }
                moved
            }
            StdXfers::Blocking { .. } => Vec::new(),
        };
        for view in &completed {
            self.destroy_view(base, view);
        }

        // No caching with standard streams: every transfer of this stream is
        // to be cancelled, so the all-cancelled hint starts true.
        let mut all_cancelled = true;
        let mut call_llio = true;
        for view in &to_cancel {
            device.cancel_view(&desc, view, call_llio, &mut all_cancelled);
            call_llio = !all_cancelled;
        }
    }

    fn destroy_view(&self, base: BlockId, view: &Arc<MemView>) {
        let block = view.block;
        self.common.device.with_inner(|inner| {
            inner.mem.destroy_temp_block(base, block);
        });
    }

    /// Scheduler heuristic: remaining deadline spread over the transfers
    /// still needed, in ms.
    pub(crate) fn effective_deadline_ms(&self) -> f32 {
        let state = self.state.lock();
        let granularity = self.common.device.granularity();
        let remaining = state.request_size.saturating_sub(state.total_scheduled);
        let num_transfers_remaining = ((remaining + granularity - 1) / granularity).max(1);
        let elapsed = self
            .common
            .time_since_last_transfer_ms(self.common.device.time_ms());
        let deadline = (state.deadline_ms - elapsed) / num_transfers_remaining as f32;
        deadline.max(0.0)
    }

    /// Slices the next piece of the client request and stages it for
    /// transfer.
    pub(crate) fn prepare_transfer(&self, cache_only: bool) -> Prepared {
        debug_assert!(!cache_only, "standard streams cannot use cached data");

        let device = self.common.device.clone();
        let deferred = device.is_deferred();
        let mut state = self.state.lock();

        if deferred {
            // From here on, update() must run to balance the count, whether
            // the transfer happens or not.
            device.increment_io_count();
        }

        if self.common.to_be_destroyed() || !self.common.ready_for_io() {
            return Prepared::Aborted;
        }

        let position = state.cur_position + state.total_scheduled as u64;

        debug_assert!(state.total_scheduled <= state.request_size);
        let mut max_transfer_size = state.request_size - state.total_scheduled;
        if max_transfer_size > device.granularity() {
            max_transfer_size = device.granularity();
        }

        let write = self.common.is_write_op.load(Ordering::Acquire);
        let (requested_size, will_reach_eof) = if !write {
            self.common
                .clamp_request_size_to_eof(position, max_transfer_size, 0)
        } else {
            (max_transfer_size, false)
        };
        if requested_size == 0 {
            return Prepared::Aborted;
        }

        let data_ptr = unsafe { state.buffer.ptr().add(state.total_scheduled as usize) };
        let request_end = state.cur_position + state.request_size as u64;
        let base = state.client_block;
        let offset = state.total_scheduled;

        let (view, transfer) = device.with_inner(|inner| {
            let block_for_transfer = if inner.mem.block(base).is_busy() {
                // Pipelining consecutive slices of the same client buffer:
                // run the new transfer against a temporary alias.
                inner.mem.clone_temp_block(base)
            } else {
                base
            };

            let view = MemView::new(
                block_for_transfer,
                offset,
                DataRef::Client(ClientPtr(data_ptr)),
                position,
                request_end,
                0,
                if deferred { Some(self.task()) } else { None },
            );

            let transfer = if deferred {
                let id = inner.new_transfer(
                    TransferInfo {
                        file_position: position + self.common.desc.lock().sector_offset,
                        buffer_size: max_transfer_size,
                        requested_size,
                    },
                    block_for_transfer,
                    self.task(),
                    view.clone(),
                    RawRegion {
                        ptr: data_ptr,
                        len: max_transfer_size as usize,
                    },
                    write,
                );
                inner.mem.block_mut(block_for_transfer).state = BlockState::Busy {
                    transfer: Some(id),
                };
                Some(id)
            } else {
                inner.mem.block_mut(block_for_transfer).state =
                    BlockState::Busy { transfer: None };
                None
            };

            (view, transfer)
        });

        state.total_scheduled += requested_size;

        match state.xfers {
            StdXfers::Blocking {
                ref mut current, ..
            } => *current = Some(view.clone()),
            StdXfers::Deferred {
                ref mut pending, ..
            } => {
                pending.push_back(view.clone());
                // Stop asking for I/O once the whole request is scheduled.
                if will_reach_eof || state.total_scheduled == state.request_size {
                    self.set_status(&mut state, StreamStatus::Idle);
                }
            }
        }

        self.common.stamp_io_start();

        Prepared::Launch(LaunchInfo {
            view,
            transfer,
            info: TransferInfo {
                file_position: position + self.common.desc.lock().sector_offset,
                buffer_size: max_transfer_size,
                requested_size,
            },
            region: RawRegion {
                ptr: data_ptr,
                len: max_transfer_size as usize,
            },
            write,
        })
    }

    /// Settles one logical transfer.
    pub(crate) fn update(
        &self,
        view: Option<Arc<MemView>>,
        result: Result<()>,
        required_low_level: bool,
    ) -> bool {
        let device = self.common.device.clone();
        let mut state = self.state.lock();
        let mut buffer_added = false;

        if let Some(view) = view {
            match state.xfers {
                StdXfers::Blocking { .. } => {
                    let store = result.is_ok() && view.do_store_data();
                    debug_assert!(required_low_level);
                    self.add_mem_view(&mut state, &view, store);
                    if let StdXfers::Blocking {
                        ref mut current, ..
                    } = state.xfers
                    {
                        *current = None;
                    }
                    buffer_added = true;
                }
                StdXfers::Deferred { .. } => {
                    if view.status() == ViewStatus::Cancelled {
                        if let StdXfers::Deferred {
                            ref mut cancelled, ..
                        } = state.xfers
                        {
                            if let Some(pos) =
                                cancelled.iter().position(|v| Arc::ptr_eq(v, &view))
                            {
                                cancelled.remove(pos);
                            }
                        }
                        self.add_mem_view(&mut state, &view, false);
                    } else if result.is_err() {
                        Self::remove_pending(&mut state, &view);
                        self.add_mem_view(&mut state, &view, false);
                    } else if Self::is_oldest_pending(&state, &view) {
                        Self::remove_pending(&mut state, &view);
                        self.add_mem_view(&mut state, &view, true);
                        buffer_added = true;
                        self.update_completed_transfers(&mut state);
                    } else {
                        // Completed out of order; resolved when its
                        // predecessors complete.
                        view.tag_as_completed();
                    }
                }
            }
        }

        if device.is_deferred() {
            device.decrement_io_count();
        }

        self.update_task_status(&mut state, result);
        buffer_added
    }

    fn is_oldest_pending(state: &StdState, view: &Arc<MemView>) -> bool {
        match &state.xfers {
            StdXfers::Deferred { pending, .. } => pending
                .front()
                .map(|front| Arc::ptr_eq(front, view))
                .unwrap_or(false),
            StdXfers::Blocking { .. } => false,
        }
    }

    fn remove_pending(state: &mut StdState, view: &Arc<MemView>) {
        if let StdXfers::Deferred {
            ref mut pending, ..
        } = state.xfers
        {
            if let Some(pos) = pending.iter().position(|v| Arc::ptr_eq(v, view)) {
                pending.remove(pos);
            }
        }
    }

    /// Resolves transfers that completed out of order, now that their
    /// predecessors have settled.
    fn update_completed_transfers(&self, state: &mut StdState) {
        loop {
            let front = match &state.xfers {
                StdXfers::Deferred { pending, .. } => match pending.front() {
                    Some(front) if front.status() == ViewStatus::Completed => front.clone(),
                    _ => break,
                },
                StdXfers::Blocking { .. } => break,
            };
            Self::remove_pending(state, &front);
            self.add_mem_view(state, &front, true);
        }
    }

    /// Resolves one slice of the client request. All logical transfers end up
    /// here, even cancelled ones. Status lock held by the caller.
    fn add_mem_view(&self, state: &mut StdState, view: &Arc<MemView>, store_data: bool) {
        let mut transfer_size = 0u32;

        if store_data && !self.common.to_be_destroyed() && state.status != StreamStatus::Error {
            self.common.has_reached_eof.store(false, Ordering::Release);

            // Deduce the transfer size: only the last slice of the request
            // sees less than a full granularity ahead of it.
            state.op_complete = true;
            transfer_size = view.size();
            let granularity = self.common.device.granularity();
            if transfer_size > granularity {
                transfer_size = granularity;
                state.op_complete = false;
            }

            // The view maps user-provided memory, so its end may overshoot
            // the end of file.
            let write = self.common.is_write_op.load(Ordering::Acquire);
            let file_size = self.common.file_size();
            if !write && transfer_size as u64 >= file_size - view.start_position {
                transfer_size = (file_size - view.start_position) as u32;
                self.common.has_reached_eof.store(true, Ordering::Release);
                state.op_complete = true;
                debug_assert!(view.end_position >= file_size);
                let overshoot = (view.end_position - file_size) as u32;
                state.request_size -= overshoot;
            }

            debug_assert!(transfer_size <= state.request_size);
            self.common
                .bytes_transferred
                .fetch_add(transfer_size, Ordering::Relaxed);
            self.common
                .bytes_transferred_ll
                .fetch_add(transfer_size, Ordering::Relaxed);
        }
        // else: the stream was scheduled for destruction, stopped, or its
        // position was set dirty while I/O was occurring.

        self.common
            .device
            .push_transfer_statistics(transfer_size, true);
        self.destroy_view(state.client_block, view);
    }

    /// Status transition after a settled transfer. Status lock held.
    fn update_task_status(&self, state: &mut StdState, result: Result<()>) {
        match result {
            Err(Error::ErrCancelled) => {}
            Err(_) => {
                self.set_status(state, StreamStatus::Error);
            }
            Ok(()) => {
                if state.op_complete {
                    // The request size was clamped to the end of file when
                    // the operation completed.
                    state.cur_position += state.request_size as u64;
                    self.set_status(state, StreamStatus::Completed);
                }
                // else: still pending, do not change the status.
            }
        }

        if self.common.blocked.load(Ordering::Acquire)
            && state.status != StreamStatus::Pending
            && state.status != StreamStatus::Idle
        {
            self.completion.notify_all();
        } else if self.common.blocked.load(Ordering::Acquire) && !self.has_inflight(state) {
            // Cancel and destroy wait on the in-flight count, not the status.
            self.completion.notify_all();
        }
    }

    /// Sets the stream status and keeps the scheduler semaphore in sync.
    /// Status lock held.
    fn set_status(&self, state: &mut StdState, status: StreamStatus) {
        state.status = status;

        if self.common.to_be_destroyed() && self.can_be_destroyed_locked(state) {
            // Signal the I/O thread for clean up.
            self.common.signal_scheduling(true);
        } else if status == StreamStatus::Pending {
            debug_assert!(!self.common.to_be_destroyed());
            self.common.set_ready_for_io(true);
            self.common.signal_scheduling(true);
        } else {
            self.common.set_ready_for_io(false);
            self.common.signal_scheduling(false);
        }
    }

    pub(crate) fn instant_destroy(&self) {
        self.common.signal_scheduling(false);
        self.common.close_file();
        let block = self.state.lock().client_block;
        self.common.device.with_inner(|inner| {
            inner.mem.remove_client_block(block);
        });
    }
}

impl Drop for StdStream {
    fn drop(&mut self) {
        debug_assert!(!self.common.requires_scheduling());
    }
}
