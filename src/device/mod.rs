mod scheduler;
#[cfg(test)]
mod device_test;

use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::{AutoStmHeuristics, DeviceSettings, SchedulerType};
use crate::error::{Error, Result};
use crate::file::{DeviceId, FileDescriptor, FileId, FileLocationResolver, OpenMode, Priority};
use crate::hook::{
    AsyncTransfer, DeviceData, IoHeuristics, IoHook, RawRegion, TransferCompleter, TransferId,
    TransferInfo,
};
use crate::memory::block::BlockState;
use crate::memory::mem_mgr::IoMemMgr;
use crate::memory::storage::PoolStorage;
use crate::memory::view::MemView;
use crate::stream::{AutoStream, Prepared, StdStream, Task};
use crate::transfer::LowLevelTransfer;

/// Everything guarded by the device lock: the I/O memory manager, the
/// scheduler gate counters and the deferred transfer pool.
pub(crate) struct DeviceInner {
    pub mem: IoMemMgr,

    transfers: FxHashMap<usize, LowLevelTransfer>,
    next_transfer_id: usize,

    /// Scheduler gate: number of automatic / standard tasks asking to be
    /// scheduled.
    sem_auto: u32,
    sem_std: u32,
    /// Memory is exhausted; the auto counter is ignored until somebody frees
    /// a block.
    wait_mem_change: bool,
    /// Logical transfers between `prepare_transfer` and `update`.
    io_count: u32,

    // Monitoring.
    bytes_this_interval: u32,
    bytes_ll_this_interval: u32,
    num_ll_requests: u32,
    num_ll_requests_cancelled: u32,
    bytes_this_session: u64,
    cache_bytes_this_session: u64,
}

impl DeviceInner {
    /// Pulls a transfer record for a new low-level request. The scheduler
    /// gate keeps the number of live records within `max_concurrent_io`.
    pub fn new_transfer(
        &mut self,
        info: TransferInfo,
        block: crate::memory::block::BlockId,
        owner: Task,
        first_observer: Arc<MemView>,
        region: RawRegion,
        write: bool,
    ) -> TransferId {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        self.transfers.insert(
            id,
            LowLevelTransfer {
                info,
                block,
                owner,
                observers: vec![first_observer],
                was_sent_to_llio: false,
                was_llio_cancel_called: false,
                write,
                region,
            },
        );
        TransferId(id)
    }

    pub fn add_observer(&mut self, id: TransferId, view: Arc<MemView>) {
        self.transfers
            .get_mut(&id.0)
            .expect("observing a transfer that is gone")
            .observers
            .push(view);
    }

    #[cfg(test)]
    pub fn live_transfers(&self) -> usize {
        self.transfers.len()
    }
}

pub(crate) struct TaskLists {
    pub tasks: Vec<Task>,
    pub caching: Vec<Task>,
}

/// A streaming device: one low-level hook, one I/O memory pool, one worker
/// thread scheduling transfers across the streams it owns.
pub(crate) struct Device {
    id: DeviceId,
    weak_self: Weak<Device>,

    granularity: u32,
    target_buffer_length_ms: f32,
    max_concurrent_io: u32,
    max_cache_pinned_bytes: u32,
    scheduler_type: SchedulerType,
    use_cache: bool,
    has_pool: bool,

    hook: IoHook,
    resolver: Mutex<Option<Arc<dyn FileLocationResolver>>>,
    storage: Option<Arc<PoolStorage>>,

    pub(crate) inner: Mutex<DeviceInner>,
    /// The I/O thread waits here until a task needs scheduling.
    gate: Condvar,
    pub(crate) tasks: Mutex<TaskLists>,

    start: Instant,
    /// Time stamped at every scheduler pass, in ms.
    time_ms: AtomicU64,

    term: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_stream_id: AtomicU32,
    /// Bytes currently held by caching streams, recounted per caching pass.
    pub(crate) current_cache_pinned: AtomicU32,
}

impl Device {
    pub fn create(
        settings: &DeviceSettings,
        hook: IoHook,
        resolver: Option<Arc<dyn FileLocationResolver>>,
        id: DeviceId,
    ) -> Result<Arc<Device>> {
        Self::create_inner(settings, hook, resolver, id, true)
    }

    /// Device without its worker thread; tests drive `perform_io` manually.
    #[cfg(test)]
    pub fn create_manual(
        settings: &DeviceSettings,
        hook: IoHook,
        resolver: Option<Arc<dyn FileLocationResolver>>,
        id: DeviceId,
    ) -> Result<Arc<Device>> {
        Self::create_inner(settings, hook, resolver, id, false)
    }

    fn create_inner(
        settings: &DeviceSettings,
        hook: IoHook,
        resolver: Option<Arc<dyn FileLocationResolver>>,
        id: DeviceId,
        spawn_thread: bool,
    ) -> Result<Arc<Device>> {
        settings.validate()?;
        match (&hook, settings.scheduler_type) {
            (IoHook::Blocking(_), SchedulerType::Blocking) => {}
            (IoHook::Deferred(_), SchedulerType::DeferredLinedUp) => {}
            _ => return Err(Error::ErrInvalidParameter),
        }

        let mem = IoMemMgr::init(settings)?;
        let storage = mem.storage().cloned();
        let has_pool = mem.has_pool();
        let use_cache = mem.use_cache();

        let device = Arc::new_cyclic(|weak| Device {
            id,
            weak_self: weak.clone(),
            granularity: settings.granularity,
            target_buffer_length_ms: settings.target_auto_stream_buffer_length_ms,
            max_concurrent_io: settings.max_concurrent_io,
            max_cache_pinned_bytes: settings.max_cache_pinned_bytes,
            scheduler_type: settings.scheduler_type,
            use_cache,
            has_pool,
            hook,
            resolver: Mutex::new(resolver),
            storage,
            inner: Mutex::new(DeviceInner {
                mem,
                transfers: FxHashMap::default(),
                next_transfer_id: 0,
                sem_auto: 0,
                sem_std: 0,
                wait_mem_change: false,
                io_count: 0,
                bytes_this_interval: 0,
                bytes_ll_this_interval: 0,
                num_ll_requests: 0,
                num_ll_requests_cancelled: 0,
                bytes_this_session: 0,
                cache_bytes_this_session: 0,
            }),
            gate: Condvar::new(),
            tasks: Mutex::new(TaskLists {
                tasks: Vec::new(),
                caching: Vec::new(),
            }),
            start: Instant::now(),
            time_ms: AtomicU64::new(0),
            term: AtomicBool::new(false),
            thread: Mutex::new(None),
            next_stream_id: AtomicU32::new(1),
            current_cache_pinned: AtomicU32::new(0),
        });

        if spawn_thread {
            let worker = device.clone();
            let mut builder = std::thread::Builder::new().name(
                settings
                    .thread_properties
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("stm-io-{}", id)),
            );
            if let Some(stack_size) = settings.thread_properties.stack_size {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || worker.io_thread_loop())
                .map_err(|_| Error::ErrInsufficientMemory)?;
            *device.thread.lock() = Some(handle);
        }

        debug!("device {} created ({:?})", id, settings.scheduler_type);
        Ok(device)
    }

    // Accessors used by streams.

    pub fn device_id(&self) -> DeviceId {
        self.id
    }

    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    pub fn target_buffer_length_ms(&self) -> f32 {
        self.target_buffer_length_ms
    }

    pub fn scheduler_type(&self) -> SchedulerType {
        self.scheduler_type
    }

    pub fn is_deferred(&self) -> bool {
        self.scheduler_type == SchedulerType::DeferredLinedUp
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    pub fn has_pool(&self) -> bool {
        self.has_pool
    }

    pub fn hook(&self) -> &IoHook {
        &self.hook
    }

    pub fn storage(&self) -> Option<Arc<PoolStorage>> {
        self.storage.clone()
    }

    pub fn resolver(&self) -> Option<Arc<dyn FileLocationResolver>> {
        self.resolver.lock().clone()
    }

    pub fn new_stream_id(&self) -> u32 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms.load(Ordering::Relaxed)
    }

    fn stamp_time(&self) {
        self.time_ms
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn max_cache_pinned_bytes(&self) -> u32 {
        self.max_cache_pinned_bytes
    }

    pub fn remaining_cache_pinned_bytes(&self) -> u32 {
        self.max_cache_pinned_bytes
            .saturating_sub(self.current_cache_pinned.load(Ordering::Relaxed))
    }

    // Device lock plumbing. Scheduler notifications raised by the memory
    // manager are applied before the lock drops.

    pub fn with_inner<R>(&self, f: impl FnOnce(&mut DeviceInner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner);
        self.apply_mem_signals(&mut inner);
        result
    }

    fn apply_mem_signals(&self, inner: &mut DeviceInner) {
        let (changed, idle) = inner.mem.take_signals();
        if changed {
            inner.wait_mem_change = false;
            self.gate.notify_one();
        }
        if idle {
            // Freed or not, the last acquisition still failed: hold automatic
            // streams until memory actually changes.
            inner.wait_mem_change = true;
        }
    }

    /// Some memory may have been freed; reevaluate automatic streams.
    pub fn notify_mem_change(&self) {
        let mut inner = self.inner.lock();
        inner.wait_mem_change = false;
        self.gate.notify_one();
    }

    /// True while the device waits out a memory-full condition.
    pub fn cannot_schedule_auto_streams(&self) -> bool {
        self.inner.lock().wait_mem_change
    }

    pub fn sem_incr(&self, auto: bool) {
        let mut inner = self.inner.lock();
        if auto {
            inner.sem_auto += 1;
        } else {
            inner.sem_std += 1;
        }
        self.gate.notify_one();
    }

    pub fn sem_decr(&self, auto: bool) {
        let mut inner = self.inner.lock();
        if auto {
            debug_assert!(inner.sem_auto > 0);
            inner.sem_auto = inner.sem_auto.saturating_sub(1);
        } else {
            debug_assert!(inner.sem_std > 0);
            inner.sem_std = inner.sem_std.saturating_sub(1);
        }
    }

    pub fn increment_io_count(&self) {
        self.inner.lock().io_count += 1;
    }

    pub fn decrement_io_count(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.io_count > 0);
        inner.io_count = inner.io_count.saturating_sub(1);
        self.gate.notify_one();
    }

    /// Releases a view's block reference (automatic streams).
    pub fn destroy_mem_view(&self, view: &Arc<MemView>) {
        self.with_inner(|inner| {
            inner.mem.release_block(view.block);
        });
    }

    pub fn push_transfer_statistics(&self, size_transferred: u32, from_low_level: bool) {
        let mut inner = self.inner.lock();
        inner.bytes_this_interval += size_transferred;
        inner.bytes_this_session += size_transferred as u64;
        if from_low_level {
            inner.bytes_ll_this_interval += size_transferred;
        } else {
            inner.cache_bytes_this_session += size_transferred as u64;
        }
    }

    // Stream creation, on behalf of the manager.

    pub fn create_std(
        self: &Arc<Self>,
        desc: FileDescriptor,
        open_mode: OpenMode,
    ) -> Result<Arc<StdStream>> {
        let stream = StdStream::create(self.clone(), desc, open_mode)?;
        self.tasks.lock().tasks.push(Task::Std(stream.clone()));
        Ok(stream)
    }

    pub fn create_auto(
        self: &Arc<Self>,
        desc: FileDescriptor,
        file_id: Option<FileId>,
        heuristics: &AutoStmHeuristics,
        buffer_settings: Option<&crate::config::AutoStmBufSettings>,
    ) -> Result<Arc<AutoStream>> {
        let stream = AutoStream::create(self.clone(), desc, file_id, heuristics, buffer_settings)?;
        self.tasks.lock().tasks.push(Task::Auto(stream.clone()));
        Ok(stream)
    }

    pub fn create_caching_stream(
        self: &Arc<Self>,
        desc: FileDescriptor,
        file_id: Option<FileId>,
        num_bytes_prefetch: u32,
        priority: Priority,
    ) -> Result<Arc<AutoStream>> {
        let heuristics = AutoStmHeuristics {
            throughput: 0.0,
            loop_start: 0,
            loop_end: 0,
            min_num_buffers: 0,
            priority,
        };
        let stream = AutoStream::create(self.clone(), desc, file_id, &heuristics, None)?;
        stream.common.is_caching.store(true, Ordering::Release);
        stream.set_caching_buffer_size(num_bytes_prefetch);
        self.tasks.lock().caching.push(Task::Auto(stream.clone()));
        Ok(stream)
    }

    /// Takes care of restarting caching streams that may have been stopped at
    /// the memory limit, now that priorities moved.
    pub fn update_caching_priority(&self, stream: &Arc<AutoStream>, new_priority: Priority) {
        if stream.common.priority() == new_priority {
            return;
        }
        let _ = stream.set_priority(new_priority);

        let lists = self.tasks.lock();
        for task in &lists.caching {
            task.start_caching();
        }
    }

    pub fn flush_cache(&self) {
        self.with_inner(|inner| inner.mem.flush_cache());
    }

    /// Monitoring counters. Interval counters reset at each query.
    pub fn device_data(&self) -> DeviceData {
        let num_active_streams = {
            let lists = self.tasks.lock();
            (lists.tasks.len() + lists.caching.len()) as u32
        };
        let mut inner = self.inner.lock();
        let mut data = DeviceData {
            device_id: self.id,
            granularity: self.granularity,
            mem_size: inner.mem.pool_size(),
            mem_used: inner.mem.total_alloced(),
            allocs: inner.mem.alloc_count(),
            frees: inner.mem.free_count(),
            peak_refd_mem_used: inner.mem.peak_used(),
            unreferenced_cached_bytes: inner.mem.unreferenced_cached_bytes(),
            num_active_streams,
            total_bytes_transferred: inner.bytes_this_interval,
            low_level_bytes_transferred: inner.bytes_ll_this_interval,
            avg_cache_efficiency: 0.0,
            num_low_level_requests_completed: inner.num_ll_requests,
            num_low_level_requests_cancelled: inner.num_ll_requests_cancelled,
            num_low_level_requests_pending: inner.io_count.min(self.max_concurrent_io),
            cache_pinned_bytes: self.current_cache_pinned.load(Ordering::Relaxed),
            custom_param: self.hook.device_data(),
        };
        if inner.bytes_this_session > 0 {
            data.avg_cache_efficiency = (inner.cache_bytes_this_session as f32
                / inner.bytes_this_session as f32)
                * 100.0;
        }
        inner.bytes_this_interval = 0;
        inner.bytes_ll_this_interval = 0;
        inner.num_ll_requests = 0;
        inner.num_ll_requests_cancelled = 0;
        data
    }

    // The I/O worker.

    fn io_thread_loop(self: Arc<Self>) {
        debug!("device {} I/O thread up", self.id);
        let mut drain_attempts = 0u32;
        loop {
            {
                let mut inner = self.inner.lock();
                while !self.term.load(Ordering::Acquire) && !self.can_schedule(&inner) {
                    self.gate.wait(&mut inner);
                }
            }

            if self.term.load(Ordering::Acquire) {
                if self.clear_streams() {
                    break;
                }
                drain_attempts += 1;
                if drain_attempts > 500 {
                    warn!("device {} terminating with streams still alive", self.id);
                    break;
                }
                let mut inner = self.inner.lock();
                self.gate.wait_for(&mut inner, Duration::from_millis(10));
                continue;
            }

            self.perform_io();
        }
        debug!("device {} I/O thread down", self.id);
    }

    fn can_schedule(&self, inner: &DeviceInner) -> bool {
        if self.is_deferred() && inner.io_count >= self.max_concurrent_io {
            return false;
        }
        inner.sem_std > 0 || (inner.sem_auto > 0 && !inner.wait_mem_change)
    }

    /// One scheduler pass: pick the winning task and run its next transfer.
    pub(crate) fn perform_io(&self) {
        let (task, deadline_ms) = match self.find_next_task() {
            Some(found) => found,
            None => return,
        };

        // Handle deferred opening.
        match task.common().ensure_file_is_open() {
            Ok(true) => {
                if let Task::Auto(auto) = &task {
                    auto.on_file_deferred_open();
                }
            }
            Ok(false) => {}
            Err(_) => {
                // Deferred open failed: kill this task and bail out.
                match self.scheduler_type {
                    SchedulerType::Blocking => {
                        task.update(None, Err(Error::ErrIoDevice), false);
                    }
                    SchedulerType::DeferredLinedUp => task.kill(),
                }
                return;
            }
        }

        match self.hook.clone() {
            IoHook::Blocking(hook) => self.execute_task_blocking(&task, deadline_ms, &*hook),
            IoHook::Deferred(hook) => self.execute_task_deferred(&task, deadline_ms, &*hook),
        }
    }

    fn heuristics_for(&self, task: &Task, deadline_ms: f32) -> IoHeuristics {
        IoHeuristics {
            priority: task.common().priority(),
            deadline_sec: deadline_ms / 1000.0,
        }
    }

    fn execute_task_blocking(
        &self,
        task: &Task,
        deadline_ms: f32,
        hook: &dyn crate::hook::BlockingIoHook,
    ) {
        match task.prepare_transfer(false) {
            Prepared::Aborted => {
                // Cancelled at the last minute (e.g. the client destroyed the
                // stream).
                task.update(None, Err(Error::ErrCancelled), false);
            }
            Prepared::Ready(view) => {
                task.update(Some(view), Ok(()), false);
            }
            Prepared::Attached => unreachable!("no observers on the blocking device"),
            Prepared::Launch(launch) => {
                debug_assert!(
                    launch.info.requested_size > 0
                        && launch.info.requested_size <= self.granularity
                );
                let heuristics = self.heuristics_for(task, deadline_ms);
                let desc = task.common().desc.lock().clone();

                self.inner.lock().num_ll_requests += 1;

                let result = if launch.write {
                    let data = unsafe {
                        slice::from_raw_parts(
                            launch.region.ptr,
                            launch.info.requested_size as usize,
                        )
                    };
                    hook.write(&desc, &heuristics, data, &launch.info)
                } else {
                    let buffer = unsafe {
                        slice::from_raw_parts_mut(launch.region.ptr, launch.region.len)
                    };
                    hook.read(&desc, &heuristics, buffer, &launch.info)
                };

                let result = match result {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!("low-level transfer failed: {}", e);
                        Err(Error::ErrIoDevice)
                    }
                };

                // Dispose of the low-level transfer now.
                self.on_blocking_transfer_complete(&launch.view, result.is_ok());

                task.update(Some(launch.view), result, true);
            }
        }
    }

    /// Clears the block's in-flight transfer after a synchronous call; a
    /// failed block's cache identity is invalidated.
    fn on_blocking_transfer_complete(&self, view: &Arc<MemView>, success: bool) {
        self.with_inner(|inner| {
            let block = view.block;
            inner.mem.block_mut(block).state = BlockState::Idle;
            if !success && inner.mem.block(block).is_tagged() {
                inner.mem.untag_block(block);
            }
        });
    }

    fn execute_task_deferred(
        &self,
        task: &Task,
        deadline_ms: f32,
        hook: &dyn crate::hook::DeferredIoHook,
    ) {
        match task.prepare_transfer(false) {
            Prepared::Aborted => {
                task.update(None, Err(Error::ErrCancelled), false);
            }
            Prepared::Ready(view) => {
                // No low-level transfer needed and none in flight for this
                // block.
                task.update(Some(view), Ok(()), false);
            }
            Prepared::Attached => {
                // A transfer already exists for the block; the view will be
                // updated from its completion.
                trace!("attached to in-flight transfer");
            }
            Prepared::Launch(launch) => {
                let id = launch.transfer.expect("deferred launch without transfer");
                let transfer = self.with_inner(|inner| {
                    let record = inner.transfers.get_mut(&id.0)?;
                    if record.was_sent_to_llio {
                        return None;
                    }
                    record.was_sent_to_llio = true;
                    inner.num_ll_requests += 1;

                    let completer: Arc<dyn TransferCompleter> =
                        self.weak_self.upgrade().expect("device gone");
                    Some(AsyncTransfer::new(
                        record.info,
                        id,
                        record.write,
                        record.region,
                        Arc::downgrade(&completer),
                    ))
                });

                if let Some(transfer) = transfer {
                    let heuristics = self.heuristics_for(task, deadline_ms);
                    let desc = task.common().desc.lock().clone();
                    if launch.write {
                        hook.write(&desc, &heuristics, transfer);
                    } else {
                        hook.read(&desc, &heuristics, transfer);
                    }
                }
            }
        }
    }

    /// Runs the cancel handshake for one pending view. The owner's status
    /// lock is held by the caller; the cancellability decision and the
    /// block untag are atomic under the device lock, while the backend call
    /// runs outside it.
    pub fn cancel_view(
        &self,
        desc: &FileDescriptor,
        view: &Arc<MemView>,
        call_low_level: bool,
        all_cancelled: &mut bool,
    ) {
        let action = self.with_inner(|inner| {
            let block = view.block;
            let id = match inner.mem.block(block).transfer() {
                Some(id) => id,
                // A cached transfer still in the pending list, or a transfer
                // that already completed: nothing to cancel in the backend.
                None => return None,
            };
            let record = match inner.transfers.get(&id.0) {
                Some(record) => record,
                None => return None,
            };
            if !record.can_cancel(view) {
                return None;
            }

            // Safe to cancel: untag now so subsequent requests cannot attach
            // to a block about to hold invalid data.
            if inner.mem.block(block).is_tagged() {
                inner.mem.untag_block(block);
            }
            inner.num_ll_requests_cancelled += 1;

            let record = inner.transfers.get_mut(&id.0).expect("record vanished");
            let first_call = !record.was_llio_cancel_called;
            record.was_llio_cancel_called = true;
            Some((id, first_call))
        });

        let (id, first_call) = match action {
            Some(action) => action,
            None => return,
        };

        if !call_low_level {
            return;
        }
        if !first_call {
            // Cancel was already called for this transfer; the backend must
            // still be asked to cancel the next ones, if applicable.
            *all_cancelled = false;
            return;
        }
        if let IoHook::Deferred(hook) = &self.hook {
            let before = *all_cancelled;
            hook.cancel(desc, id, all_cancelled);
            if *all_cancelled && !before {
                warn!("backend illegally raised the all-cancelled hint");
                *all_cancelled = false;
            }
        }
    }

    // Destruction.

    /// Reaps destroyable tasks; kills the rest. True when no task remains.
    fn clear_streams(&self) -> bool {
        let mut lists = self.tasks.lock();
        let mut clear = |list: &mut Vec<Task>| {
            let mut i = 0;
            while i < list.len() {
                let task = list[i].clone();
                if task.common().to_be_destroyed() {
                    if task.can_be_destroyed() {
                        list.remove(i);
                        task.instant_destroy();
                        continue;
                    }
                } else {
                    // Set the stream in error and wait until the client
                    // destroys it.
                    task.kill();
                }
                i += 1;
            }
            list.is_empty()
        };
        let tasks_empty = clear(&mut lists.tasks);
        let caching_empty = clear(&mut lists.caching);
        tasks_empty && caching_empty
    }

    /// Stops the I/O thread. Streams should all be destroyed beforehand; the
    /// device waits a bounded time for stragglers.
    pub fn term(&self) {
        self.term.store(true, Ordering::Release);
        self.gate.notify_one();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl TransferCompleter for Device {
    /// Completion entry point for the deferred backend, possibly on an
    /// arbitrary thread. Pops all observers and frees the transfer record
    /// under the device lock, then notifies the owners outside it.
    fn transfer_complete(&self, id: TransferId, result: Result<u32>) {
        let result: Result<()> = result.map(|_| ());

        let observers = self.with_inner(|inner| {
            let record = match inner.transfers.remove(&id.0) {
                Some(record) => record,
                None => {
                    warn!("completion for an unknown transfer");
                    return None;
                }
            };
            debug_assert!(!record.observers.is_empty());

            // After this, new requests touching this memory block treat it as
            // idle.
            let block = record.block;
            inner.mem.block_mut(block).state = BlockState::Idle;
            if result.is_err() && inner.mem.block(block).is_tagged() {
                // The block would hold invalid data.
                inner.mem.untag_block(block);
            }
            Some(record.observers)
        });

        let observers = match observers {
            Some(observers) => observers,
            None => return,
        };

        // Notify every observer; only the first one reports the low-level
        // transfer for statistics.
        let mut required_low_level = true;
        for view in observers {
            let owner = view.owner.clone().expect("deferred view without owner");
            owner.update(Some(view), result.clone(), required_low_level);
            required_low_level = false;
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug_assert!(self.thread.lock().is_none() || self.term.load(Ordering::Acquire));
    }
}
