use std::sync::Arc;

use fxhash::FxHashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::{AutoStmBufSettings, AutoStmHeuristics, DeviceSettings, StreamMgrSettings};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::file::{
    DeviceId, FileDescriptor, FileId, FileLocationResolver, FileSystemFlags, OpenMode, Priority,
};
use crate::hook::{DeviceData, IoHook};
use crate::stream::{AutoStream, DeferredOpen, StdStream};

pub(crate) const MAX_LANGUAGE_NAME_LEN: usize = 64;

/// Callback invoked when the current language changes. The cookie identifies
/// the registration for removal.
pub type LanguageChangeHandler = Arc<dyn Fn(&str, u64) + Send + Sync>;

struct LangChgObserver {
    handler: LanguageChangeHandler,
    cookie: u64,
}

/// Bookkeeping for one pinned file: the caching stream plus one priority per
/// outstanding pin.
struct CachedFileStreamData {
    stream: Arc<AutoStream>,
    priorities: Vec<Priority>,
    ref_count: u32,
}

impl CachedFileStreamData {
    fn max_priority(&self) -> Priority {
        self.priorities.iter().copied().max().unwrap_or(0)
    }

    fn add_ref(&mut self, priority: Priority) {
        self.ref_count += 1;
        self.priorities.push(priority);
    }

    /// Returns true when the last pin is gone.
    fn release(&mut self, priority: Priority) -> bool {
        if let Some(index) = self.priorities.iter().position(|p| *p == priority) {
            self.priorities.swap_remove(index);
        }
        self.ref_count -= 1;
        self.ref_count == 0
    }

    fn update_priority(&mut self, new_priority: Priority, old_priority: Priority) -> bool {
        if let Some(slot) = self.priorities.iter_mut().find(|p| **p == old_priority) {
            *slot = new_priority;
            true
        } else {
            false
        }
    }
}

/// The stream manager: multiplexes devices, routes stream creation through
/// the file location resolver, and carries the process-wide language and
/// pinned-file state.
pub struct StreamMgr {
    resolver: Mutex<Option<Arc<dyn FileLocationResolver>>>,
    devices: Mutex<Vec<Option<Arc<Device>>>>,
    language: Mutex<String>,
    lang_observers: Mutex<Vec<LangChgObserver>>,
    pinned: Mutex<FxHashMap<FileId, CachedFileStreamData>>,
}

impl StreamMgr {
    pub fn new(settings: StreamMgrSettings) -> StreamMgr {
        StreamMgr {
            resolver: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
            language: Mutex::new(settings.language.unwrap_or_default()),
            lang_observers: Mutex::new(Vec::new()),
            pinned: Mutex::new(FxHashMap::default()),
        }
    }

    /// Sets the file location resolver. Needed before any stream can be
    /// created.
    pub fn set_file_location_resolver(&self, resolver: Arc<dyn FileLocationResolver>) {
        *self.resolver.lock() = Some(resolver);
    }

    fn resolver(&self) -> Result<Arc<dyn FileLocationResolver>> {
        self.resolver.lock().clone().ok_or(Error::ErrNoResolver)
    }

    // Device management. Not thread safe with respect to itself: devices are
    // expected to be registered up front.

    pub fn create_device(
        &self,
        settings: &DeviceSettings,
        hook: IoHook,
    ) -> Result<DeviceId> {
        let mut devices = self.devices.lock();
        let id = devices
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or(devices.len()) as DeviceId;
        let device = Device::create(settings, hook, self.resolver.lock().clone(), id)?;
        if (id as usize) < devices.len() {
            devices[id as usize] = Some(device);
        } else {
            devices.push(Some(device));
        }
        Ok(id)
    }

    /// Destroys a device. No stream should exist for the device at this
    /// point.
    pub fn destroy_device(&self, device_id: DeviceId) -> Result<()> {
        let device = {
            let mut devices = self.devices.lock();
            match devices.get_mut(device_id as usize) {
                Some(slot) => slot.take().ok_or(Error::ErrInvalidDevice)?,
                None => return Err(Error::ErrInvalidDevice),
            }
        };
        device.term();
        Ok(())
    }

    fn device(&self, device_id: DeviceId) -> Result<Arc<Device>> {
        self.devices
            .lock()
            .get(device_id as usize)
            .and_then(|slot| slot.clone())
            .ok_or(Error::ErrInvalidDevice)
    }

    /// Monitoring counters for one device.
    pub fn device_data(&self, device_id: DeviceId) -> Result<DeviceData> {
        Ok(self.device(device_id)?.device_data())
    }

    /// Static description of one device, as reported by its hook.
    pub fn device_desc(&self, device_id: DeviceId) -> Result<crate::hook::DeviceDesc> {
        Ok(self.device(device_id)?.hook().device_desc())
    }

    /// Reaps dead tasks on every device; the calling device additionally
    /// kills its lowest-priority ready task strictly below `priority`.
    pub fn force_cleanup(&self, calling_device: Option<DeviceId>, priority: Priority) {
        let devices: Vec<(DeviceId, Arc<Device>)> = {
            let devices = self.devices.lock();
            devices
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.clone().map(|d| (i as DeviceId, d)))
                .collect()
        };
        for (id, device) in devices {
            device.force_cleanup(calling_device == Some(id), priority);
        }
    }

    // Stream creation.

    fn open_checked(
        &self,
        outcome: crate::file::OpenOutcome,
        sync_open: bool,
        open_mode: OpenMode,
    ) -> Result<(FileDescriptor, bool)> {
        let deferred = outcome.deferred;
        debug_assert!(
            !(sync_open && deferred),
            "cannot defer an open requested synchronously"
        );
        let mut desc = outcome.desc;
        if !deferred && desc.file_size <= 0 && open_mode == OpenMode::Read {
            return Err(Error::ErrFileSizeZero);
        }
        if deferred {
            // Unresolved until the I/O thread retries the open.
            desc.file_size = desc.file_size.max(0);
        }
        Ok((desc, deferred))
    }

    /// Creates a standard stream on a file located by name.
    pub fn create_std_from_name(
        &self,
        file_name: &str,
        flags: Option<&FileSystemFlags>,
        open_mode: OpenMode,
        sync_open: bool,
    ) -> Result<Arc<StdStream>> {
        if file_name.is_empty() {
            return Err(Error::ErrInvalidParameter);
        }
        let resolver = self.resolver()?;

        let flags = flags.map(|f| FileSystemFlags {
            is_automatic_stream: false,
            ..f.clone()
        });
        let outcome = resolver
            .open_by_name(file_name, open_mode, flags.as_ref(), sync_open)
            .map_err(|e| {
                warn!("failed to open \"{}\": {}", file_name, e);
                open_error(e)
            })?;
        let (desc, deferred) = self.open_checked(outcome, sync_open, open_mode)?;

        let device = self.device(desc.device_id)?;
        let stream = match device.create_std(desc.clone(), open_mode) {
            Ok(stream) => stream,
            Err(e) => {
                if !deferred {
                    device.hook().close(&desc);
                }
                return Err(e);
            }
        };

        if !deferred {
            stream.common.set_file_open(desc);
        } else {
            stream.common.set_deferred_open(
                desc,
                DeferredOpen::ByName {
                    name: file_name.to_string(),
                    flags,
                    open_mode,
                },
            );
        }
        Ok(stream)
    }

    /// Creates a standard stream on a file located by ID.
    pub fn create_std(
        &self,
        file_id: FileId,
        flags: Option<&FileSystemFlags>,
        open_mode: OpenMode,
        sync_open: bool,
    ) -> Result<Arc<StdStream>> {
        let resolver = self.resolver()?;

        let flags = flags.map(|f| FileSystemFlags {
            is_automatic_stream: false,
            ..f.clone()
        });
        let outcome = resolver
            .open_by_id(file_id, open_mode, flags.as_ref(), sync_open)
            .map_err(|e| {
                warn!("failed to open file {}: {}", file_id, e);
                open_error(e)
            })?;
        let (desc, deferred) = self.open_checked(outcome, sync_open, open_mode)?;

        let device = self.device(desc.device_id)?;
        let stream = match device.create_std(desc.clone(), open_mode) {
            Ok(stream) => stream,
            Err(e) => {
                if !deferred {
                    device.hook().close(&desc);
                }
                return Err(e);
            }
        };

        if !deferred {
            stream.common.set_file_open(desc);
        } else {
            stream.common.set_deferred_open(
                desc,
                DeferredOpen::ById {
                    file_id,
                    flags,
                    open_mode,
                },
            );
        }
        Ok(stream)
    }

    /// Creates an automatic stream on a file located by name. Automatic
    /// streams always read; they must be started explicitly.
    pub fn create_auto_from_name(
        &self,
        file_name: &str,
        flags: Option<&FileSystemFlags>,
        heuristics: &AutoStmHeuristics,
        buffer_settings: Option<&AutoStmBufSettings>,
        sync_open: bool,
    ) -> Result<Arc<AutoStream>> {
        if file_name.is_empty() {
            return Err(Error::ErrInvalidParameter);
        }
        heuristics.validate()?;
        let resolver = self.resolver()?;

        let flags = flags.map(|f| FileSystemFlags {
            is_automatic_stream: true,
            ..f.clone()
        });
        let cache_id = flags.as_ref().and_then(|f| f.cache_id);

        let outcome = resolver
            .open_by_name(file_name, OpenMode::Read, flags.as_ref(), sync_open)
            .map_err(|e| {
                warn!("failed to open \"{}\": {}", file_name, e);
                open_error(e)
            })?;
        let (desc, deferred) = self.open_checked(outcome, sync_open, OpenMode::Read)?;

        let device = self.device(desc.device_id)?;
        let stream =
            match device.create_auto(desc.clone(), cache_id, heuristics, buffer_settings) {
                Ok(stream) => stream,
                Err(e) => {
                    if !deferred {
                        device.hook().close(&desc);
                    }
                    return Err(e);
                }
            };

        if !deferred {
            stream.common.set_file_open(desc);
        } else {
            stream.common.set_deferred_open(
                desc,
                DeferredOpen::ByName {
                    name: file_name.to_string(),
                    flags,
                    open_mode: OpenMode::Read,
                },
            );
        }
        Ok(stream)
    }

    /// Creates an automatic stream on a file located by ID.
    pub fn create_auto(
        &self,
        file_id: FileId,
        flags: Option<&FileSystemFlags>,
        heuristics: &AutoStmHeuristics,
        buffer_settings: Option<&AutoStmBufSettings>,
        sync_open: bool,
    ) -> Result<Arc<AutoStream>> {
        heuristics.validate()?;
        let resolver = self.resolver()?;

        let flags = flags.map(|f| FileSystemFlags {
            is_automatic_stream: true,
            ..f.clone()
        });
        let cache_id = flags.as_ref().and_then(|f| f.cache_id);

        let outcome = resolver
            .open_by_id(file_id, OpenMode::Read, flags.as_ref(), sync_open)
            .map_err(|e| {
                warn!("failed to open file {}: {}", file_id, e);
                open_error(e)
            })?;
        let (desc, deferred) = self.open_checked(outcome, sync_open, OpenMode::Read)?;

        let device = self.device(desc.device_id)?;
        let stream =
            match device.create_auto(desc.clone(), cache_id, heuristics, buffer_settings) {
                Ok(stream) => stream,
                Err(e) => {
                    if !deferred {
                        device.hook().close(&desc);
                    }
                    return Err(e);
                }
            };

        if !deferred {
            stream.common.set_file_open(desc);
        } else {
            stream.common.set_deferred_open(
                desc,
                DeferredOpen::ById {
                    file_id,
                    flags,
                    open_mode: OpenMode::Read,
                },
            );
        }
        Ok(stream)
    }

    // Cache pinning.

    /// Starts streaming the first `flags.num_bytes_prefetch` bytes of the
    /// file into cache. The stream is scheduled only after all regular
    /// streams are serviced; the data stays pinned until unpinned, or until
    /// the pinned-bytes budget forces a higher-priority file in.
    pub fn pin_file_in_cache(
        &self,
        file_id: FileId,
        flags: &FileSystemFlags,
        priority: Priority,
    ) -> Result<()> {
        let mut pinned = self.pinned.lock();
        if let Some(data) = pinned.get_mut(&file_id) {
            data.add_ref(priority);
            let max = data.max_priority();
            let stream = data.stream.clone();
            drop(pinned);
            self.device(stream_device(&stream))?
                .update_caching_priority(&stream, max);
            return Ok(());
        }

        let stream = self.create_caching_stream(file_id, flags, priority)?;
        stream.set_stream_name(&file_id.to_string());
        let _ = stream.start();
        pinned.insert(
            file_id,
            CachedFileStreamData {
                stream,
                priorities: vec![priority],
                ref_count: 1,
            },
        );
        Ok(())
    }

    /// Releases one pin taken with the same priority. The data may remain in
    /// cache until the memory is recycled.
    pub fn unpin_file_in_cache(&self, file_id: FileId, priority: Priority) -> Result<()> {
        let mut pinned = self.pinned.lock();
        let data = pinned.get_mut(&file_id).ok_or(Error::ErrFileNotPinned)?;
        if data.release(priority) {
            let data = pinned.remove(&file_id).expect("pinned entry vanished");
            drop(pinned);
            data.stream.destroy();
        } else {
            let max = data.max_priority();
            let stream = data.stream.clone();
            drop(pinned);
            self.device(stream_device(&stream))?
                .update_caching_priority(&stream, max);
        }
        Ok(())
    }

    /// Re-prioritizes one outstanding pin.
    pub fn update_caching_priority(
        &self,
        file_id: FileId,
        new_priority: Priority,
        old_priority: Priority,
    ) -> Result<()> {
        let mut pinned = self.pinned.lock();
        let data = pinned.get_mut(&file_id).ok_or(Error::ErrFileNotPinned)?;
        if !data.update_priority(new_priority, old_priority) {
            return Err(Error::ErrFileNotPinned);
        }
        let max = data.max_priority();
        let stream = data.stream.clone();
        drop(pinned);
        self.device(stream_device(&stream))?
            .update_caching_priority(&stream, max);
        Ok(())
    }

    /// Percentage of the requested pin already in cache, and whether the
    /// pinned-bytes budget is preventing the rest from fitting.
    pub fn get_buffer_status_for_pinned_file(&self, file_id: FileId) -> Result<(f32, bool)> {
        let pinned = self.pinned.lock();
        let data = pinned.get(&file_id).ok_or(Error::ErrFileNotPinned)?;
        let stream = data.stream.clone();
        drop(pinned);

        let mut caching_buffer_size = stream.nominal_buffering();
        let file_size = stream.file_size();
        if file_size != 0 {
            caching_buffer_size = caching_buffer_size.min(file_size as u32);
        }

        let buffered = stream.virtual_buffering_size();
        let percent = (buffered as f32 / caching_buffer_size as f32) * 100.0;
        let device = self.device(stream_device(&stream))?;
        let cache_full = buffered < caching_buffer_size
            && (caching_buffer_size - buffered) > device.remaining_cache_pinned_bytes();
        Ok((percent, cache_full))
    }

    fn create_caching_stream(
        &self,
        file_id: FileId,
        flags: &FileSystemFlags,
        priority: Priority,
    ) -> Result<Arc<AutoStream>> {
        let resolver = self.resolver()?;

        let mut flags = flags.clone();
        flags.is_automatic_stream = true;

        let outcome = resolver
            .open_by_id(file_id, OpenMode::Read, Some(&flags), false)
            .map_err(|e| {
                warn!("failed to open file {} for caching: {}", file_id, e);
                open_error(e)
            })?;
        // The resolver may have adjusted the prefetch size.
        if flags.num_bytes_prefetch == 0 {
            return Err(Error::ErrInvalidParameter);
        }
        let (desc, deferred) = self.open_checked(outcome, false, OpenMode::Read)?;

        let device = self.device(desc.device_id)?;
        let stream = match device.create_caching_stream(
            desc.clone(),
            Some(file_id),
            flags.num_bytes_prefetch,
            priority,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                if !deferred {
                    device.hook().close(&desc);
                }
                return Err(e);
            }
        };

        if !deferred {
            stream.common.set_file_open(desc);
        } else {
            stream.common.set_deferred_open(
                desc,
                DeferredOpen::ById {
                    file_id,
                    flags: Some(flags),
                    open_mode: OpenMode::Read,
                },
            );
        }
        Ok(stream)
    }

    // Language management.

    pub fn current_language(&self) -> String {
        self.language.lock().clone()
    }

    /// Sets the language directory name and notifies observers, from the
    /// last added to the first, so they may unregister from within.
    pub fn set_current_language(&self, language_name: &str) -> Result<()> {
        if language_name.len() >= MAX_LANGUAGE_NAME_LEN
            || language_name.ends_with('/')
            || language_name.ends_with('\\')
        {
            return Err(Error::ErrInvalidLanguage);
        }
        *self.language.lock() = language_name.to_string();
        debug!("current language set to \"{}\"", language_name);

        let observers: Vec<(LanguageChangeHandler, u64)> = {
            let observers = self.lang_observers.lock();
            observers
                .iter()
                .rev()
                .map(|o| (o.handler.clone(), o.cookie))
                .collect()
        };
        for (handler, cookie) in observers {
            handler(language_name, cookie);
        }
        Ok(())
    }

    pub fn add_language_change_observer(&self, handler: LanguageChangeHandler, cookie: u64) {
        self.lang_observers
            .lock()
            .push(LangChgObserver { handler, cookie });
    }

    pub fn remove_language_change_observer(&self, cookie: u64) {
        self.lang_observers.lock().retain(|o| o.cookie != cookie);
    }

    /// Flushes the cached data of every device.
    pub fn flush_all_caches(&self) {
        let devices: Vec<Arc<Device>> = {
            let devices = self.devices.lock();
            devices.iter().filter_map(|slot| slot.clone()).collect()
        };
        for device in devices {
            device.flush_cache();
        }
    }
}

impl Drop for StreamMgr {
    fn drop(&mut self) {
        let pinned: Vec<CachedFileStreamData> = self.pinned.lock().drain().map(|(_, v)| v).collect();
        for data in pinned {
            data.stream.destroy();
        }
        let devices: Vec<Arc<Device>> = self
            .devices
            .lock()
            .drain(..)
            .flatten()
            .collect();
        for device in devices {
            device.term();
        }
    }
}

fn stream_device(stream: &Arc<AutoStream>) -> DeviceId {
    stream.common.device.device_id()
}

fn open_error(e: Error) -> Error {
    match e {
        Error::ErrFileNotFound => Error::ErrFileNotFound,
        _ => Error::ErrIoDevice,
    }
}
