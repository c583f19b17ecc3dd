use std::fmt;

use crate::error::Result;

/// Identifier for a file within the streaming cache. Files sharing an ID share
/// cached data, regardless of how their descriptors were resolved.
pub type FileId = u32;

/// Identifier for a streaming device registered with the manager.
pub type DeviceId = u32;

/// I/O priority, carried by every operation and stream.
pub type Priority = i8;

pub const MIN_PRIORITY: Priority = 0;
pub const MAX_PRIORITY: Priority = 100;
pub const DEFAULT_PRIORITY: Priority = 50;

/// File open mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            OpenMode::Read => "Read",
            OpenMode::Write => "Write",
            OpenMode::ReadWrite => "ReadWrite",
        };
        write!(f, "{}", s)
    }
}

/// Seek origin for `set_position`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MoveMethod {
    Begin,
    Current,
    End,
}

/// Hints forwarded to the file location resolver when opening a file.
#[derive(Debug, Clone, Default)]
pub struct FileSystemFlags {
    /// File should be looked up in the current language directory.
    pub is_language_specific: bool,
    /// Cache identity override. When set, streams opened against this file
    /// share cached blocks under this ID instead of the resolved one.
    pub cache_id: Option<FileId>,
    /// Number of bytes to prefetch when pinning this file in cache.
    pub num_bytes_prefetch: u32,
    /// Set by the manager before resolution: whether the file backs an
    /// automatic stream.
    pub is_automatic_stream: bool,
    /// Opaque value passed through to the resolver.
    pub custom_param: u64,
}

/// Opaque handle to an open file, produced by the resolver and consumed by the
/// low-level hook. Ownership transfers to the first stream created against it;
/// the hook's `close` runs when that stream is destroyed.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// File size in bytes. Negative until a deferred open resolves it.
    pub file_size: i64,
    /// Byte offset of the start of the file within its physical container
    /// (raw devices, packaged files). Added to every low-level position.
    pub sector_offset: u64,
    /// Device this file streams from.
    pub device_id: DeviceId,
    /// Backend-private parameter (handle, slot index, ...).
    pub custom_param: u64,
}

impl FileDescriptor {
    pub fn is_resolved(&self) -> bool {
        self.file_size >= 0
    }
}

/// Result of a resolver open call.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub desc: FileDescriptor,
    /// True if the resolver elected to defer the actual open. The descriptor
    /// carries a valid device ID but an unresolved size; the open is retried
    /// synchronously from the I/O thread.
    pub deferred: bool,
}

impl OpenOutcome {
    pub fn opened(desc: FileDescriptor) -> Self {
        OpenOutcome {
            desc,
            deferred: false,
        }
    }

    pub fn deferred(desc: FileDescriptor) -> Self {
        OpenOutcome {
            desc,
            deferred: true,
        }
    }
}

/// Maps file names and IDs to descriptors and devices.
///
/// The resolver may defer an open requested with `sync_open == false`; the
/// returned descriptor must still carry the target device ID. When
/// `sync_open` is true the resolver must open synchronously or fail.
pub trait FileLocationResolver: Send + Sync {
    fn open_by_name(
        &self,
        name: &str,
        open_mode: OpenMode,
        flags: Option<&FileSystemFlags>,
        sync_open: bool,
    ) -> Result<OpenOutcome>;

    fn open_by_id(
        &self,
        file_id: FileId,
        open_mode: OpenMode,
        flags: Option<&FileSystemFlags>,
        sync_open: bool,
    ) -> Result<OpenOutcome>;
}
