//! Deadline-driven streaming I/O engine for real-time media playback.
//!
//! filestream schedules asynchronous file transfers for clients that consume
//! data on a deadline, such as a game engine's audio pipeline. Clients open
//! logical streams against a low-level storage backend; the core schedules
//! transfers per device, manages a bounded I/O memory pool with a
//! content-addressed cache allowing block reuse across streams, and enforces
//! per-stream buffering targets under a single background I/O worker.
//!
//! The most important types are [`StreamMgr`], the entry point that
//! multiplexes devices and resolves files, and the two stream flavors:
//! [`StdStream`] for one-shot bounded reads and writes into client memory,
//! and [`AutoStream`] for a continuously refilled window over a file.
//! Storage backends plug in through [`BlockingIoHook`] or [`DeferredIoHook`];
//! file lookup goes through [`FileLocationResolver`].

#![warn(rust_2018_idioms)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

mod buddy;

mod config;
pub use crate::config::{
    AutoStmBufSettings, AutoStmHeuristics, DeviceSettings, SchedulerType, StreamMgrSettings,
    ThreadProperties,
};

pub(crate) mod device;

mod error;
pub use crate::error::{Error, Result};

mod file;
pub use crate::file::{
    DeviceId, FileDescriptor, FileId, FileLocationResolver, FileSystemFlags, MoveMethod, OpenMode,
    OpenOutcome, Priority, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};

mod hook;
pub use crate::hook::{
    AsyncTransfer, BlockingIoHook, DeferredIoHook, DeviceData, DeviceDesc, IoHeuristics, IoHook,
    IoHookCommon, TransferId, TransferInfo,
};

mod manager;
pub use crate::manager::{LanguageChangeHandler, StreamMgr};

pub(crate) mod memory;
pub use crate::memory::GrantedBuffer;

pub(crate) mod stream;
pub use crate::stream::{
    auto_stream::{BufferingStatus, GetBufferResult},
    AutoStream, StdStream, StreamStatus,
};

mod transfer;

#[cfg(test)]
pub(crate) mod test_util;
