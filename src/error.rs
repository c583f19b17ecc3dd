use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid parameter")]
    ErrInvalidParameter,
    #[error("insufficient memory")]
    ErrInsufficientMemory,
    #[error("file not found")]
    ErrFileNotFound,
    #[error("low-level I/O device failure")]
    ErrIoDevice,
    #[error("operation cancelled")]
    ErrCancelled,

    #[error("an operation is already pending on this stream")]
    ErrOperationPending,
    #[error("stream is in error state")]
    ErrStreamInError,
    #[error("request size incompatible with low-level block size")]
    ErrRequestSizeNotBlockAligned,
    #[error("low-level block size must divide the device granularity")]
    ErrIncompatibleSettings,
    #[error("buffer settings incompatible with device granularity")]
    ErrIncompatibleBufferSettings,
    #[error("file position before beginning of file")]
    ErrPositionOutOfRange,
    #[error("no buffer granted to client")]
    ErrNoBufferGranted,
    #[error("invalid device ID")]
    ErrInvalidDevice,
    #[error("device does not support automatic streams")]
    ErrStreamingDisabled,
    #[error("file size must be greater than zero to read")]
    ErrFileSizeZero,
    #[error("file location resolver was not set")]
    ErrNoResolver,
    #[error("file is not pinned in cache")]
    ErrFileNotPinned,
    #[error("invalid language name")]
    ErrInvalidLanguage,
    #[error("too many buffers granted at once")]
    ErrTooManyBuffersGranted,
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::ErrFileNotFound => io::Error::new(io::ErrorKind::NotFound, e.to_string()),
            e @ Error::ErrCancelled => io::Error::new(io::ErrorKind::Interrupted, e.to_string()),
            e @ Error::ErrInvalidParameter => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}
