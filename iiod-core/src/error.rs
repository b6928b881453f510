/// IIOD Error Types
///
/// Error handling for the daemon core, including the errno mapping used
/// by the binary protocol (negative errno values travel as response codes).
use std::io;
use thiserror::Error;

/// Main error type for daemon operations
#[derive(Error, Debug)]
pub enum IiodError {
    /// IO error on the transport or a descriptor
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An argument violated a protocol invariant (bad mask length,
    /// zero-sized transfer, unknown opcode, ...)
    #[error("Invalid argument")]
    InvalidArg,

    /// Named entity (attribute, trigger) does not exist
    #[error("No such entity")]
    NotFound,

    /// Unknown device, buffer, block or event-stream handle
    #[error("Bad handle")]
    BadHandle,

    /// Resource already claimed (cyclic buffer conflict, duplicate create)
    #[error("Resource busy")]
    Busy,

    /// Allocation failure
    #[error("Out of memory")]
    NoMem,

    /// Nonblocking operation found nothing ready
    #[error("Operation would block")]
    WouldBlock,

    /// The pending operation was cancelled (block freed, stream destroyed)
    #[error("Operation cancelled")]
    Cancelled,

    /// The transport hit EOF or the stop signal was raised
    #[error("Transport closed")]
    Closed,

    /// Raw errno propagated verbatim from the IIO layer
    #[error("Device error: errno {0}")]
    Errno(i32),
}

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, IiodError>;

impl IiodError {
    /// The negative errno carried in a response `code` for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArg => -libc::EINVAL,
            Self::NotFound => -libc::ENOENT,
            Self::BadHandle => -libc::EBADF,
            Self::Busy => -libc::EBUSY,
            Self::NoMem => -libc::ENOMEM,
            Self::WouldBlock => -libc::EAGAIN,
            Self::Cancelled => -libc::ECANCELED,
            Self::Closed => -libc::EPIPE,
            Self::Errno(e) => {
                debug_assert!(*e < 0, "kernel errno must already be negative");
                *e
            }
        }
    }

    /// Inverse of [`errno`](Self::errno), used when decoding peer codes.
    #[must_use]
    pub fn from_errno(err: i32) -> Self {
        match -err {
            libc::EINVAL => Self::InvalidArg,
            libc::ENOENT => Self::NotFound,
            libc::EBADF => Self::BadHandle,
            libc::EBUSY => Self::Busy,
            libc::ENOMEM => Self::NoMem,
            libc::EAGAIN => Self::WouldBlock,
            libc::ECANCELED => Self::Cancelled,
            libc::EPIPE => Self::Closed,
            _ => Self::Errno(err),
        }
    }

    /// Check if this error unwinds the whole session (transport-eof class).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(IiodError::InvalidArg.errno(), -libc::EINVAL);
        assert_eq!(IiodError::BadHandle.errno(), -libc::EBADF);
        assert_eq!(IiodError::Busy.errno(), -libc::EBUSY);
        assert_eq!(IiodError::Errno(-77).errno(), -77);
    }

    #[test]
    fn test_errno_round_trip() {
        for err in [
            IiodError::InvalidArg,
            IiodError::NotFound,
            IiodError::BadHandle,
            IiodError::Busy,
            IiodError::NoMem,
            IiodError::WouldBlock,
            IiodError::Cancelled,
            IiodError::Closed,
        ] {
            let code = err.errno();
            assert_eq!(IiodError::from_errno(code).errno(), code);
        }
    }

    #[test]
    fn test_only_transport_eof_is_fatal() {
        assert!(IiodError::Closed.is_fatal());
        assert!(!IiodError::Busy.is_fatal());
        assert!(!IiodError::Errno(-libc::ETIMEDOUT).is_fatal());
    }
}
