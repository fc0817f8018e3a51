use std::fmt;
use std::io;

use rfuse3::Errno;

/// Errors surfaced by the passthrough layer to the control plane.
///
/// Everything except [`PassthroughError::Io`] is produced by this crate
/// itself; `Io` carries a backing-file failure verbatim and is never
/// reinterpreted.
#[derive(Debug)]
pub enum PassthroughError {
    /// Passthrough was requested on an operation other than open/create,
    /// or on an open instance that is already bound.
    InvalidOperation,
    /// The supplied descriptor or token does not resolve to a live file.
    InvalidHandle,
    /// The backing file lacks the read or write data-path capability.
    UnsupportedBackingFile,
    /// Binding would nest filesystems deeper than the configured maximum.
    StackingDepthExceeded,
    /// No completion context could be allocated for submitted I/O.
    /// The caller may retry synchronously.
    AllocationFailure,
    /// Submitted (asynchronous) forwarding is disabled for this instance.
    /// The caller must fall back to synchronous I/O.
    AsyncUnsupported,
    /// The backing operation itself failed.
    Io(io::Error),
}

impl PassthroughError {
    /// Raw OS error code reported to the control plane.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            PassthroughError::InvalidOperation => libc::EINVAL,
            PassthroughError::InvalidHandle => libc::EBADF,
            PassthroughError::UnsupportedBackingFile => libc::EBADF,
            PassthroughError::StackingDepthExceeded => libc::ELOOP,
            PassthroughError::AllocationFailure => libc::ENOMEM,
            PassthroughError::AsyncUnsupported => libc::EOPNOTSUPP,
            PassthroughError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl fmt::Display for PassthroughError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassthroughError::InvalidOperation => {
                write!(f, "passthrough only attaches at open or create")
            }
            PassthroughError::InvalidHandle => {
                write!(f, "invalid descriptor or token for passthrough")
            }
            PassthroughError::UnsupportedBackingFile => {
                write!(f, "backing file misses read/write operations")
            }
            PassthroughError::StackingDepthExceeded => {
                write!(f, "maximum fs stacking depth exceeded for passthrough")
            }
            PassthroughError::AllocationFailure => {
                write!(f, "failed to allocate completion context")
            }
            PassthroughError::AsyncUnsupported => {
                write!(f, "submitted I/O is not supported by this instance")
            }
            PassthroughError::Io(e) => write!(f, "backing I/O error: {e}"),
        }
    }
}

impl std::error::Error for PassthroughError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PassthroughError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PassthroughError {
    fn from(e: io::Error) -> Self {
        PassthroughError::Io(e)
    }
}

impl From<PassthroughError> for io::Error {
    fn from(e: PassthroughError) -> Self {
        match e {
            PassthroughError::Io(e) => e,
            other => io::Error::from_raw_os_error(other.raw_os_error()),
        }
    }
}

impl From<PassthroughError> for Errno {
    fn from(e: PassthroughError) -> Self {
        let ioerr: io::Error = e.into();
        ioerr.into()
    }
}

pub type Result<T> = std::result::Result<T, PassthroughError>;
