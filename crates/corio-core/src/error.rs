//! Portable completion error codes.
//!
//! Every I/O completion carries exactly one `ErrorCode`. Platform errno
//! values are normalized at the service boundary so that user code never
//! matches on raw OS numbers. Cancellation always surfaces as
//! `Cancelled`, whatever errno the kernel chose for it.

use std::fmt;

/// Result alias used across the corio crates.
///
/// `Err(ErrorCode::Ok)` is never produced; fallible functions that
/// succeed return `Ok(..)`.
pub type IoResult<T> = std::result::Result<T, ErrorCode>;

/// Portable status of an I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Completed successfully.
    Ok,
    /// Cancelled via the service's cancel operation.
    Cancelled,
    /// The operation would have blocked.
    WouldBlock,
    /// The peer refused the connection.
    ConnectionRefused,
    /// The connection was reset by the peer.
    ConnectionReset,
    /// End of stream.
    Eof,
    /// The operation timed out.
    TimedOut,
    /// Bad handle or bad arguments, detected before reaching the kernel.
    InvalidArgument,
    /// Any other OS error, carrying the raw errno.
    System(i32),
}

impl ErrorCode {
    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, ErrorCode::Ok)
    }

    #[inline]
    pub fn is_err(self) -> bool {
        !self.is_ok()
    }

    /// Normalize a positive errno value.
    ///
    /// `0` maps to `Ok`. `ECANCELED` maps to `Cancelled` so cancellation
    /// is uniform regardless of which path reported it.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            0 => ErrorCode::Ok,
            libc::ECANCELED => ErrorCode::Cancelled,
            libc::EAGAIN => ErrorCode::WouldBlock,
            libc::ECONNREFUSED => ErrorCode::ConnectionRefused,
            libc::ECONNRESET => ErrorCode::ConnectionReset,
            libc::ETIMEDOUT => ErrorCode::TimedOut,
            libc::EINVAL | libc::EBADF => ErrorCode::InvalidArgument,
            e => ErrorCode::System(e),
        }
    }

    /// Normalize a kernel completion result (non-negative = success,
    /// negative = -errno).
    pub fn from_result(result: i32) -> Self {
        if result >= 0 {
            ErrorCode::Ok
        } else {
            Self::from_errno(-result)
        }
    }

    /// Read and normalize the calling thread's errno.
    pub fn last_os_error() -> Self {
        Self::from_errno(errno())
    }
}

/// Read the calling thread's errno.
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Ok => write!(f, "ok"),
            ErrorCode::Cancelled => write!(f, "operation cancelled"),
            ErrorCode::WouldBlock => write!(f, "operation would block"),
            ErrorCode::ConnectionRefused => write!(f, "connection refused"),
            ErrorCode::ConnectionReset => write!(f, "connection reset"),
            ErrorCode::Eof => write!(f, "end of stream"),
            ErrorCode::TimedOut => write!(f, "operation timed out"),
            ErrorCode::InvalidArgument => write!(f, "invalid argument"),
            ErrorCode::System(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for ErrorCode {}
