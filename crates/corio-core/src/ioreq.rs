//! The I/O request record.
//!
//! An `IoReq` is the unit of work handed to the I/O service. It carries
//! the target handle, the data buffer, socket address storage, the file
//! offset for positioned I/O, and the one-shot completion hook.
//!
//! Ownership is by value: the submitter builds a boxed record and moves
//! it into the service; the service moves it back into the hook when the
//! kernel reports the completion. The record owns its buffer, so the
//! region named in the submission stays valid for exactly as long as the
//! operation is in flight. The hook fires exactly once per submitted
//! record, including on cancellation and on submit-time failure.

use crate::error::ErrorCode;
use crate::handle::Handle;

/// A byte buffer owned by an `IoReq`.
///
/// `capacity` is the size of the backing storage; `len` is the number of
/// meaningful bytes: the requested transfer size before submission, the
/// transferred count after completion.
pub struct IoBuf {
    data: Box<[u8]>,
    len: usize,
}

impl IoBuf {
    /// An empty buffer for operations that carry no data (connect, accept).
    pub fn empty() -> Self {
        Self {
            data: Box::new([]),
            len: 0,
        }
    }

    /// A zeroed buffer of `capacity` bytes, `len == capacity`.
    /// Used for receive-side operations.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: capacity,
        }
    }

    /// A buffer holding a copy of `bytes`. Used for send-side operations.
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            len: bytes.len(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The meaningful bytes (`..len`).
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len.min(self.data.len())]
    }

    /// Record the transferred count. Capped at capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

/// The completion hook: invoked once by the service after `result` and
/// `error` are written, on the thread that drained the completion.
pub type Hook = Box<dyn FnOnce(ErrorCode, Box<IoReq>) + Send>;

/// An I/O request record.
pub struct IoReq {
    /// Target handle.
    pub handle: Handle,
    /// Data buffer, owned by the record.
    pub buf: IoBuf,
    /// Socket address storage, large enough for IPv6. Written by the
    /// submitter for connect/send_to, by the kernel for accept/recv_from.
    pub remote_addr: libc::sockaddr_storage,
    /// Length of the meaningful portion of `remote_addr`.
    pub addr_len: libc::socklen_t,
    /// File offset for positioned reads and writes.
    pub offset: u64,
    /// Transferred byte count, or the accepted handle for accept.
    pub result: i64,
    /// Completion status.
    pub error: ErrorCode,
    hook: Option<Hook>,
    /// Message header plumbing for datagram operations. The service wires
    /// the internal pointers once the record has its final heap address.
    pub msg: libc::msghdr,
    pub iov: libc::iovec,
}

// The msghdr/iovec pointers only ever reference the record's own fields
// and its owned buffer, which move with the box.
unsafe impl Send for IoReq {}

impl IoReq {
    /// Build a record targeting `handle` with the given completion hook.
    pub fn new(handle: Handle, hook: Hook) -> Box<Self> {
        Box::new(Self {
            handle,
            buf: IoBuf::empty(),
            remote_addr: unsafe { std::mem::zeroed() },
            addr_len: 0,
            offset: 0,
            result: 0,
            error: ErrorCode::Ok,
            hook: Some(hook),
            msg: unsafe { std::mem::zeroed() },
            iov: unsafe { std::mem::zeroed() },
        })
    }

    /// Take the hook. Returns `None` on the second and later calls, which
    /// is what keeps the hook one-shot.
    #[inline]
    pub fn take_hook(&mut self) -> Option<Hook> {
        self.hook.take()
    }

    /// Deliver a completion: set `error`/`result` and run the hook.
    /// No-op if the hook already ran.
    pub fn complete(mut self: Box<Self>, error: ErrorCode) {
        self.error = error;
        if let Some(hook) = self.take_hook() {
            hook(error, self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_buf_copy_from() {
        let buf = IoBuf::copy_from(b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.capacity(), 5);
        assert_eq!(buf.bytes(), b"hello");
    }

    #[test]
    fn test_buf_set_len_caps_at_capacity() {
        let mut buf = IoBuf::with_capacity(4);
        buf.set_len(100);
        assert_eq!(buf.len(), 4);
        buf.set_len(2);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_hook_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let req = IoReq::new(
            Handle::from_raw(7),
            Box::new(move |ec, req| {
                assert_eq!(ec, ErrorCode::Cancelled);
                assert_eq!(req.error, ErrorCode::Cancelled);
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        req.complete(ErrorCode::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
