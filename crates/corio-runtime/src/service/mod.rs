//! The I/O service.
//!
//! The service is the only component that talks to the kernel's
//! asynchronous facility. It registers handles, submits requests, drains
//! completion events, and dispatches each event to the one hook that owns
//! it. Everything else in the runtime goes through this seam.
//!
//! Submission accepts requests in caller order and makes them visible to
//! the kernel no later than the next [`poll`](IoService::poll); the
//! service batches them into one kernel round trip. Failures the kernel
//! reports synchronously (bad handle, full queue) complete the request
//! inline, so every successful submit produces exactly one hook
//! invocation no matter which path the failure took.

use std::time::Duration;

use corio_core::{ErrorCode, Handle, IoReq, IoResult};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod uring;
        use uring::UringService;
        pub(crate) use uring::OpKind;
    } else {
        compile_error!("the corio I/O service requires io_uring; only Linux targets are supported");
    }
}

/// Proactor handle owned by an execution context.
///
/// A reactor context holds an enabled service; pool contexts hold a
/// disabled one whose submissions complete inline with
/// `InvalidArgument`.
pub struct IoService {
    backend: Option<UringService>,
}

impl IoService {
    /// Create a service over a fresh kernel completion queue.
    ///
    /// `max_inflight` is a soft cap: it sizes the submission queue, but
    /// the service queues excess submissions internally rather than
    /// deadlocking.
    pub fn new(max_inflight: u32) -> IoResult<Self> {
        Ok(Self {
            backend: Some(UringService::new(max_inflight)?),
        })
    }

    /// An inert service for contexts that do no I/O.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Register `handle` with the completion facility. Idempotent.
    /// io_uring needs no explicit registration, so this only validates
    /// that the service can do I/O at all.
    pub fn relate(&self, handle: Handle) -> IoResult<()> {
        if !handle.is_valid() {
            return Err(ErrorCode::InvalidArgument);
        }
        match &self.backend {
            Some(_) => Ok(()),
            None => Err(ErrorCode::InvalidArgument),
        }
    }

    /// Asynchronously accept one connection on `listener`. On completion
    /// `req.result` holds the accepted handle and `req.remote_addr` /
    /// `req.addr_len` the peer address.
    pub fn accept(&self, listener: Handle, mut req: Box<IoReq>) {
        req.handle = listener;
        self.submit(OpKind::Accept, req);
    }

    /// Connect `req.handle` to `req.remote_addr`.
    pub fn connect(&self, req: Box<IoReq>) {
        self.submit(OpKind::Connect, req);
    }

    /// Stream send. `req.buf.len()` on completion is the transferred
    /// count, which may be less than requested.
    pub fn send(&self, req: Box<IoReq>) {
        self.submit(OpKind::Send, req);
    }

    /// Stream receive. A zero-length `Ok` completion is end of stream.
    pub fn receive(&self, req: Box<IoReq>) {
        self.submit(OpKind::Receive, req);
    }

    /// Datagram send to `req.remote_addr`.
    pub fn send_to(&self, req: Box<IoReq>) {
        self.submit(OpKind::SendTo, req);
    }

    /// Datagram receive; fills `req.remote_addr` / `req.addr_len` with
    /// the source address.
    pub fn receive_from(&self, req: Box<IoReq>) {
        self.submit(OpKind::ReceiveFrom, req);
    }

    /// Positioned file read at `req.offset`.
    pub fn read_at(&self, req: Box<IoReq>) {
        self.submit(OpKind::ReadAt, req);
    }

    /// Positioned file write at `req.offset`.
    pub fn write_at(&self, req: Box<IoReq>) {
        self.submit(OpKind::WriteAt, req);
    }

    /// Best-effort cancellation of every outstanding request on
    /// `handle`. Requests that the kernel has not already finished
    /// complete with `Cancelled`.
    pub fn cancel(&self, handle: Handle) {
        if let Some(backend) = &self.backend {
            backend.cancel(handle);
        }
    }

    /// Synchronous form of [`cancel`](Self::cancel) for close paths:
    /// cancels everything outstanding on `handle` and invokes the hooks
    /// before returning, so the caller can release the descriptor
    /// without racing its own completions.
    pub fn drain(&self, handle: Handle) {
        if let Some(backend) = &self.backend {
            backend.drain(handle);
        }
    }

    /// Block until at least one completion has been dispatched, `timeout`
    /// elapses, or [`notify`](Self::notify) is called. Hooks run on the
    /// calling thread. Returns the number of requests dispatched.
    ///
    /// `None` blocks indefinitely; `Some(Duration::ZERO)` only drains
    /// what is already available.
    pub fn poll(&self, timeout: Option<Duration>) -> IoResult<usize> {
        match &self.backend {
            Some(backend) => backend.poll(timeout),
            None => Ok(0),
        }
    }

    /// Unblock an in-progress [`poll`](Self::poll) from any thread.
    pub fn notify(&self) {
        if let Some(backend) = &self.backend {
            backend.notify();
        }
    }

    /// Submitted-but-not-completed request count.
    pub fn inflight(&self) -> usize {
        match &self.backend {
            Some(backend) => backend.inflight(),
            None => 0,
        }
    }

    fn submit(&self, kind: OpKind, req: Box<IoReq>) {
        match &self.backend {
            Some(backend) => backend.submit(kind, req),
            None => req.complete(ErrorCode::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn drive_until(service: &IoService, done: &AtomicUsize, want: usize) {
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) >= want {
                return;
            }
            service.poll(Some(Duration::from_millis(50))).unwrap();
        }
        panic!("operations did not complete");
    }

    #[test]
    fn test_invalid_handle_completes_inline() {
        let service = IoService::new(8).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let req = IoReq::new(
            Handle::INVALID,
            Box::new(move |ec, _req| {
                assert_eq!(ec, ErrorCode::InvalidArgument);
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        service.receive(req);
        // Inline completion: the hook already ran, no poll needed.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.inflight(), 0);
    }

    #[test]
    fn test_disabled_service_completes_inline() {
        let service = IoService::disabled();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let req = IoReq::new(
            Handle::from_raw(0),
            Box::new(move |ec, _req| {
                assert_eq!(ec, ErrorCode::InvalidArgument);
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        service.send(req);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(service.relate(Handle::from_raw(0)).is_err());
    }

    #[test]
    fn test_poll_times_out() {
        let service = IoService::new(8).unwrap();
        let start = Instant::now();
        let n = service.poll(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_notify_unblocks_poll() {
        let service = Arc::new(IoService::new(8).unwrap());
        let service2 = service.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            service2.notify();
        });

        let start = Instant::now();
        let n = service.poll(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn test_file_read_roundtrip() {
        let path = std::env::temp_dir().join("corio-service-read-test");
        std::fs::write(&path, b"completion").unwrap();
        let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        assert!(fd >= 0);

        let service = IoService::new(8).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let mut req = IoReq::new(
            Handle::from_raw(fd),
            Box::new(move |ec, req| {
                assert_eq!(ec, ErrorCode::Ok);
                seen2.lock().unwrap().extend_from_slice(req.buf.bytes());
                done2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        req.buf = corio_core::IoBuf::with_capacity(32);
        req.offset = 0;
        service.read_at(req);

        drive_until(&service, &done, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), b"completion");

        unsafe { libc::close(fd) };
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_cancel_outstanding_receive() {
        // A UDP socket with no inbound traffic parks the receive forever;
        // cancel must complete it with Cancelled.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        assert!(fd >= 0);
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        addr.sin_port = 0;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let service = IoService::new(8).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();

        let mut req = IoReq::new(
            Handle::from_raw(fd),
            Box::new(move |ec, req| {
                assert_eq!(ec, ErrorCode::Cancelled);
                assert_eq!(req.buf.len(), 0);
                done2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        req.buf = corio_core::IoBuf::with_capacity(16);
        service.receive(req);

        // Let the submission reach the kernel, then cancel.
        service.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(service.inflight(), 1);
        service.cancel(Handle::from_raw(fd));

        drive_until(&service, &done, 1);
        assert_eq!(service.inflight(), 0);

        unsafe { libc::close(fd) };
    }
}
