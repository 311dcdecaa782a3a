//! TCP/UDP socket wrapper.
//!
//! A `Socket` owns one kernel descriptor; moving the socket moves
//! ownership and dropping it closes the descriptor. The asynchronous
//! operations allocate an I/O request, attach the completion callback,
//! and submit through the current context's service; the callback runs
//! on the reactor loop thread when the kernel reports the completion.
//!
//! Send-side data is copied into the request on submission and
//! receive-side data is surfaced to the callback as a borrowed slice, so
//! no caller buffer has to outlive the call.

use std::sync::Arc;

use corio_core::{ErrorCode, Handle, IoBuf, IoReq, IoResult};
use corio_runtime::context::ExecutionContext;
use corio_runtime::{callback_hook, tls};

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Which direction of a stream to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// A TCP or UDP socket.
pub struct Socket {
    handle: Handle,
    version: IpVersion,
    transport: Transport,
}

impl Socket {
    /// Open a fresh socket of the given family and transport.
    pub fn open(version: IpVersion, transport: Transport) -> IoResult<Self> {
        let family = match version {
            IpVersion::V4 => libc::AF_INET,
            IpVersion::V6 => libc::AF_INET6,
        };
        let ty = match transport {
            Transport::Tcp => libc::SOCK_STREAM,
            Transport::Udp => libc::SOCK_DGRAM,
        };
        let fd = unsafe { libc::socket(family, ty | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(ErrorCode::last_os_error());
        }
        Ok(Self {
            handle: Handle::from_raw(fd),
            version,
            transport,
        })
    }

    /// Wrap an already-open descriptor (accepted connections).
    pub(crate) fn from_handle(handle: Handle, version: IpVersion, transport: Transport) -> Self {
        Self {
            handle,
            version,
            transport,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_valid()
    }

    /// Bind to a local endpoint and register with the current service.
    pub fn bind(&self, endpoint: &Endpoint) -> IoResult<()> {
        let (storage, len) = endpoint.to_storage();
        let rc = unsafe {
            libc::bind(
                self.handle.raw(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if rc != 0 {
            return Err(ErrorCode::last_os_error());
        }
        // Registration is implicit for the uring service; outside a
        // context this is deferred to the first submission.
        let _ = tls::with_service(|service| service.relate(self.handle));
        Ok(())
    }

    /// The locally bound endpoint; resolves ephemeral ports.
    pub fn local_endpoint(&self) -> IoResult<Endpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.handle.raw(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(ErrorCode::last_os_error());
        }
        Endpoint::from_storage(&storage, len)
    }

    /// Set a socket option from raw bytes.
    pub fn set_option(&self, level: i32, option: i32, value: &[u8]) -> IoResult<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.handle.raw(),
                level,
                option,
                value.as_ptr() as *const libc::c_void,
                value.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(ErrorCode::last_os_error());
        }
        Ok(())
    }

    /// Read a socket option. The returned buffer is sized to the length
    /// the kernel reported, not a fixed-width copy.
    pub fn get_option(&self, level: i32, option: i32) -> IoResult<Vec<u8>> {
        let mut value = vec![0u8; 64];
        let mut len = value.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.handle.raw(),
                level,
                option,
                value.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(ErrorCode::last_os_error());
        }
        value.truncate(len as usize);
        Ok(value)
    }

    pub fn set_reuse_address(&self, on: bool) -> IoResult<()> {
        let value: i32 = on as i32;
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &value.to_ne_bytes())
    }

    /// Asynchronously connect to `endpoint`.
    pub fn connect(&self, endpoint: &Endpoint, cb: impl FnOnce(ErrorCode) + Send + 'static) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument),
        };
        let (storage, len) = endpoint.to_storage();
        let mut req = IoReq::new(self.handle, callback_hook(move |ec, _req| cb(ec)));
        req.remote_addr = storage;
        req.addr_len = len;
        ctx.service().connect(req);
    }

    /// Asynchronously send `data` on a connected socket. The callback
    /// receives the transferred count, which may be short.
    pub fn send(&self, data: &[u8], cb: impl FnOnce(ErrorCode, usize) + Send + 'static) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument, 0),
        };
        let mut req = IoReq::new(
            self.handle,
            callback_hook(move |ec, req| cb(ec, req.buf.len())),
        );
        req.buf = IoBuf::copy_from(data);
        ctx.service().send(req);
    }

    /// Asynchronously receive up to `max_len` bytes on a connected
    /// socket. An empty slice with `Ok` is end of stream.
    pub fn receive(&self, max_len: usize, cb: impl FnOnce(ErrorCode, &[u8]) + Send + 'static) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument, &[]),
        };
        let mut req = IoReq::new(
            self.handle,
            callback_hook(move |ec, req| cb(ec, req.buf.bytes())),
        );
        req.buf = IoBuf::with_capacity(max_len);
        ctx.service().receive(req);
    }

    /// Asynchronously send one datagram to `endpoint`.
    pub fn send_to(
        &self,
        data: &[u8],
        endpoint: &Endpoint,
        cb: impl FnOnce(ErrorCode, usize) + Send + 'static,
    ) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument, 0),
        };
        let (storage, len) = endpoint.to_storage();
        let mut req = IoReq::new(
            self.handle,
            callback_hook(move |ec, req| cb(ec, req.buf.len())),
        );
        req.buf = IoBuf::copy_from(data);
        req.remote_addr = storage;
        req.addr_len = len;
        ctx.service().send_to(req);
    }

    /// Asynchronously receive one datagram of up to `max_len` bytes. The
    /// callback receives the payload and the source endpoint.
    pub fn receive_from(
        &self,
        max_len: usize,
        cb: impl FnOnce(ErrorCode, &[u8], Option<Endpoint>) + Send + 'static,
    ) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument, &[], None),
        };
        let mut req = IoReq::new(
            self.handle,
            callback_hook(move |ec, req| {
                let peer = Endpoint::from_storage(&req.remote_addr, req.addr_len).ok();
                cb(ec, req.buf.bytes(), peer)
            }),
        );
        req.buf = IoBuf::with_capacity(max_len);
        ctx.service().receive_from(req);
    }

    /// Shut down one or both stream directions.
    pub fn shutdown(&self, how: ShutdownHow) -> IoResult<()> {
        let how = match how {
            ShutdownHow::Read => libc::SHUT_RD,
            ShutdownHow::Write => libc::SHUT_WR,
            ShutdownHow::Both => libc::SHUT_RDWR,
        };
        let rc = unsafe { libc::shutdown(self.handle.raw(), how) };
        if rc != 0 {
            return Err(ErrorCode::last_os_error());
        }
        Ok(())
    }

    /// Best-effort cancellation of every outstanding operation on this
    /// socket; they complete with `Cancelled` unless the kernel raced
    /// ahead.
    pub fn cancel(&self) {
        let _ = tls::with_service(|service| service.cancel(self.handle));
    }

    /// Cancel outstanding operations, run their hooks, then release the
    /// descriptor. The fd is only returned to the kernel once nothing in
    /// flight can complete against it, so a reused fd number can never
    /// receive this socket's completions. A second close is a no-op.
    pub fn close(&mut self) {
        if self.handle.is_valid() {
            let _ = tls::with_service(|service| service.drain(self.handle));
            unsafe {
                libc::close(self.handle.raw());
            }
            self.handle = Handle::INVALID;
        }
    }

    /// Helper for callers that share the socket across completion
    /// callbacks.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}
