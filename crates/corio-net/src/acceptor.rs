//! TCP acceptor.

use corio_core::{ErrorCode, Handle, IoReq, IoResult};
use corio_runtime::context::ExecutionContext;
use corio_runtime::{callback_hook, tls};

use crate::endpoint::Endpoint;
use crate::socket::{IpVersion, Socket, Transport};

/// A listening TCP socket producing accepted connections.
pub struct Acceptor {
    listener: Socket,
}

impl Acceptor {
    /// Open, bind, and listen in one step. Sets reuse-address first so
    /// restarting servers can rebind immediately.
    pub fn bind_and_listen(endpoint: &Endpoint) -> IoResult<Self> {
        let version = if endpoint.is_v6() {
            IpVersion::V6
        } else {
            IpVersion::V4
        };
        let listener = Socket::open(version, Transport::Tcp)?;
        listener.set_reuse_address(true)?;
        listener.bind(endpoint)?;
        if unsafe { libc::listen(listener.handle().raw(), libc::SOMAXCONN) } != 0 {
            return Err(ErrorCode::last_os_error());
        }
        Ok(Self { listener })
    }

    /// The bound endpoint; resolves ephemeral ports.
    pub fn local_endpoint(&self) -> IoResult<Endpoint> {
        self.listener.local_endpoint()
    }

    pub fn handle(&self) -> Handle {
        self.listener.handle()
    }

    /// Asynchronously accept one connection. On success the callback
    /// receives the connected socket and the peer endpoint; the socket is
    /// already usable with the same service.
    pub fn accept(
        &self,
        cb: impl FnOnce(ErrorCode, Option<Socket>, Option<Endpoint>) + Send + 'static,
    ) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument, None, None),
        };
        let version = self.listener.version();
        let req = IoReq::new(
            self.listener.handle(),
            callback_hook(move |ec, req| {
                if ec.is_ok() {
                    let socket = Socket::from_handle(
                        Handle::from_raw(req.result as i32),
                        version,
                        Transport::Tcp,
                    );
                    let peer = Endpoint::from_storage(&req.remote_addr, req.addr_len).ok();
                    cb(ec, Some(socket), peer)
                } else {
                    cb(ec, None, None)
                }
            }),
        );
        ctx.service().accept(self.listener.handle(), req);
    }

    /// Cancel outstanding accepts.
    pub fn cancel(&self) {
        self.listener.cancel();
    }

    /// Cancel and release the listening descriptor.
    pub fn close(&mut self) {
        self.listener.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use corio_runtime::Reactor;

    #[test]
    fn test_bind_resolves_ephemeral_port() {
        let acceptor = Acceptor::bind_and_listen(&Endpoint::parse("127.0.0.1:0").unwrap()).unwrap();
        let ep = acceptor.local_endpoint().unwrap();
        assert_ne!(ep.port(), 0);
    }

    #[test]
    fn test_cancelled_accept_reports_cancelled() {
        let reactor = Reactor::new().unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let hooks = Arc::new(AtomicUsize::new(0));

        let r = reactor.clone();
        let outcome2 = outcome.clone();
        let hooks2 = hooks.clone();
        reactor.post(Box::new(move || {
            let acceptor = Arc::new(
                Acceptor::bind_and_listen(&Endpoint::parse("127.0.0.1:0").unwrap()).unwrap(),
            );

            let keep = acceptor.clone();
            let stopper = r.clone();
            acceptor.accept(move |ec, conn, _peer| {
                assert!(conn.is_none());
                *outcome2.lock().unwrap() = Some(ec);
                hooks2.fetch_add(1, Ordering::SeqCst);
                stopper.stop();
                drop(keep);
            });

            let victim = acceptor.clone();
            r.set_timeout(
                std::time::Duration::from_millis(30),
                Box::new(move || victim.cancel()),
            );
        }));

        reactor.run().unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some(ErrorCode::Cancelled));
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }
}
