//! io_uring backend for the I/O service.
//!
//! One `IoUring` instance per service. Requests are staged on a
//! lock-free queue so any thread can submit; the polling thread drains
//! the staging queue into SQEs, kicks the kernel, and reaps CQEs. Each
//! in-flight record sits in a slab whose index doubles as the SQE
//! `user_data`, so a completion routes to its record without any lookup
//! table.
//!
//! Cross-thread wake-up is an eventfd: `notify()` writes the counter and
//! a pre-armed read SQE on the eventfd completes, which unblocks the
//! kernel wait. Multiple notifies before the read completes coalesce
//! (eventfd counter semantics).
//!
//! Hooks run after the ring lock is released, so a hook is free to stage
//! new submissions or request cancellation without re-entering the ring.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, squeue, types, IoUring};

use corio_core::{cio_warn, ErrorCode, Handle, IoReq, IoResult};

/// `user_data` tag for the eventfd wake-up read.
const NOTIFY_TAG: u64 = u64::MAX;
/// `user_data` tag for cancel SQEs; their completions carry no record.
const CANCEL_TAG: u64 = u64::MAX - 1;

/// Staging queue capacity relative to the ring size.
const STAGING_FACTOR: usize = 4;

/// The operation an SQE encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Accept,
    Connect,
    Send,
    Receive,
    SendTo,
    ReceiveFrom,
    ReadAt,
    WriteAt,
}

enum Pending {
    Op(OpKind, Box<IoReq>),
    CancelAll(Handle),
}

type Completed = (ErrorCode, Box<IoReq>);

/// In-flight records, indexed by SQE `user_data`.
struct Slab {
    slots: Vec<Option<(OpKind, Box<IoReq>)>>,
    free: Vec<usize>,
}

impl Slab {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    fn insert(&mut self, kind: OpKind, req: Box<IoReq>) -> usize {
        // The soft cap may be exceeded; grow rather than refuse.
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[idx] = Some((kind, req));
        idx
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut (OpKind, Box<IoReq>)> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn take(&mut self, idx: usize) -> Option<(OpKind, Box<IoReq>)> {
        let entry = self.slots.get_mut(idx)?.take();
        if entry.is_some() {
            self.free.push(idx);
        }
        entry
    }

    fn occupied(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    fn matching(&self, handle: Handle) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Some((_, req)) if req.handle == handle => Some(i),
                _ => None,
            })
            .collect()
    }
}

struct RingState {
    ring: IoUring,
    slab: Slab,
    notify_armed: bool,
    /// Landing pad for the eventfd read; lives as long as the service.
    notify_buf: Box<u64>,
}

pub(crate) struct UringService {
    state: Mutex<RingState>,
    staged: ArrayQueue<Pending>,
    wake_fd: RawFd,
    inflight: AtomicUsize,
}

impl UringService {
    pub(crate) fn new(max_inflight: u32) -> IoResult<Self> {
        let entries = max_inflight.max(8).next_power_of_two();
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| ErrorCode::from_errno(e.raw_os_error().unwrap_or(libc::EINVAL)))?;

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            return Err(ErrorCode::last_os_error());
        }

        Ok(Self {
            state: Mutex::new(RingState {
                ring,
                slab: Slab::new(entries as usize),
                notify_armed: false,
                notify_buf: Box::new(0),
            }),
            staged: ArrayQueue::new((entries as usize) * STAGING_FACTOR),
            wake_fd,
            inflight: AtomicUsize::new(0),
        })
    }

    /// Queue a request. Never blocks; failures complete inline.
    pub(crate) fn submit(&self, kind: OpKind, req: Box<IoReq>) {
        if !req.handle.is_valid() {
            req.complete(ErrorCode::InvalidArgument);
            return;
        }
        self.inflight.fetch_add(1, Ordering::Acquire);
        if let Err(rejected) = self.staged.push(Pending::Op(kind, req)) {
            self.inflight.fetch_sub(1, Ordering::Release);
            if let Pending::Op(_, req) = rejected {
                req.complete(ErrorCode::WouldBlock);
            }
        }
    }

    /// Request cancellation of everything in flight on `handle`.
    pub(crate) fn cancel(&self, handle: Handle) {
        if self.staged.push(Pending::CancelAll(handle)).is_err() {
            cio_warn!("io service: staging queue full, cancel request dropped");
        }
    }

    /// Cancel everything in flight on `handle` and run the hooks before
    /// returning. The wrappers' close paths call this so the descriptor
    /// is released only after its outstanding requests have completed;
    /// all cancels are resolved to ring indices while the descriptor is
    /// still owned, so a reused fd number can never be targeted.
    pub(crate) fn drain(&self, handle: Handle) {
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            // Kick a poller that may be parked holding the ring lock.
            self.notify();

            let mut completed: Vec<Completed> = Vec::new();
            let remaining;
            {
                let mut guard = self.state.lock().unwrap();
                let st = &mut *guard;

                // Staged work first, so requests (and staged cancels) on
                // this handle are visible in the slab.
                flush_staged(&self.staged, &self.inflight, st, &mut completed);
                let pending = st.slab.matching(handle);
                if pending.is_empty() {
                    remaining = 0;
                } else {
                    for idx in pending {
                        let sqe = opcode::AsyncCancel::new(idx as u64)
                            .build()
                            .user_data(CANCEL_TAG);
                        let _ = push_sqe(st, sqe);
                    }
                    let _ = wait(st, Some(Duration::from_millis(10)));
                    reap(&self.inflight, st, &mut completed);
                    remaining = st.slab.matching(handle).len();
                }
            }
            for (ec, req) in completed {
                req.complete(ec);
            }

            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                // Leave the stragglers in the slab: their slots stay
                // reserved, so a late completion still routes to its own
                // record instead of a recycled one.
                cio_warn!(
                    "io service: {} requests on closing handle did not cancel in time",
                    remaining
                );
                return;
            }
        }
    }

    pub(crate) fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated: a wake is already
        // pending, which is all a notify has to guarantee.
        let _ = ret;
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn poll(&self, timeout: Option<Duration>) -> IoResult<usize> {
        let mut completed: Vec<Completed> = Vec::new();
        let mut fatal = None;
        {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;

            flush_staged(&self.staged, &self.inflight, st, &mut completed);
            if let Err(e) = submit_now(st) {
                fatal = Some(e);
            }
            reap(&self.inflight, st, &mut completed);

            let drain_only = matches!(timeout, Some(d) if d.is_zero());
            if fatal.is_none() && completed.is_empty() && !drain_only {
                arm_notify(self.wake_fd, st);
                if let Err(e) = wait(st, timeout) {
                    fatal = Some(e);
                }
                reap(&self.inflight, st, &mut completed);
            }
        }

        // Hooks run outside the ring lock so they can stage follow-up
        // submissions, and they run even when the kernel wait failed.
        let n = completed.len();
        for (ec, req) in completed {
            req.complete(ec);
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(n),
        }
    }
}

impl Drop for UringService {
    fn drop(&mut self) {
        // Orderly drain: every in-flight record still gets its one hook
        // invocation, carrying Cancelled unless the kernel raced ahead.
        let mut completed: Vec<Completed> = Vec::new();
        {
            let st = self.state.get_mut().unwrap();
            // Staged-but-never-submitted requests are cancelled outright.
            while let Some(p) = self.staged.pop() {
                match p {
                    Pending::Op(_, req) => {
                        self.inflight.fetch_sub(1, Ordering::Release);
                        completed.push((ErrorCode::Cancelled, req));
                    }
                    Pending::CancelAll(_) => {}
                }
            }

            for idx in st.slab.occupied() {
                let sqe = opcode::AsyncCancel::new(idx as u64)
                    .build()
                    .user_data(CANCEL_TAG);
                let _ = push_sqe(st, sqe);
            }

            let deadline = Instant::now() + Duration::from_secs(1);
            while !st.slab.occupied().is_empty() && Instant::now() < deadline {
                let _ = wait(st, Some(Duration::from_millis(10)));
                reap(&self.inflight, st, &mut completed);
            }

            // Anything the kernel would not give back is handed over as
            // cancelled so no hook is ever lost.
            for idx in st.slab.occupied() {
                if let Some((_, req)) = st.slab.take(idx) {
                    self.inflight.fetch_sub(1, Ordering::Release);
                    completed.push((ErrorCode::Cancelled, req));
                }
            }
        }
        for (ec, req) in completed {
            req.complete(ec);
        }
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}

/// Move staged requests into the submission queue.
fn flush_staged(
    staged: &ArrayQueue<Pending>,
    inflight: &AtomicUsize,
    st: &mut RingState,
    completed: &mut Vec<Completed>,
) {
    while let Some(pending) = staged.pop() {
        match pending {
            Pending::Op(kind, req) => {
                let idx = st.slab.insert(kind, req);
                let sqe = {
                    let (_, req) = st.slab.get_mut(idx).unwrap();
                    build_sqe(kind, req, idx as u64)
                };
                if let Err(ec) = push_sqe(st, sqe) {
                    let (_, req) = st.slab.take(idx).unwrap();
                    inflight.fetch_sub(1, Ordering::Release);
                    completed.push((ec, req));
                }
            }
            Pending::CancelAll(handle) => {
                for idx in st.slab.matching(handle) {
                    let sqe = opcode::AsyncCancel::new(idx as u64)
                        .build()
                        .user_data(CANCEL_TAG);
                    // Best-effort: a full queue just means the operation
                    // runs to its natural completion.
                    let _ = push_sqe(st, sqe);
                }
            }
        }
    }
}

/// Build the SQE for a staged record. The record is boxed and already in
/// the slab, so every pointer handed to the kernel stays stable until
/// the completion is reaped.
fn build_sqe(kind: OpKind, req: &mut IoReq, user_data: u64) -> squeue::Entry {
    let fd = types::Fd(req.handle.raw());

    let sqe = match kind {
        OpKind::Accept => {
            req.addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            opcode::Accept::new(
                fd,
                &mut req.remote_addr as *mut _ as *mut libc::sockaddr,
                &mut req.addr_len as *mut libc::socklen_t,
            )
            .flags(libc::SOCK_CLOEXEC)
            .build()
        }
        OpKind::Connect => opcode::Connect::new(
            fd,
            &req.remote_addr as *const _ as *const libc::sockaddr,
            req.addr_len,
        )
        .build(),
        OpKind::Send => opcode::Send::new(fd, req.buf.as_ptr(), req.buf.len() as u32).build(),
        OpKind::Receive => {
            opcode::Recv::new(fd, req.buf.as_mut_ptr(), req.buf.len() as u32).build()
        }
        OpKind::SendTo => {
            let name_len = req.addr_len;
            wire_msghdr(req, name_len);
            opcode::SendMsg::new(fd, &req.msg as *const libc::msghdr).build()
        }
        OpKind::ReceiveFrom => {
            wire_msghdr(
                req,
                std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            );
            opcode::RecvMsg::new(fd, &mut req.msg as *mut libc::msghdr).build()
        }
        OpKind::ReadAt => opcode::Read::new(fd, req.buf.as_mut_ptr(), req.buf.len() as u32)
            .offset(req.offset)
            .build(),
        OpKind::WriteAt => opcode::Write::new(fd, req.buf.as_ptr(), req.buf.len() as u32)
            .offset(req.offset)
            .build(),
    };

    sqe.user_data(user_data)
}

/// Point the record's msghdr/iovec at its own storage.
fn wire_msghdr(req: &mut IoReq, name_len: libc::socklen_t) {
    req.iov.iov_base = req.buf.as_mut_ptr() as *mut libc::c_void;
    req.iov.iov_len = req.buf.len();
    req.msg = unsafe { std::mem::zeroed() };
    req.msg.msg_name = &mut req.remote_addr as *mut _ as *mut libc::c_void;
    req.msg.msg_namelen = name_len;
    req.msg.msg_iov = &mut req.iov;
    req.msg.msg_iovlen = 1;
}

fn push_sqe(st: &mut RingState, sqe: squeue::Entry) -> Result<(), ErrorCode> {
    unsafe {
        if st.ring.submission().push(&sqe).is_ok() {
            return Ok(());
        }
    }
    // Submission queue full: kick the kernel and retry once.
    if let Err(e) = st.ring.submit() {
        if e.raw_os_error() != Some(libc::EINTR) && e.raw_os_error() != Some(libc::EBUSY) {
            return Err(ErrorCode::from_errno(e.raw_os_error().unwrap_or(libc::EIO)));
        }
    }
    unsafe { st.ring.submission().push(&sqe).map_err(|_| ErrorCode::WouldBlock) }
}

/// Non-blocking submit, making queued SQEs visible to the kernel.
fn submit_now(st: &mut RingState) -> IoResult<()> {
    match st.ring.submit() {
        Ok(_) => Ok(()),
        Err(e) => match e.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN) => Ok(()),
            Some(errno) => Err(ErrorCode::from_errno(errno)),
            None => Err(ErrorCode::System(libc::EIO)),
        },
    }
}

/// Submit and block for at least one completion, bounded by `timeout`.
fn wait(st: &mut RingState, timeout: Option<Duration>) -> IoResult<()> {
    let result = match timeout {
        None => st.ring.submit_and_wait(1),
        Some(d) => {
            let ts = types::Timespec::new().sec(d.as_secs()).nsec(d.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&ts);
            st.ring.submitter().submit_with_args(1, &args)
        }
    };
    match result {
        Ok(_) => Ok(()),
        Err(e) => match e.raw_os_error() {
            Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => Ok(()),
            Some(errno) => Err(ErrorCode::from_errno(errno)),
            None => Err(ErrorCode::System(libc::EIO)),
        },
    }
}

/// Queue the eventfd wake-up read if it is not already pending.
fn arm_notify(wake_fd: RawFd, st: &mut RingState) {
    if st.notify_armed {
        return;
    }
    let buf = &mut *st.notify_buf as *mut u64 as *mut u8;
    let sqe = opcode::Read::new(types::Fd(wake_fd), buf, std::mem::size_of::<u64>() as u32)
        .build()
        .user_data(NOTIFY_TAG);
    if push_sqe(st, sqe).is_ok() {
        st.notify_armed = true;
    }
}

/// Drain every available CQE into `completed`.
fn reap(inflight: &AtomicUsize, st: &mut RingState, completed: &mut Vec<Completed>) {
    let RingState {
        ring,
        slab,
        notify_armed,
        ..
    } = st;

    for cqe in ring.completion() {
        match cqe.user_data() {
            NOTIFY_TAG => {
                *notify_armed = false;
            }
            CANCEL_TAG => {}
            idx => {
                if let Some((kind, mut req)) = slab.take(idx as usize) {
                    inflight.fetch_sub(1, Ordering::Release);
                    let res = cqe.result();
                    let ec = ErrorCode::from_result(res);
                    if ec.is_ok() {
                        req.result = res as i64;
                        finalize(kind, &mut req, res as usize);
                    } else {
                        req.result = 0;
                        req.buf.set_len(0);
                    }
                    completed.push((ec, req));
                }
            }
        }
    }
}

/// Write the completion's byte count (and peer address length for
/// datagram receives) back into the record.
fn finalize(kind: OpKind, req: &mut IoReq, transferred: usize) {
    match kind {
        OpKind::Send
        | OpKind::Receive
        | OpKind::SendTo
        | OpKind::ReadAt
        | OpKind::WriteAt => {
            req.buf.set_len(transferred);
        }
        OpKind::ReceiveFrom => {
            req.buf.set_len(transferred);
            req.addr_len = req.msg.msg_namelen;
        }
        // Accept's result is the new handle; the kernel updated
        // addr_len in place through the pointer in the SQE.
        OpKind::Accept => {}
        OpKind::Connect => {}
    }
}

// All ring access is serialized by the state mutex; the staging queue
// and the eventfd are safe from any thread.
unsafe impl Send for UringService {}
unsafe impl Sync for UringService {}
