//! The execution context capability trait.
//!
//! A context is anything that can run posted tasks, keep timers, and hand
//! out its I/O service. There are exactly two implementations: the
//! single-threaded [`Reactor`](crate::Reactor) and the multi-threaded
//! [`ThreadPool`](crate::ThreadPool) (whose service is inert).

use std::time::Duration;

use corio_core::{Task, TimerId};

use crate::service::IoService;

/// Capability set of an execution context.
pub trait ExecutionContext: Send + Sync {
    /// Enqueue `task` on the ready queue. Callable from any thread;
    /// wakes the context if it is blocked.
    fn post(&self, task: Task);

    /// Run `task` inline when the caller is already on the context's
    /// execution thread, otherwise fall back to [`post`](Self::post).
    fn dispatch(&self, task: Task);

    /// Arm a timer. `delay == Duration::MAX` never fires and serves as a
    /// placeholder that only [`clear`](Self::clear) removes.
    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a timer. Unknown ids are a no-op.
    fn clear(&self, id: TimerId);

    /// The context's I/O service. Exclusive to this context; submitting
    /// through it while a different context is current is undefined.
    fn service(&self) -> &IoService;
}
