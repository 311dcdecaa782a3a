//! Thread-local tracking of the current execution context.
//!
//! Each thread running inside a context's loop carries a pointer to that
//! context. Wrappers read it to reach the I/O service without threading a
//! handle through every call. Set on context entry, cleared on exit.

use std::cell::RefCell;
use std::sync::Arc;

use corio_core::{ErrorCode, IoResult};

use crate::context::ExecutionContext;
use crate::service::IoService;

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn ExecutionContext>>> = const { RefCell::new(None) };
}

/// Guard that restores the previous context on drop.
pub struct ContextGuard {
    prev: Option<Arc<dyn ExecutionContext>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = self.prev.take();
        });
    }
}

/// Make `ctx` the current context for this thread until the guard drops.
pub fn enter(ctx: Arc<dyn ExecutionContext>) -> ContextGuard {
    let prev = CURRENT.with(|cell| cell.borrow_mut().replace(ctx));
    ContextGuard { prev }
}

/// The current context, if this thread is inside one.
pub fn current() -> Option<Arc<dyn ExecutionContext>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Whether this thread is inside a running context.
pub fn is_attached() -> bool {
    CURRENT.with(|cell| cell.borrow().is_some())
}

/// Run `f` with the current context's service.
///
/// Fails with `InvalidArgument` when the calling thread is not inside a
/// running context, which is the detectable form of the programmer error.
pub fn with_service<R>(f: impl FnOnce(&IoService) -> R) -> IoResult<R> {
    match current() {
        Some(ctx) => Ok(f(ctx.service())),
        None => Err(ErrorCode::InvalidArgument),
    }
}
