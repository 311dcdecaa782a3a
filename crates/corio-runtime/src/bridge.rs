//! The completion bridge.
//!
//! Two canonical hooks turn a kernel completion into user-visible
//! control flow:
//!
//! - the **callback hook** runs a typed closure right on the polling
//!   thread and lets the request record (and the buffer it owns) die
//!   when the closure returns;
//! - the **resume hook** writes the outcome into a [`ResumeToken`] and
//!   re-posts a parked continuation onto the token's home context, for
//!   task frameworks that suspend across the submit.
//!
//! Exactly one of the two is attached to each request.

use std::sync::{Arc, Mutex};

use corio_core::{ErrorCode, Hook, IoReq, Task};

use crate::context::ExecutionContext;

struct ResumeState {
    outcome: Mutex<(ErrorCode, i64)>,
    continuation: Mutex<Option<Task>>,
    home: Arc<dyn ExecutionContext>,
}

/// A parked continuation plus slots for the completion outcome.
///
/// Built at suspension time, handed into the request's hook, read by the
/// continuation after it resumes on its home context.
#[derive(Clone)]
pub struct ResumeToken {
    state: Arc<ResumeState>,
}

impl ResumeToken {
    pub fn new(home: Arc<dyn ExecutionContext>, continuation: Task) -> Self {
        Self {
            state: Arc::new(ResumeState {
                outcome: Mutex::new((ErrorCode::Ok, 0)),
                continuation: Mutex::new(Some(continuation)),
                home,
            }),
        }
    }

    /// Completion status, valid once the continuation has resumed.
    pub fn error(&self) -> ErrorCode {
        self.state.outcome.lock().unwrap().0
    }

    /// Completion result, valid once the continuation has resumed.
    pub fn result(&self) -> i64 {
        self.state.outcome.lock().unwrap().1
    }
}

/// Hook that wakes a parked continuation on its home context.
///
/// The request record is released before the continuation runs; anything
/// the continuation still needs must live in the token or be captured by
/// the continuation itself.
pub fn resume_hook(token: ResumeToken) -> Hook {
    Box::new(move |error, req| {
        *token.state.outcome.lock().unwrap() = (error, req.result);
        drop(req);
        if let Some(task) = token.state.continuation.lock().unwrap().take() {
            token.state.home.post(task);
        }
    })
}

/// Hook that runs `cb` with the completed record, then releases it.
pub fn callback_hook(cb: impl FnOnce(ErrorCode, &mut IoReq) + Send + 'static) -> Hook {
    Box::new(move |error, mut req| {
        cb(error, &mut req);
    })
}
