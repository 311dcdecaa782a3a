//! Ready-queue element and timer id types.

/// A ready continuation or posted task.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a deferred task, unique within its context.
///
/// Ids are handed out monotonically, so two timers with equal deadlines
/// fire in the order they were set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TimerId(pub u64);
