//! # corio-core
//!
//! Core types for the corio completion-based I/O runtime.
//!
//! This crate is platform-agnostic apart from the `libc` types used for
//! socket addresses and errno values. All kernel-facing machinery lives
//! in `corio-runtime`.
//!
//! ## Modules
//!
//! - `error` - Portable completion error code and errno mapping
//! - `handle` - Raw descriptor newtype with an invalid sentinel
//! - `ioreq` - The I/O request record submitted to the service
//! - `ring_queue` - Bounded auto-growing FIFO for ready tasks
//! - `task` - Ready-queue element and timer id types
//! - `log` - Leveled stderr logging macros
//! - `env` - Environment variable parsing helpers

pub mod env;
pub mod error;
pub mod handle;
pub mod ioreq;
pub mod log;
pub mod ring_queue;
pub mod task;

// Re-exports for convenience
pub use error::{ErrorCode, IoResult};
pub use handle::Handle;
pub use ioreq::{Hook, IoBuf, IoReq};
pub use ring_queue::RingQueue;
pub use task::{Task, TimerId};
