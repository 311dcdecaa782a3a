//! # corio-runtime
//!
//! The I/O service and the execution contexts of the corio runtime.
//!
//! This crate provides:
//! - The completion-based I/O service over the kernel completion queue
//! - A single-threaded reactor context that owns a service
//! - A worker-pool context for CPU-bound tasks and timers
//! - The timer wheel shared by both contexts
//! - Thread-local tracking of the current context
//! - The completion bridge (canonical completion hooks)
//!
//! # Architecture
//!
//! ```text
//!   wrappers (corio-net, corio-fs)
//!        │ current_context().service()
//!        ▼
//!   ExecutionContext ──┬── Reactor (loop thread, owns IoService)
//!                      └── ThreadPool (N workers + timer thread, no I/O)
//!        │
//!        ▼
//!   IoService ── submit / poll / cancel / notify ──► kernel completion queue
//! ```

pub mod bridge;
pub mod config;
pub mod context;
pub mod pool;
pub mod reactor;
pub mod service;
pub mod timer;
pub mod tls;

// Re-exports for convenience
pub use bridge::{callback_hook, resume_hook, ResumeToken};
pub use config::RuntimeConfig;
pub use context::ExecutionContext;
pub use pool::ThreadPool;
pub use reactor::Reactor;
pub use service::IoService;
pub use timer::TimerWheel;
