//! # corio-net
//!
//! Socket, acceptor, and endpoint wrappers over the corio I/O service.
//!
//! The wrappers reach the service through the thread-local current
//! context, so they must be used from inside a running reactor. Each
//! asynchronous operation takes a completion callback which runs on the
//! reactor's loop thread.

pub mod acceptor;
pub mod endpoint;
pub mod socket;

pub use acceptor::Acceptor;
pub use endpoint::Endpoint;
pub use socket::{IpVersion, ShutdownHow, Socket, Transport};
