//! Async (tokio) variants of the transport, client and server.
//!
//! The protocol pipeline is shared with the blocking side; only the I/O
//! differs. Sessions run as tasks, and the client serializes calls through
//! a fair lock instead of a condition variable.

pub mod client;
pub mod connection;
pub mod server;

pub use self::client::{CallReplies, Client};
pub use self::connection::{AsyncStream, Connection};
pub use self::server::{listen, AsyncListener, ListenConfig};
