//! SPDY/3.1 transport for kubectl-style streaming sessions.

pub mod connection;
mod dictionary;
pub mod frame;
pub mod upgrade;

pub use connection::{Connection, ConnectionOptions, Role, Stream, StreamFilter, StreamWriter};
pub use upgrade::{upgrade_response, PendingConnection, HEADER_SPDY31};
