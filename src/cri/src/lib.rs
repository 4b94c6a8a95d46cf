//! Berth CRI - Kubernetes CRI streaming server.
//!
//! Serves the exec, attach and port-forward endpoints that CRI
//! `GetExec`/`GetAttach`/`GetPortForward` calls hand out URLs for:
//! - Token cache → single-use URLs with a bounded lifetime
//! - Upgrade → SPDY/3.1 or WebSocket multiplexed sub-streams
//! - Runtime → the container-side capability sessions are wired to

pub mod error;
pub mod host_runtime;
pub mod metrics;
pub mod server;
pub mod streaming;
