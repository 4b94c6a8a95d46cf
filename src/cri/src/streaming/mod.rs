//! CRI streaming server for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. the gRPC call parks the request and returns a single-use URL
//! 2. the client connects to the URL and upgrades to a multiplexed stream
//!    protocol (SPDY/3.1 or the WebSocket channel protocol)

use std::sync::Arc;

use berth_core::config::StreamingConfig;

use crate::metrics::StreamingMetrics;

pub mod cache;
pub mod deadline;
pub mod httpstream;
mod pipe;
pub mod portforward;
pub mod remotecommand;
pub mod request;
pub mod runtime;
pub mod server;
pub mod spdy;
pub mod wsstream;

pub use cache::RequestCache;
pub use request::{
    AttachRequest, AttachResponse, ExecRequest, ExecResponse, PortForwardRequest,
    PortForwardResponse, StreamOptions, StreamRequest,
};
pub use runtime::{DuplexStream, Runtime, Stdio, TerminalSize};
pub use server::StreamingServer;

/// Collaborators shared by every upgraded session.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<StreamingConfig>,
    pub runtime: Arc<dyn Runtime>,
    pub metrics: Arc<StreamingMetrics>,
}
