//! CRI streaming request and response shapes.
//!
//! These mirror the `runtime.v1` ExecRequest/AttachRequest/PortForwardRequest
//! messages the CRI gRPC handlers receive from kubelet.

use serde::{Deserialize, Serialize};

/// Request to run a command in a container with streamed stdio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecRequest {
    /// Target container.
    pub container_id: String,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Whether to allocate a TTY.
    pub tty: bool,
    /// Whether stdin is streamed.
    pub stdin: bool,
    /// Whether stdout is streamed.
    pub stdout: bool,
    /// Whether stderr is streamed.
    pub stderr: bool,
}

/// Request to attach to a running container's main process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachRequest {
    pub container_id: String,
    pub stdin: bool,
    pub tty: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Request to forward ports of a pod sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortForwardRequest {
    /// Target pod sandbox.
    pub pod_sandbox_id: String,
    /// Ports requested by the client (informational for SPDY sessions).
    pub port: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachResponse {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardResponse {
    pub url: String,
}

/// A pending request stored behind a token until the client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    Exec(ExecRequest),
    Attach(AttachRequest),
    PortForward(PortForwardRequest),
}

impl StreamRequest {
    /// URL path segment of the endpoint serving this request.
    pub fn method(&self) -> &'static str {
        match self {
            StreamRequest::Exec(_) => "exec",
            StreamRequest::Attach(_) => "attach",
            StreamRequest::PortForward(_) => "portforward",
        }
    }
}

/// Options shared by exec and attach sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl From<&ExecRequest> for StreamOptions {
    fn from(req: &ExecRequest) -> Self {
        Self {
            stdin: req.stdin,
            stdout: req.stdout,
            stderr: req.stderr,
            tty: req.tty,
        }
    }
}

impl From<&AttachRequest> for StreamOptions {
    fn from(req: &AttachRequest) -> Self {
        Self {
            stdin: req.stdin,
            stdout: req.stdout,
            stderr: req.stderr,
            tty: req.tty,
        }
    }
}
