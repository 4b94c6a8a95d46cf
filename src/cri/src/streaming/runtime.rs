//! The container-side capability the streaming server drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use berth_core::error::Result;

/// Terminal dimensions sent by the client on the resize stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    #[serde(rename = "Width")]
    pub width: u16,
    #[serde(rename = "Height")]
    pub height: u16,
}

/// A bidirectional byte stream handed to `Runtime::port_forward`.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process stdio wired to the client's sub-streams.
///
/// A missing pipe means the client did not request that stream.
#[derive(Default)]
pub struct Stdio {
    pub stdin: Option<BoxReader>,
    pub stdout: Option<BoxWriter>,
    pub stderr: Option<BoxWriter>,
    pub tty: bool,
    /// Terminal size changes; closed when the client's resize stream ends.
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

impl std::fmt::Debug for Stdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stdio")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("tty", &self.tty)
            .field("resize", &self.resize.is_some())
            .finish()
    }
}

/// Executes commands, attaches to containers and forwards ports.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run `cmd` in the container and return its exit code.
    async fn exec(&self, container_id: &str, cmd: &[String], stdio: Stdio) -> Result<i32>;

    /// Attach to the container's main process until it or the client ends.
    async fn attach(&self, container_id: &str, stdio: Stdio) -> Result<()>;

    /// Copy bytes between `stream` and `port` inside the pod sandbox.
    async fn port_forward(
        &self,
        pod_sandbox_id: &str,
        port: u16,
        stream: &mut dyn DuplexStream,
    ) -> Result<()>;
}

/// Drain resize events into `on_resize` on a background task.
///
/// The task ends when the channel closes, so it never outlives the session
/// that owns the sender.
pub fn handle_resizing<F>(mut resize: mpsc::Receiver<TerminalSize>, mut on_resize: F) -> JoinHandle<()>
where
    F: FnMut(TerminalSize) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(size) = resize.recv().await {
            if size.width == 0 || size.height == 0 {
                continue;
            }
            on_resize(size);
        }
    })
}
