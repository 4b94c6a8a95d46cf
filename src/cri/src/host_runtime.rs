//! Runtime backed by the local host, for running the streaming server
//! without a container engine behind it.
//!
//! Container and sandbox ids are only used in log and error messages:
//! commands run as host processes and ports are reached on loopback.

use std::io;
use std::process::Stdio as ProcessStdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use berth_core::error::{BerthError, Result};

use crate::streaming::runtime::{handle_resizing, BoxWriter, DuplexStream, Runtime, Stdio};

/// Runs exec sessions as host processes and forwards ports on loopback.
#[derive(Debug, Default, Clone)]
pub struct HostRuntime;

impl HostRuntime {
    pub fn new() -> Self {
        Self
    }
}

fn piped_if(wanted: bool) -> ProcessStdio {
    if wanted {
        ProcessStdio::piped()
    } else {
        ProcessStdio::null()
    }
}

async fn pump<R>(src: Option<R>, dst: Option<BoxWriter>)
where
    R: AsyncRead + Unpin,
{
    if let (Some(mut src), Some(mut dst)) = (src, dst) {
        if let Err(e) = tokio::io::copy(&mut src, &mut dst).await {
            debug!(error = %e, "output copy ended");
        }
        let _ = dst.shutdown().await;
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[async_trait]
impl Runtime for HostRuntime {
    async fn exec(&self, container_id: &str, cmd: &[String], stdio: Stdio) -> Result<i32> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| BerthError::InvalidArgument("command must not be empty".to_string()))?;
        let Stdio {
            stdin,
            stdout,
            stderr,
            tty,
            resize,
        } = stdio;

        // Host processes have no terminal to resize.
        let resizer = resize.map(|rx| {
            handle_resizing(rx, |size| {
                debug!(width = size.width, height = size.height, "ignoring terminal resize")
            })
        });

        let mut child = Command::new(program)
            .args(args)
            .stdin(piped_if(stdin.is_some()))
            .stdout(piped_if(stdout.is_some()))
            .stderr(piped_if(stderr.is_some()))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BerthError::runtime(container_id, e))?;
        debug!(container_id, program = %program, tty, "spawned host process");

        let stdin_copy = match (stdin, child.stdin.take()) {
            (Some(mut src), Some(mut dst)) => Some(tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut src, &mut dst).await {
                    debug!(error = %e, "stdin copy ended");
                }
            })),
            _ => None,
        };

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let (status, _, _) = tokio::join!(
            child.wait(),
            pump(child_stdout, stdout),
            pump(child_stderr, stderr),
        );

        if let Some(task) = stdin_copy {
            task.abort();
        }
        if let Some(task) = resizer {
            task.abort();
        }
        let status = status.map_err(|e| BerthError::runtime(container_id, e))?;
        Ok(exit_code(status))
    }

    async fn attach(&self, container_id: &str, _stdio: Stdio) -> Result<()> {
        Err(BerthError::runtime(
            container_id,
            "attach is not supported by the host runtime",
        ))
    }

    async fn port_forward(
        &self,
        pod_sandbox_id: &str,
        port: u16,
        stream: &mut dyn DuplexStream,
    ) -> Result<()> {
        let target = format!("pod {} port {}", pod_sandbox_id, port);
        let mut upstream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| BerthError::runtime(&target, e))?;

        match tokio::io::copy_bidirectional(stream, &mut upstream).await {
            Ok((sent, received)) => {
                debug!(peer = %target, sent, received, "port forward finished");
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(BerthError::runtime(&target, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_pipes_output_and_exit_code() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let stdio = Stdio {
            stdout: Some(Box::new(writer)),
            ..Default::default()
        };
        let cmd = vec!["sh".to_string(), "-c".to_string(), "echo hello; exit 3".to_string()];
        let code = HostRuntime::new().exec("host", &cmd, stdio).await.unwrap();
        assert_eq!(code, 3);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_feeds_stdin() {
        let (mut client_in, stdin) = tokio::io::duplex(1024);
        let (stdout, mut client_out) = tokio::io::duplex(1024);
        let stdio = Stdio {
            stdin: Some(Box::new(stdin)),
            stdout: Some(Box::new(stdout)),
            ..Default::default()
        };
        client_in.write_all(b"ping\n").await.unwrap();
        drop(client_in);

        let cmd = vec!["cat".to_string()];
        let code = HostRuntime::new().exec("host", &cmd, stdio).await.unwrap();
        assert_eq!(code, 0);

        let mut out = String::new();
        client_out.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ping\n");
    }

    #[tokio::test]
    async fn test_exec_rejects_empty_command() {
        let err = HostRuntime::new()
            .exec("host", &[], Stdio::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_attach_is_unsupported() {
        let err = HostRuntime::new()
            .attach("c1", Stdio::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("c1"));
    }

    #[tokio::test]
    async fn test_port_forward_copies_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (mut client, mut server_side) = tokio::io::duplex(1024);
        let forward = tokio::spawn(async move {
            HostRuntime::new()
                .port_forward("sb-1", port, &mut server_side)
                .await
        });

        client.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
        drop(client);
        forward.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_port_forward_connect_failure_names_target() {
        // Grab a free port, then close it so the connect is refused.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (_client, mut server_side) = tokio::io::duplex(64);
        let err = HostRuntime::new()
            .port_forward("sb-1", port, &mut server_side)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pod sb-1 port"));
    }
}
