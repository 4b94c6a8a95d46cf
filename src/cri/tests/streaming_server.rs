//! End-to-end tests: the real HTTP listener over TCP, a client-side SPDY
//! connection opening sub-streams, and a recording runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use berth_core::config::StreamingConfig;
use berth_core::error::{BerthError, Result};
use berth_cri::metrics::StreamingMetrics;
use berth_cri::server::StreamingListener;
use berth_cri::streaming::spdy::{self, Connection, ConnectionOptions, Role};
use berth_cri::streaming::{
    DuplexStream, ExecRequest, PortForwardRequest, Runtime, Stdio, StreamingServer,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingRuntime {
    execs: Mutex<Vec<(String, Vec<String>)>>,
    forwards: Mutex<Vec<(String, u16)>>,
    /// Sessions with stdin stay running until released.
    release: Notify,
}

#[async_trait]
impl Runtime for RecordingRuntime {
    async fn exec(&self, container_id: &str, cmd: &[String], stdio: Stdio) -> Result<i32> {
        self.execs
            .lock()
            .push((container_id.to_string(), cmd.to_vec()));
        let Stdio { stdin, stdout, .. } = stdio;
        if let Some(mut stdout) = stdout {
            stdout.write_all(b"out").await?;
        }
        if stdin.is_some() {
            self.release.notified().await;
        }
        Ok(0)
    }

    async fn attach(&self, container_id: &str, _stdio: Stdio) -> Result<()> {
        Err(BerthError::runtime(container_id, "not running"))
    }

    /// Greets with the port, then waits for the client to hang up.
    async fn port_forward(
        &self,
        pod_sandbox_id: &str,
        port: u16,
        stream: &mut dyn DuplexStream,
    ) -> Result<()> {
        self.forwards.lock().push((pod_sandbox_id.to_string(), port));
        stream.write_all(format!("port {}", port).as_bytes()).await?;
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await?;
        Ok(())
    }
}

struct Harness {
    server: Arc<StreamingServer>,
    runtime: Arc<RecordingRuntime>,
    addr: SocketAddr,
}

async fn start(config: StreamingConfig) -> Harness {
    let runtime = Arc::new(RecordingRuntime::default());
    let server = Arc::new(
        StreamingServer::new(
            config,
            runtime.clone(),
            Arc::new(StreamingMetrics::new().unwrap()),
        )
        .unwrap(),
    );
    let listener = StreamingListener::bind_addr(server.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.serve(std::future::pending()));
    Harness {
        server,
        runtime,
        addr,
    }
}

fn path_of(url: &str) -> String {
    let rest = url.splitn(4, '/').nth(3).unwrap();
    format!("/{}", rest)
}

/// Send a raw HTTP request and read the response head. The socket is left
/// positioned at the first byte after the head.
async fn raw_request(addr: SocketAddr, path: &str, extra: &[(&str, &str)]) -> (u16, String, TcpStream) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n", path);
    for (name, value) in extra {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        socket.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    (status, head.to_ascii_lowercase(), socket)
}

async fn spdy_upgrade(addr: SocketAddr, path: &str, protocol: &str) -> Connection {
    let (status, head, socket) = raw_request(
        addr,
        path,
        &[
            ("Connection", "Upgrade"),
            ("Upgrade", "SPDY/3.1"),
            ("X-Stream-Protocol-Version", protocol),
        ],
    )
    .await;
    assert_eq!(status, 101, "{}", head);
    assert!(head.contains(&format!("x-stream-protocol-version: {}", protocol)));
    let (conn, _incoming) = Connection::new(socket, Role::Client, ConnectionOptions::default()).unwrap();
    conn
}

fn stream_headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    headers
}

async fn open(conn: &Connection, pairs: &[(&'static str, &str)]) -> spdy::Stream {
    tokio::time::timeout(WAIT, conn.open_stream(stream_headers(pairs)))
        .await
        .unwrap()
        .unwrap()
}

async fn read_all(stream: &mut spdy::Stream) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(out).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn exec_request() -> ExecRequest {
    ExecRequest {
        container_id: "c1".to_string(),
        cmd: vec!["ls".to_string(), "-l".to_string()],
        tty: false,
        stdin: false,
        stdout: true,
        stderr: true,
    }
}

#[tokio::test]
async fn test_exec_runs_once_all_streams_arrive() {
    let h = start(StreamingConfig::default()).await;
    let url = h.server.get_exec(exec_request()).unwrap().url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "v4.channel.k8s.io").await;

    let mut error = open(&conn, &[("streamtype", "error")]).await;
    let mut stdout = open(&conn, &[("streamtype", "stdout")]).await;
    let _stderr = open(&conn, &[("streamtype", "stderr")]).await;

    assert_eq!(read_all(&mut stdout).await, "out");
    let status = read_all(&mut error).await;
    assert!(status.contains("\"status\":\"Success\""), "{}", status);
    assert_eq!(
        *h.runtime.execs.lock(),
        vec![("c1".to_string(), vec!["ls".to_string(), "-l".to_string()])]
    );
}

#[tokio::test]
async fn test_exec_not_started_with_missing_streams() {
    let h = start(StreamingConfig {
        stream_creation_timeout_secs: 1,
        ..Default::default()
    })
    .await;
    let url = h.server.get_exec(exec_request()).unwrap().url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "v4.channel.k8s.io").await;

    let _error = open(&conn, &[("streamtype", "error")]).await;
    let _stdout = open(&conn, &[("streamtype", "stdout")]).await;

    tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
    assert!(h.runtime.execs.lock().is_empty());
}

#[tokio::test]
async fn test_exec_v1_protocol_fallback_writes_nothing_on_success() {
    let h = start(StreamingConfig::default()).await;
    let url = h.server.get_exec(exec_request()).unwrap().url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "channel.k8s.io").await;

    let mut error = open(&conn, &[("streamtype", "error")]).await;
    let mut stdout = open(&conn, &[("streamtype", "stdout")]).await;
    let _stderr = open(&conn, &[("streamtype", "stderr")]).await;

    assert_eq!(read_all(&mut stdout).await, "out");
    assert_eq!(read_all(&mut error).await, "");
}

#[tokio::test]
async fn test_exec_v1_closes_stdin_from_server_side() {
    let h = start(StreamingConfig::default()).await;
    let url = h
        .server
        .get_exec(ExecRequest {
            stdin: true,
            ..exec_request()
        })
        .unwrap()
        .url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "channel.k8s.io").await;

    let _error = open(&conn, &[("streamtype", "error")]).await;
    let mut stdin = open(&conn, &[("streamtype", "stdin")]).await;
    let mut stdout = open(&conn, &[("streamtype", "stdout")]).await;
    let _stderr = open(&conn, &[("streamtype", "stderr")]).await;

    // The command is still running, yet stdin is already half-closed.
    assert_eq!(read_all(&mut stdin).await, "");
    eventually(|| h.runtime.execs.lock().len() == 1).await;

    h.runtime.release.notify_one();
    assert_eq!(read_all(&mut stdout).await, "out");
}

#[tokio::test]
async fn test_exec_v2_keeps_stdin_open() {
    let h = start(StreamingConfig::default()).await;
    let url = h
        .server
        .get_exec(ExecRequest {
            stdin: true,
            ..exec_request()
        })
        .unwrap()
        .url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "v2.channel.k8s.io").await;

    let mut error = open(&conn, &[("streamtype", "error")]).await;
    let mut stdin = open(&conn, &[("streamtype", "stdin")]).await;
    let mut stdout = open(&conn, &[("streamtype", "stdout")]).await;
    let _stderr = open(&conn, &[("streamtype", "stderr")]).await;

    eventually(|| h.runtime.execs.lock().len() == 1).await;
    let mut buf = [0u8; 16];
    let pending = tokio::time::timeout(Duration::from_millis(300), stdin.read(&mut buf)).await;
    assert!(pending.is_err(), "stdin was closed while the command ran");

    h.runtime.release.notify_one();
    assert_eq!(read_all(&mut stdout).await, "out");
    assert_eq!(read_all(&mut error).await, "");
}

fn port_forward_headers(kind: &'static str, port: &'static str, request: &'static str) -> Vec<(&'static str, &'static str)> {
    vec![("streamtype", kind), ("port", port), ("requestid", request)]
}

async fn read_chunk(stream: &mut spdy::Stream) -> String {
    let mut buf = vec![0u8; 512];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[tokio::test]
async fn test_port_forward_pairs_are_independent() {
    let h = start(StreamingConfig::default()).await;
    let url = h
        .server
        .get_port_forward(PortForwardRequest {
            pod_sandbox_id: "sb-1".to_string(),
            port: vec![],
        })
        .unwrap()
        .url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "portforward.k8s.io").await;

    let mut error1 = open(&conn, &port_forward_headers("error", "80", "1")).await;
    let mut data1 = open(&conn, &port_forward_headers("data", "80", "1")).await;
    let mut error2 = open(&conn, &port_forward_headers("error", "443", "2")).await;
    let mut data2 = open(&conn, &port_forward_headers("data", "443", "2")).await;

    assert_eq!(read_chunk(&mut data1).await, "port 80");
    assert_eq!(read_chunk(&mut data2).await, "port 443");

    // A second data stream for request 1 while it is still forwarding.
    let _duplicate = open(&conn, &port_forward_headers("data", "80", "1")).await;
    let message = read_chunk(&mut error1).await;
    assert_eq!(
        message,
        "error processing stream for request 1: data stream already assigned"
    );

    // Pair 2 finishes cleanly with nothing on its error stream.
    data2.shutdown().await.unwrap();
    assert_eq!(read_all(&mut error2).await, "");

    let mut forwards = h.runtime.forwards.lock().clone();
    forwards.sort();
    assert_eq!(
        forwards,
        vec![("sb-1".to_string(), 80), ("sb-1".to_string(), 443)]
    );
}

#[tokio::test]
async fn test_port_forward_rejects_invalid_stream_headers() {
    let h = start(StreamingConfig::default()).await;
    let url = h
        .server
        .get_port_forward(PortForwardRequest {
            pod_sandbox_id: "sb-1".to_string(),
            port: vec![80],
        })
        .unwrap()
        .url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "portforward.k8s.io").await;

    let rejected = tokio::time::timeout(
        WAIT,
        conn.open_stream(stream_headers(&[("streamtype", "data"), ("port", "0")])),
    )
    .await
    .unwrap();
    assert!(rejected.is_err());
    assert!(h.runtime.forwards.lock().is_empty());
}

#[tokio::test]
async fn test_port_forward_close_before_pair_completes() {
    let h = start(StreamingConfig::default()).await;
    let url = h
        .server
        .get_port_forward(PortForwardRequest {
            pod_sandbox_id: "sb-1".to_string(),
            port: vec![8080],
        })
        .unwrap()
        .url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "portforward.k8s.io").await;

    let _data = open(&conn, &port_forward_headers("data", "8080", "7")).await;
    conn.close().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.runtime.forwards.lock().is_empty());
    eventually(|| {
        h.server
            .metrics()
            .render()
            .unwrap()
            .contains("berth_streaming_active_sessions{method=\"portforward\"} 0")
    })
    .await;
}

#[tokio::test]
async fn test_port_forward_incomplete_pair_times_out() {
    let h = start(StreamingConfig {
        stream_creation_timeout_secs: 1,
        ..Default::default()
    })
    .await;
    let url = h
        .server
        .get_port_forward(PortForwardRequest {
            pod_sandbox_id: "sb-1".to_string(),
            port: vec![80],
        })
        .unwrap()
        .url;
    let conn = spdy_upgrade(h.addr, &path_of(&url), "portforward.k8s.io").await;

    let mut error = open(&conn, &port_forward_headers("error", "80", "9")).await;
    assert_eq!(
        read_chunk(&mut error).await,
        "(conn=sb-1, request=9) timed out waiting for streams"
    );
    assert!(h.runtime.forwards.lock().is_empty());

    // The timed-out pair is gone: the same request id starts afresh.
    let mut error = open(&conn, &port_forward_headers("error", "80", "9")).await;
    let mut data = open(&conn, &port_forward_headers("data", "80", "9")).await;
    assert_eq!(read_chunk(&mut data).await, "port 80");
    data.shutdown().await.unwrap();
    assert_eq!(read_all(&mut error).await, "");
}

#[tokio::test]
async fn test_issued_url_under_base_path() {
    let h = start(StreamingConfig {
        base_url: Some("http://node-1:10250/cri/".to_string()),
        ..Default::default()
    })
    .await;

    // Issue over HTTP, then redeem the returned URL as-is.
    let body = r#"{"container_id":"c1","cmd":["ls","-l"],"stdout":true,"stderr":true}"#;
    let mut socket = TcpStream::connect(h.addr).await.unwrap();
    let request = format!(
        "POST /cri/exec HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, socket.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    let json = &response[response.find("\r\n\r\n").unwrap() + 4..];
    let issued: serde_json::Value = serde_json::from_str(json).unwrap();
    let url = issued["url"].as_str().unwrap();
    assert!(url.starts_with("http://node-1:10250/cri/exec/"), "{}", url);

    let conn = spdy_upgrade(h.addr, &path_of(url), "v4.channel.k8s.io").await;
    let mut error = open(&conn, &[("streamtype", "error")]).await;
    let mut stdout = open(&conn, &[("streamtype", "stdout")]).await;
    let _stderr = open(&conn, &[("streamtype", "stderr")]).await;
    assert_eq!(read_all(&mut stdout).await, "out");
    assert!(read_all(&mut error).await.contains("\"status\":\"Success\""));
}

#[tokio::test]
async fn test_unknown_token_is_not_found() {
    let h = start(StreamingConfig::default()).await;
    let (status, _, _) = raw_request(
        h.addr,
        "/exec/nope1234",
        &[("Connection", "Upgrade"), ("Upgrade", "SPDY/3.1")],
    )
    .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_token_is_single_use() {
    let h = start(StreamingConfig::default()).await;
    let url = h.server.get_exec(exec_request()).unwrap().url;

    let (status, _, _) = raw_request(h.addr, &path_of(&url), &[]).await;
    assert_eq!(status, 400);
    let (status, _, _) = raw_request(h.addr, &path_of(&url), &[]).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_negotiation_failure_is_forbidden() {
    let h = start(StreamingConfig::default()).await;
    let url = h.server.get_exec(exec_request()).unwrap().url;
    let (status, head, _) = raw_request(
        h.addr,
        &path_of(&url),
        &[
            ("Connection", "Upgrade"),
            ("Upgrade", "SPDY/3.1"),
            ("X-Stream-Protocol-Version", "v9.channel.k8s.io"),
        ],
    )
    .await;
    assert_eq!(status, 403);
    let offered: Vec<&str> = head
        .lines()
        .filter_map(|line| line.strip_prefix("x-accepted-stream-protocol-versions: "))
        .collect();
    assert_eq!(
        offered,
        vec![
            "v4.channel.k8s.io",
            "v3.channel.k8s.io",
            "v2.channel.k8s.io",
            "channel.k8s.io"
        ]
    );
}

#[tokio::test]
async fn test_cache_full_is_resource_exhausted() {
    let h = start(StreamingConfig {
        max_in_flight: 1,
        ..Default::default()
    })
    .await;
    h.server.get_exec(exec_request()).unwrap();
    let status = h.server.get_exec(exec_request()).unwrap_err();
    assert_eq!(status.code(), tonic::Code::ResourceExhausted);
}

#[tokio::test]
async fn test_exec_over_websocket() {
    let h = start(StreamingConfig::default()).await;
    let url = h.server.get_exec(exec_request()).unwrap().url;

    let socket = TcpStream::connect(h.addr).await.unwrap();
    let mut request = format!("ws://{}{}", h.addr, path_of(&url))
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        "v4.channel.k8s.io".parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::client_async(request, socket).await.unwrap();

    let mut stdout = Vec::new();
    let mut status = Vec::new();
    while let Ok(Some(Ok(message))) = tokio::time::timeout(WAIT, ws.next()).await {
        match message {
            Message::Binary(data) if !data.is_empty() => match data[0] {
                1 => stdout.extend_from_slice(&data[1..]),
                3 => status.extend_from_slice(&data[1..]),
                _ => {}
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = ws.close(None).await;

    assert_eq!(stdout, b"out");
    assert!(String::from_utf8(status).unwrap().contains("\"status\":\"Success\""));
    assert_eq!(h.runtime.execs.lock().len(), 1);
}
