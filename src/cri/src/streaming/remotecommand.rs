//! Exec and attach sessions.
//!
//! After the upgrade, the client opens one sub-stream per requested stdio
//! channel plus an error stream (and a resize stream for terminals on v3+).
//! Once every expected stream has been acknowledged the runtime is invoked
//! with the bundle, and the outcome is reported on the error stream.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use http::header::HeaderMap;
use http::{Request, Response, StatusCode};
use hyper::Body;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::deadline::{with_deadline, Outcome};
use super::httpstream::{handshake, is_websocket_request, StreamType, STREAM_TYPE_HEADER};
use super::request::StreamOptions;
use super::runtime::{BoxReader, BoxWriter, Stdio, TerminalSize};
use super::spdy::{self, upgrade_response, ConnectionOptions};
use super::wsstream::{
    self, ChannelType, Encoding, WsConnection, BASE64_CHANNEL_PROTOCOL, CHANNEL_PROTOCOL,
    V4_BASE64_PROTOCOL, V4_BINARY_PROTOCOL,
};
use super::SessionContext;

pub const STREAM_PROTOCOL_V1_NAME: &str = "channel.k8s.io";
pub const STREAM_PROTOCOL_V2_NAME: &str = "v2.channel.k8s.io";
pub const STREAM_PROTOCOL_V3_NAME: &str = "v3.channel.k8s.io";
pub const STREAM_PROTOCOL_V4_NAME: &str = "v4.channel.k8s.io";

const RESIZE_QUEUE_DEPTH: usize = 16;

const WEBSOCKET_PROTOCOLS: &[(&str, Encoding)] = &[
    (V4_BINARY_PROTOCOL, Encoding::Binary),
    (V4_BASE64_PROTOCOL, Encoding::Base64),
    (CHANNEL_PROTOCOL, Encoding::Binary),
    (BASE64_CHANNEL_PROTOCOL, Encoding::Base64),
];

/// Remote-command protocol generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// Stdin is half-closed once streams are collected.
    V1,
    V2,
    /// Adds the resize stream for terminals.
    V3,
    /// Reports the outcome as a JSON status on the error stream.
    V4,
}

impl ProtocolVersion {
    /// Map a negotiated protocol name. No negotiation means v1.
    pub fn from_negotiated(protocol: Option<&str>) -> Option<Self> {
        match protocol.unwrap_or_default() {
            "" | STREAM_PROTOCOL_V1_NAME => Some(ProtocolVersion::V1),
            STREAM_PROTOCOL_V2_NAME => Some(ProtocolVersion::V2),
            STREAM_PROTOCOL_V3_NAME => Some(ProtocolVersion::V3),
            STREAM_PROTOCOL_V4_NAME => Some(ProtocolVersion::V4),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => STREAM_PROTOCOL_V1_NAME,
            ProtocolVersion::V2 => STREAM_PROTOCOL_V2_NAME,
            ProtocolVersion::V3 => STREAM_PROTOCOL_V3_NAME,
            ProtocolVersion::V4 => STREAM_PROTOCOL_V4_NAME,
        }
    }

    fn supports_resize(self) -> bool {
        self >= ProtocolVersion::V3
    }
}

/// Number of sub-streams the client must open: the error stream, each
/// requested stdio stream and, for terminals on v3+, the resize stream.
pub fn expected_streams(opts: &StreamOptions, version: ProtocolVersion) -> usize {
    1 + usize::from(opts.stdin)
        + usize::from(opts.stdout)
        + usize::from(opts.stderr)
        + usize::from(opts.tty && version.supports_resize())
}

/// What a session runs once its streams are in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Exec {
        container_id: String,
        cmd: Vec<String>,
    },
    Attach {
        container_id: String,
    },
}

impl RemoteCommand {
    pub fn method(&self) -> &'static str {
        match self {
            RemoteCommand::Exec { .. } => "exec",
            RemoteCommand::Attach { .. } => "attach",
        }
    }

    pub fn container_id(&self) -> &str {
        match self {
            RemoteCommand::Exec { container_id, .. } | RemoteCommand::Attach { container_id } => {
                container_id
            }
        }
    }
}

/// The pipes of one session, independent of transport.
#[derive(Default)]
pub struct StreamBundle {
    pub stdin: Option<BoxReader>,
    pub stdout: Option<BoxWriter>,
    pub stderr: Option<BoxWriter>,
    pub error: Option<BoxWriter>,
    pub resize: Option<BoxReader>,
}

/// The upgraded connection a session runs on.
pub enum SessionHandle {
    Spdy(spdy::Connection),
    WebSocket(WsConnection),
}

impl SessionHandle {
    pub async fn close(&self) {
        match self {
            SessionHandle::Spdy(conn) => conn.close().await,
            SessionHandle::WebSocket(conn) => conn.close().await,
        }
    }
}

/// Framing picked for an upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Spdy,
    WebSocket,
}

impl Transport {
    pub fn select(headers: &HeaderMap) -> Self {
        if is_websocket_request(headers) {
            Transport::WebSocket
        } else {
            Transport::Spdy
        }
    }
}

fn text_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

/// Upgrade `req` and run `command` on a background task.
///
/// Returns the response to send: 101 on success, otherwise the negotiation
/// or upgrade failure.
pub fn serve(
    ctx: SessionContext,
    req: Request<Body>,
    command: RemoteCommand,
    opts: StreamOptions,
) -> Response<Body> {
    match Transport::select(req.headers()) {
        Transport::Spdy => serve_spdy(ctx, req, command, opts),
        Transport::WebSocket => serve_websocket(ctx, req, command, opts),
    }
}

fn serve_spdy(
    ctx: SessionContext,
    mut req: Request<Body>,
    command: RemoteCommand,
    opts: StreamOptions,
) -> Response<Body> {
    let mut headers = HeaderMap::new();
    let negotiated = match handshake(
        req.headers(),
        &mut headers,
        &ctx.config.supported_remote_command_protocols,
    ) {
        Ok(negotiated) => negotiated,
        Err(e) => {
            debug!(error = %e, "remote command negotiation failed");
            return e.into_response();
        }
    };
    let Some(version) = ProtocolVersion::from_negotiated(negotiated.as_deref()) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported stream protocol {:?}", negotiated),
        );
    };

    let options = ConnectionOptions {
        idle_timeout: Some(ctx.config.stream_idle_timeout()),
        ping_period: ctx.config.ping_period(),
        ..Default::default()
    };
    let (response, pending) = match upgrade_response(&mut req, headers, options) {
        Ok(upgrade) => upgrade,
        Err(response) => return response,
    };

    tokio::spawn(async move {
        let Some((conn, incoming)) = pending.establish().await else {
            return;
        };
        let metrics = ctx.metrics.clone();
        let mut guard = metrics.session_started(command.method());
        info!(
            method = command.method(),
            container_id = command.container_id(),
            protocol = version.name(),
            "remote command session started"
        );
        let outcome = run_spdy_session(&ctx, &conn, incoming, &command, opts, version).await;
        guard.set_outcome(outcome);
        SessionHandle::Spdy(conn).close().await;
        info!(
            method = command.method(),
            container_id = command.container_id(),
            outcome,
            "remote command session finished"
        );
    });
    response
}

/// Sub-streams gathered from the client, by role.
#[derive(Default)]
struct Collected {
    stdin: Option<spdy::Stream>,
    stdout: Option<spdy::Stream>,
    stderr: Option<spdy::Stream>,
    error: Option<spdy::Stream>,
    resize: Option<spdy::Stream>,
}

impl Collected {
    fn slot(&mut self, kind: StreamType) -> Option<&mut Option<spdy::Stream>> {
        match kind {
            StreamType::Stdin => Some(&mut self.stdin),
            StreamType::Stdout => Some(&mut self.stdout),
            StreamType::Stderr => Some(&mut self.stderr),
            StreamType::Error => Some(&mut self.error),
            StreamType::Resize => Some(&mut self.resize),
            StreamType::Data => None,
        }
    }
}

/// Accept streams until `expected` of them have been acknowledged.
///
/// A stream counts once its reply has been written. Streams of an unknown
/// type, and resize streams below v3, are reset and not counted. Streams
/// the server only writes to stop accepting client data.
async fn collect_streams(
    mut incoming: mpsc::Receiver<spdy::Stream>,
    expected: usize,
    version: ProtocolVersion,
) -> Collected {
    let mut collected = Collected::default();
    let mut replies = FuturesUnordered::new();
    let mut received = 0;

    while received < expected {
        tokio::select! {
            next = incoming.recv() => {
                // The queue closes only with the connection, which the
                // caller observes separately.
                let Some(mut stream) = next else {
                    return std::future::pending().await;
                };
                let slot = match StreamType::from_headers(stream.headers()) {
                    Some(StreamType::Resize) if !version.supports_resize() => None,
                    Some(kind) => collected.slot(kind).map(|slot| (kind, slot)),
                    None => None,
                };
                match slot {
                    Some((kind, slot)) => {
                        debug!(stream_id = stream.id(), stream_type = %kind, "received remote command stream");
                        if matches!(kind, StreamType::Stdout | StreamType::Stderr | StreamType::Error) {
                            stream.close_read();
                        }
                        replies.push(stream.reply_sent());
                        if let Some(previous) = slot.replace(stream) {
                            warn!(stream_type = %kind, "client opened a duplicate stream");
                            previous.reset();
                        }
                    }
                    None => {
                        let header = stream
                            .headers()
                            .get(STREAM_TYPE_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        warn!(stream_id = stream.id(), stream_type = %header, "unexpected stream type");
                        stream.reset();
                    }
                }
            }
            Some(sent) = replies.next(), if !replies.is_empty() => {
                if sent {
                    received += 1;
                }
            }
        }
    }
    collected
}

async fn run_spdy_session(
    ctx: &SessionContext,
    conn: &spdy::Connection,
    incoming: mpsc::Receiver<spdy::Stream>,
    command: &RemoteCommand,
    opts: StreamOptions,
    version: ProtocolVersion,
) -> &'static str {
    let expected = expected_streams(&opts, version);
    let collected = with_deadline(
        ctx.config.stream_creation_timeout(),
        &conn.close_token(),
        collect_streams(incoming, expected, version),
    )
    .await;
    let mut streams = match collected {
        Outcome::Completed(streams) => streams,
        Outcome::TimedOut => {
            warn!(
                container_id = command.container_id(),
                expected, "timed out waiting for client to create streams"
            );
            return "timeout";
        }
        Outcome::Cancelled => {
            debug!(
                container_id = command.container_id(),
                "connection closed before all streams were created"
            );
            return "aborted";
        }
    };

    if version == ProtocolVersion::V1 {
        if let Some(stdin) = streams.stdin.as_mut() {
            let _ = stdin.shutdown().await;
        }
    }

    let bundle = StreamBundle {
        stdin: streams.stdin.map(|s| Box::new(s) as BoxReader),
        stdout: streams.stdout.map(|s| Box::new(s) as BoxWriter),
        stderr: streams.stderr.map(|s| Box::new(s) as BoxWriter),
        error: streams.error.map(|s| Box::new(s) as BoxWriter),
        resize: streams.resize.map(|s| Box::new(s) as BoxReader),
    };
    dispatch(ctx, command, opts.tty, bundle, version).await
}

fn remote_command_channels(opts: &StreamOptions) -> [ChannelType; 5] {
    let pick = |wanted: bool, kind: ChannelType| if wanted { kind } else { ChannelType::Ignore };
    [
        pick(opts.stdin, ChannelType::Read),
        pick(opts.stdout, ChannelType::Write),
        pick(opts.stderr, ChannelType::Write),
        ChannelType::Write,
        pick(opts.tty, ChannelType::Read),
    ]
}

fn serve_websocket(
    ctx: SessionContext,
    mut req: Request<Body>,
    command: RemoteCommand,
    opts: StreamOptions,
) -> Response<Body> {
    let negotiated = match wsstream::negotiate(req.headers(), WEBSOCKET_PROTOCOLS) {
        Ok(negotiated) => negotiated,
        Err(message) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                format!("unable to upgrade: {}", message),
            )
        }
    };
    let version = match negotiated.protocol.as_deref() {
        Some(V4_BINARY_PROTOCOL) | Some(V4_BASE64_PROTOCOL) => ProtocolVersion::V4,
        _ => ProtocolVersion::V2,
    };
    let (response, on_upgrade) = match wsstream::upgrade_response(&mut req, &negotiated) {
        Ok(upgrade) => upgrade,
        Err(response) => return response,
    };

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(error = %e, "unable to upgrade: error hijacking connection");
                return;
            }
        };
        let (conn, channels) = WsConnection::open(
            upgraded,
            &remote_command_channels(&opts),
            negotiated.encoding,
            ctx.config.stream_idle_timeout(),
        )
        .await;
        let Ok([stdin, mut stdout, mut stderr, mut error, resize]) =
            <[wsstream::Channel; 5]>::try_from(channels)
        else {
            conn.close().await;
            return;
        };

        // An empty message on the lowest writable channel tells the client
        // the session is ready.
        let ready = if opts.stdout {
            stdout.write(&[]).await
        } else if opts.stderr {
            stderr.write(&[]).await
        } else {
            error.write(&[]).await
        };
        if let Err(e) = ready {
            debug!(error = %e, "websocket closed before the session started");
        }

        let metrics = ctx.metrics.clone();
        let mut guard = metrics.session_started(command.method());
        let bundle = StreamBundle {
            stdin: opts.stdin.then(|| Box::new(stdin) as BoxReader),
            stdout: opts.stdout.then(|| Box::new(stdout) as BoxWriter),
            stderr: opts.stderr.then(|| Box::new(stderr) as BoxWriter),
            error: Some(Box::new(error) as BoxWriter),
            resize: opts.tty.then(|| Box::new(resize) as BoxReader),
        };
        let outcome = dispatch(&ctx, &command, opts.tty, bundle, version).await;
        guard.set_outcome(outcome);
        SessionHandle::WebSocket(conn).close().await;
    });
    response
}

/// Decode the resize stream's JSON objects into `sizes`.
///
/// Stops at end of stream, on a malformed object or when the receiver is
/// gone.
async fn decode_resize_events(mut reader: BoxReader, sizes: mpsc::Sender<TerminalSize>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        let mut events = serde_json::Deserializer::from_slice(&buf).into_iter::<TerminalSize>();
        let mut consumed = 0;
        loop {
            match events.next() {
                Some(Ok(size)) => {
                    consumed = events.byte_offset();
                    if sizes.send(size).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    debug!(error = %e, "invalid resize event");
                    return;
                }
                None => {
                    consumed = events.byte_offset();
                    break;
                }
            }
        }
        buf.drain(..consumed);
    }
}

#[derive(Serialize)]
struct ObjectMeta {}

#[derive(Serialize)]
struct StatusCause {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    message: String,
}

#[derive(Serialize)]
struct StatusDetails {
    causes: Vec<StatusCause>,
}

/// The Kubernetes `Status` object v4 writes on the error stream.
#[derive(Serialize)]
struct Status {
    metadata: ObjectMeta,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<StatusDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

/// How the runtime call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Completion {
    Success,
    ExitCode(i32),
    Failed(String),
}

/// Bytes to write on the error stream for `completion`, if any.
fn status_message(version: ProtocolVersion, completion: &Completion) -> Option<Vec<u8>> {
    if version < ProtocolVersion::V4 {
        return match completion {
            Completion::Success => None,
            Completion::ExitCode(code) => Some(
                format!("command terminated with non-zero exit code: {}", code).into_bytes(),
            ),
            Completion::Failed(message) => Some(message.clone().into_bytes()),
        };
    }

    let status = match completion {
        Completion::Success => Status {
            metadata: ObjectMeta {},
            status: "Success",
            message: None,
            reason: None,
            details: None,
            code: None,
        },
        Completion::ExitCode(code) => Status {
            metadata: ObjectMeta {},
            status: "Failure",
            message: Some(format!(
                "command terminated with non-zero exit code: {}",
                code
            )),
            reason: Some("NonZeroExitCode"),
            details: Some(StatusDetails {
                causes: vec![StatusCause {
                    reason: Some("ExitCode"),
                    message: code.to_string(),
                }],
            }),
            code: None,
        },
        Completion::Failed(message) => Status {
            metadata: ObjectMeta {},
            status: "Failure",
            message: Some(message.clone()),
            reason: Some("InternalError"),
            details: Some(StatusDetails {
                causes: vec![StatusCause {
                    reason: None,
                    message: message.clone(),
                }],
            }),
            code: Some(500),
        },
    };
    serde_json::to_vec(&status).ok()
}

/// Run the command against the runtime and report how it ended.
async fn dispatch(
    ctx: &SessionContext,
    command: &RemoteCommand,
    tty: bool,
    bundle: StreamBundle,
    version: ProtocolVersion,
) -> &'static str {
    let StreamBundle {
        stdin,
        stdout,
        stderr,
        error,
        resize,
    } = bundle;

    let (resize_rx, decoder) = match resize {
        Some(reader) => {
            let (tx, rx) = mpsc::channel(RESIZE_QUEUE_DEPTH);
            (Some(rx), Some(tokio::spawn(decode_resize_events(reader, tx))))
        }
        None => (None, None),
    };
    let stdio = Stdio {
        stdin,
        stdout,
        stderr,
        tty,
        resize: resize_rx,
    };

    let result = match command {
        RemoteCommand::Exec { container_id, cmd } => ctx
            .runtime
            .exec(container_id, cmd, stdio)
            .await
            .map(Some)
            .map_err(|e| format!("error executing command in container {}: {}", container_id, e)),
        RemoteCommand::Attach { container_id } => ctx
            .runtime
            .attach(container_id, stdio)
            .await
            .map(|()| None)
            .map_err(|e| format!("error attaching to container {}: {}", container_id, e)),
    };
    // Ends the decoder so the runtime's resize drain sees its channel close.
    if let Some(decoder) = decoder {
        decoder.abort();
    }

    let (label, completion) = match result {
        Ok(None) | Ok(Some(0)) => ("success", Completion::Success),
        Ok(Some(code)) => ("exit_code", Completion::ExitCode(code)),
        Err(message) => {
            warn!(container_id = command.container_id(), error = %message, "remote command failed");
            ("error", Completion::Failed(message))
        }
    };

    if let Some(mut error) = error {
        if let Some(message) = status_message(version, &completion) {
            if let Err(e) = error.write_all(&message).await {
                debug!(error = %e, "failed to write status to error stream");
            }
        }
        let _ = error.shutdown().await;
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::spdy::{Connection, Role};
    use http::HeaderValue;
    use std::time::Duration;

    const TEST_WAIT: Duration = Duration::from_secs(5);

    fn opts(stdin: bool, stdout: bool, stderr: bool, tty: bool) -> StreamOptions {
        StreamOptions {
            stdin,
            stdout,
            stderr,
            tty,
        }
    }

    #[test]
    fn test_protocol_version_mapping() {
        assert_eq!(ProtocolVersion::from_negotiated(None), Some(ProtocolVersion::V1));
        assert_eq!(
            ProtocolVersion::from_negotiated(Some("channel.k8s.io")),
            Some(ProtocolVersion::V1)
        );
        assert_eq!(
            ProtocolVersion::from_negotiated(Some("v4.channel.k8s.io")),
            Some(ProtocolVersion::V4)
        );
        assert_eq!(ProtocolVersion::from_negotiated(Some("v9")), None);
    }

    #[test]
    fn test_expected_streams() {
        assert_eq!(expected_streams(&opts(false, true, true, false), ProtocolVersion::V2), 3);
        assert_eq!(expected_streams(&opts(true, true, true, false), ProtocolVersion::V1), 4);
        // Resize is only counted for terminals on v3 and later.
        assert_eq!(expected_streams(&opts(true, true, false, true), ProtocolVersion::V2), 3);
        assert_eq!(expected_streams(&opts(true, true, false, true), ProtocolVersion::V3), 4);
        assert_eq!(expected_streams(&opts(false, false, false, false), ProtocolVersion::V4), 1);
    }

    #[test]
    fn test_v4_status_objects() {
        let success = status_message(ProtocolVersion::V4, &Completion::Success).unwrap();
        assert_eq!(
            String::from_utf8(success).unwrap(),
            r#"{"metadata":{},"status":"Success"}"#
        );

        let failure = status_message(ProtocolVersion::V4, &Completion::ExitCode(3)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&failure).unwrap();
        assert_eq!(value["status"], "Failure");
        assert_eq!(value["reason"], "NonZeroExitCode");
        assert_eq!(value["details"]["causes"][0]["reason"], "ExitCode");
        assert_eq!(value["details"]["causes"][0]["message"], "3");
    }

    #[test]
    fn test_pre_v4_status_is_text() {
        assert_eq!(status_message(ProtocolVersion::V2, &Completion::Success), None);
        let text = status_message(ProtocolVersion::V1, &Completion::ExitCode(2)).unwrap();
        assert_eq!(text, b"command terminated with non-zero exit code: 2");
        let text =
            status_message(ProtocolVersion::V3, &Completion::Failed("boom".to_string())).unwrap();
        assert_eq!(text, b"boom");
    }

    #[test]
    fn test_transport_selection() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("SPDY/3.1"));
        assert_eq!(Transport::select(&headers), Transport::Spdy);
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert_eq!(Transport::select(&headers), Transport::WebSocket);
    }

    #[tokio::test]
    async fn test_decode_resize_events_across_chunks() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(4);
        let decoder = tokio::spawn(decode_resize_events(Box::new(server), tx));

        client.write_all(br#"{"Width":80,"Hei"#).await.unwrap();
        client.write_all(br#"ght":24}{"Width":120,"Height":40}"#).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TerminalSize { width: 80, height: 24 })
        );
        assert_eq!(
            rx.recv().await,
            Some(TerminalSize { width: 120, height: 40 })
        );

        drop(client);
        tokio::time::timeout(TEST_WAIT, decoder).await.unwrap().unwrap();
        assert_eq!(rx.recv().await, None);
    }

    fn typed(kind: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(STREAM_TYPE_HEADER, HeaderValue::from_static(kind));
        headers
    }

    #[tokio::test]
    async fn test_collect_streams_counts_known_types_only() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_server, incoming) = Connection::new(a, Role::Server, ConnectionOptions::default()).unwrap();
        let (client, _) = Connection::new(b, Role::Client, ConnectionOptions::default()).unwrap();

        let collector = tokio::spawn(collect_streams(incoming, 3, ProtocolVersion::V4));
        let _error = client.open_stream(typed("error")).await.unwrap();
        let _bogus = client.open_stream(typed("bogus")).await.unwrap();
        let _stdout = client.open_stream(typed("stdout")).await.unwrap();
        assert!(!collector.is_finished());
        let _stderr = client.open_stream(typed("stderr")).await.unwrap();

        let collected = tokio::time::timeout(TEST_WAIT, collector)
            .await
            .unwrap()
            .unwrap();
        assert!(collected.error.is_some());
        assert!(collected.stdout.is_some());
        assert!(collected.stderr.is_some());
        assert!(collected.stdin.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_stream_not_counted_before_v3() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_server, incoming) = Connection::new(a, Role::Server, ConnectionOptions::default()).unwrap();
        let (client, _) = Connection::new(b, Role::Client, ConnectionOptions::default()).unwrap();

        let expected = expected_streams(&opts(false, true, false, true), ProtocolVersion::V2);
        assert_eq!(expected, 2);
        let collector = tokio::spawn(collect_streams(incoming, expected, ProtocolVersion::V2));
        let _error = client.open_stream(typed("error")).await.unwrap();
        let _resize = client.open_stream(typed("resize")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!collector.is_finished());

        let _stdout = client.open_stream(typed("stdout")).await.unwrap();
        let collected = tokio::time::timeout(TEST_WAIT, collector)
            .await
            .unwrap()
            .unwrap();
        assert!(collected.stdout.is_some());
        assert!(collected.resize.is_none());
    }
}
