//! The Kubernetes channel protocol over WebSocket.
//!
//! Each WebSocket message carries one channel's data. In binary framing the
//! first byte is the channel index; in base64 framing the message is text
//! whose first character is the ASCII channel digit, followed by the payload
//! in standard base64.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper::Body;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pipe::{inbound_channel, InboundPipe, OutboundPipe};

pub const CHANNEL_PROTOCOL: &str = "channel.k8s.io";
pub const BASE64_CHANNEL_PROTOCOL: &str = "base64.channel.k8s.io";
pub const V4_BINARY_PROTOCOL: &str = "v4.channel.k8s.io";
pub const V4_BASE64_PROTOCOL: &str = "v4.base64.channel.k8s.io";

const WRITE_QUEUE_DEPTH: usize = 64;
const MAX_MESSAGE_PAYLOAD: usize = 32 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction(s) a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Ignore,
    Read,
    Write,
    ReadWrite,
}

impl ChannelType {
    fn readable(self) -> bool {
        matches!(self, ChannelType::Read | ChannelType::ReadWrite)
    }

    fn writable(self) -> bool {
        matches!(self, ChannelType::Write | ChannelType::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Base64,
}

/// Result of sub-protocol selection. `protocol` is `None` when the client
/// offered none, which selects binary framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: Option<String>,
    pub encoding: Encoding,
}

fn client_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Pick the first protocol the client offers that appears in `supported`.
pub fn negotiate(
    headers: &HeaderMap,
    supported: &[(&'static str, Encoding)],
) -> Result<Negotiated, String> {
    let client = client_protocols(headers);
    if client.is_empty() {
        return Ok(Negotiated {
            protocol: None,
            encoding: Encoding::Binary,
        });
    }
    for offered in &client {
        if let Some((name, encoding)) = supported.iter().find(|(name, _)| name == offered) {
            return Ok(Negotiated {
                protocol: Some(name.to_string()),
                encoding: *encoding,
            });
        }
    }
    let names: Vec<&str> = supported.iter().map(|(name, _)| *name).collect();
    Err(format!(
        "requested protocol(s) are not supported: {:?}; supports {:?}",
        client, names
    ))
}

fn text_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

/// Validate a WebSocket upgrade and build the 101 response.
pub fn upgrade_response(
    req: &mut Request<Body>,
    negotiated: &Negotiated,
) -> Result<(Response<Body>, OnUpgrade), Response<Body>> {
    let accept = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => {
            return Err(text_response(
                StatusCode::BAD_REQUEST,
                "unable to upgrade: missing Sec-WebSocket-Key header".to_string(),
            ))
        }
    };
    let on_upgrade = match req.extensions_mut().remove::<OnUpgrade>() {
        Some(on_upgrade) => on_upgrade,
        None => {
            return Err(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "unable to upgrade: unable to hijack response".to_string(),
            ))
        }
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    if let Some(protocol) = &negotiated.protocol {
        if let Ok(value) = HeaderValue::from_str(protocol) {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    Ok((response, on_upgrade))
}

fn encode_message(encoding: Encoding, channel: u8, data: &[u8]) -> Message {
    match encoding {
        Encoding::Binary => {
            let mut frame = Vec::with_capacity(data.len() + 1);
            frame.push(channel);
            frame.extend_from_slice(data);
            Message::Binary(frame.into())
        }
        Encoding::Base64 => {
            let mut text = String::with_capacity(data.len() * 4 / 3 + 4);
            text.push(char::from(b'0' + channel));
            text.push_str(&STANDARD.encode(data));
            Message::Text(text.into())
        }
    }
}

fn decode_message(encoding: Encoding, message: &Message) -> Option<(u8, Bytes)> {
    match (encoding, message) {
        (Encoding::Binary, Message::Binary(data)) => {
            let (channel, payload) = data.split_first()?;
            Some((*channel, Bytes::copy_from_slice(payload)))
        }
        (Encoding::Base64, Message::Text(text)) => {
            let text: &str = text.as_ref();
            let digit = *text.as_bytes().first()?;
            if !digit.is_ascii_digit() {
                return None;
            }
            let payload = STANDARD.decode(&text[1..]).ok()?;
            Some((digit - b'0', Bytes::from(payload)))
        }
        _ => None,
    }
}

enum WsOutbound {
    Data(u8, Bytes),
    Close,
}

/// A running channel-protocol connection.
#[derive(Clone)]
pub struct WsConnection {
    out: mpsc::Sender<WsOutbound>,
    closed: CancellationToken,
}

impl WsConnection {
    /// Start the channel protocol over an upgraded socket.
    ///
    /// Returns one `Channel` per entry of `channels`, in order. Reads on a
    /// channel end when the connection closes; the connection closes after
    /// `idle_timeout` without inbound messages.
    pub async fn open<S>(
        io: S,
        channels: &[ChannelType],
        encoding: Encoding,
        idle_timeout: Duration,
    ) -> (WsConnection, Vec<Channel>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let closed = CancellationToken::new();

        let mut inbound = Vec::with_capacity(channels.len());
        let mut handles = Vec::with_capacity(channels.len());
        for (index, kind) in channels.iter().enumerate() {
            let (tx, reader) = inbound_channel();
            let sender = kind.readable().then_some(tx);
            inbound.push(sender);
            handles.push(Channel {
                index: index as u8,
                writable: kind.writable(),
                write_closed: false,
                inbound: reader,
                outbound: OutboundPipe::new(out_tx.clone()),
            });
        }

        let (sink, stream) = ws.split();
        tokio::spawn(run_writer(sink, out_rx, encoding, closed.clone()));
        tokio::spawn(run_reader(stream, inbound, encoding, idle_timeout, closed.clone()));

        (WsConnection { out: out_tx, closed }, handles)
    }

    /// Send a close frame and wait briefly for the transport to wind down.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.out.send(WsOutbound::Close)).await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.closed.cancelled()).await;
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closed.child_token()
    }
}

async fn run_writer<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<WsOutbound>,
    encoding: Encoding,
    closed: CancellationToken,
) where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = queue.recv() => next,
        };
        match next {
            Some(WsOutbound::Data(channel, data)) => {
                if let Err(e) = sink.send(encode_message(encoding, channel, &data)).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            Some(WsOutbound::Close) | None => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
        }
    }
    closed.cancel();
}

async fn run_reader<S, E>(
    mut stream: S,
    inbound: Vec<Option<mpsc::Sender<Bytes>>>,
    encoding: Encoding,
    idle_timeout: Duration,
    closed: CancellationToken,
) where
    S: futures::Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };
        let message = match next {
            Err(_) => {
                info!(idle_secs = idle_timeout.as_secs(), "websocket connection idle, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        if message.is_close() {
            break;
        }
        if message.is_ping() || message.is_pong() {
            continue;
        }
        let Some((channel, payload)) = decode_message(encoding, &message) else {
            debug!("ignoring malformed websocket message");
            continue;
        };
        match inbound.get(channel as usize) {
            Some(Some(tx)) => {
                if !payload.is_empty() {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        _ = tx.send(payload) => {}
                    }
                }
            }
            _ => debug!(channel, "ignoring message for non-readable channel"),
        }
    }
    closed.cancel();
}

/// One logical channel of a `WsConnection`.
pub struct Channel {
    index: u8,
    writable: bool,
    write_closed: bool,
    inbound: InboundPipe,
    outbound: OutboundPipe<WsOutbound>,
}

impl Channel {
    pub fn index(&self) -> u8 {
        self.index
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().inbound.poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.writable || this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("channel {} is not writable", this.index),
            )));
        }
        let n = buf.len().min(MAX_MESSAGE_PAYLOAD);
        let index = this.index;
        ready!(this
            .outbound
            .poll_send(cx, || WsOutbound::Data(index, Bytes::copy_from_slice(&buf[..n]))))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Channels have no half-close on the wire; further writes just fail.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().write_closed = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_negotiate_prefers_client_order() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("base64.channel.k8s.io, v4.channel.k8s.io"),
        );
        let supported = [
            (V4_BINARY_PROTOCOL, Encoding::Binary),
            (BASE64_CHANNEL_PROTOCOL, Encoding::Base64),
        ];
        let negotiated = negotiate(&headers, &supported).unwrap();
        assert_eq!(negotiated.protocol.as_deref(), Some(BASE64_CHANNEL_PROTOCOL));
        assert_eq!(negotiated.encoding, Encoding::Base64);
    }

    #[test]
    fn test_negotiate_without_header_is_binary() {
        let negotiated = negotiate(&HeaderMap::new(), &[]).unwrap();
        assert_eq!(negotiated.protocol, None);
        assert_eq!(negotiated.encoding, Encoding::Binary);
    }

    #[test]
    fn test_negotiate_unsupported() {
        let mut headers = HeaderMap::new();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("v9.channel.k8s.io"));
        let err = negotiate(&headers, &[(CHANNEL_PROTOCOL, Encoding::Binary)]).unwrap_err();
        assert!(err.contains("not supported"));
    }

    #[test]
    fn test_message_framing() {
        let binary = encode_message(Encoding::Binary, 1, b"out");
        assert_eq!(
            decode_message(Encoding::Binary, &binary),
            Some((1, Bytes::from_static(b"out")))
        );

        let text = encode_message(Encoding::Base64, 2, b"err");
        assert_eq!(text.to_text().unwrap(), "2ZXJy");
        assert_eq!(
            decode_message(Encoding::Base64, &text),
            Some((2, Bytes::from_static(b"err")))
        );

        assert_eq!(decode_message(Encoding::Base64, &binary), None);
        assert_eq!(decode_message(Encoding::Binary, &Message::Binary(Vec::new().into())), None);
    }

    #[tokio::test]
    async fn test_channels_over_duplex() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (conn, mut channels) = WsConnection::open(
            server_io,
            &[ChannelType::Read, ChannelType::Write],
            Encoding::Binary,
            Duration::from_secs(30),
        )
        .await;
        let mut client =
            WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        client
            .send(Message::Binary(vec![0, b'h', b'i'].into()))
            .await
            .unwrap();
        let mut stdout = channels.pop().unwrap();
        let mut stdin = channels.pop().unwrap();
        let mut buf = [0u8; 2];
        stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        stdout.write_all(b"yo").await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data().to_vec(), vec![1, b'y', b'o']);

        assert!(stdin.write_all(b"x").await.is_err());
        conn.close().await;
        assert!(conn.is_closed());
    }
}
