//! Sub-protocol negotiation and the HTTP header vocabulary of upgraded
//! streaming connections.

use std::fmt;

use http::header::{HeaderMap, HeaderValue, CONNECTION, UPGRADE};
use http::{Response, StatusCode};
use hyper::Body;

/// Request/response header carrying the stream protocol version.
pub const HEADER_PROTOCOL_VERSION: &str = "x-stream-protocol-version";

/// Response header listing the versions the server accepts (sent on 403).
pub const HEADER_ACCEPTED_PROTOCOL_VERSIONS: &str = "x-accepted-stream-protocol-versions";

/// Sub-stream header naming the stream's role.
pub const STREAM_TYPE_HEADER: &str = "streamtype";

/// Port-forward sub-stream header with the target port.
pub const PORT_HEADER: &str = "port";

/// Port-forward sub-stream header grouping a data/error pair.
pub const PORT_FORWARD_REQUEST_ID_HEADER: &str = "requestid";

/// Role of a multiplexed sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Stdin,
    Stdout,
    Stderr,
    Error,
    Data,
    Resize,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Stdin => "stdin",
            StreamType::Stdout => "stdout",
            StreamType::Stderr => "stderr",
            StreamType::Error => "error",
            StreamType::Data => "data",
            StreamType::Resize => "resize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdin" => Some(StreamType::Stdin),
            "stdout" => Some(StreamType::Stdout),
            "stderr" => Some(StreamType::Stderr),
            "error" => Some(StreamType::Error),
            "data" => Some(StreamType::Data),
            "resize" => Some(StreamType::Resize),
            _ => None,
        }
    }

    /// Read the stream type header of a sub-stream.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(STREAM_TYPE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True if any `Connection` header value mentions `upgrade`.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false)
    })
}

/// True for an upgrade request asking for the WebSocket protocol.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    is_upgrade_request(headers)
        && headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
}

/// Pick the first client protocol the server also supports.
///
/// Client preference order wins over server order.
pub fn negotiate_protocol<C, S>(client: &[C], server: &[S]) -> Option<String>
where
    C: AsRef<str>,
    S: AsRef<str>,
{
    client
        .iter()
        .map(AsRef::as_ref)
        .find(|c| server.iter().any(|s| s.as_ref() == *c))
        .map(str::to_string)
}

/// Negotiation failed: the client and server share no protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeError {
    pub client: Vec<String>,
    pub server: Vec<String>,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unable to upgrade: unable to negotiate protocol: client supports {:?}, server accepts {:?}",
            self.client, self.server
        )
    }
}

impl std::error::Error for HandshakeError {}

impl HandshakeError {
    /// 403 response listing every server protocol so the client can retry.
    pub fn into_response(self) -> Response<Body> {
        let message = self.to_string();
        let mut response = Response::new(Body::from(message));
        *response.status_mut() = StatusCode::FORBIDDEN;
        let headers = response.headers_mut();
        for protocol in &self.server {
            if let Ok(value) = HeaderValue::from_str(protocol) {
                headers.append(HEADER_ACCEPTED_PROTOCOL_VERSIONS, value);
            }
        }
        response
    }
}

/// Negotiate the stream protocol of an upgrade request.
///
/// Returns `Ok(None)` when the client sent no version header at all; the
/// caller then falls back to its oldest protocol and no version header is
/// written. On success the chosen version is written to `response`.
pub fn handshake(
    request: &HeaderMap,
    response: &mut HeaderMap,
    server_protocols: &[String],
) -> Result<Option<String>, HandshakeError> {
    let client: Vec<String> = request
        .get_all(HEADER_PROTOCOL_VERSION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .collect();
    if request.get(HEADER_PROTOCOL_VERSION).is_none() {
        return Ok(None);
    }

    match negotiate_protocol(&client, server_protocols) {
        Some(protocol) => {
            if let Ok(value) = HeaderValue::from_str(&protocol) {
                response.insert(HEADER_PROTOCOL_VERSION, value);
            }
            Ok(Some(protocol))
        }
        None => Err(HandshakeError {
            client,
            server: server_protocols.to_vec(),
        }),
    }
}
