//! Upgrade an HTTP/1.1 request to a SPDY/3.1 connection.

use http::header::{HeaderMap, HeaderValue, CONNECTION, UPGRADE};
use http::{Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper::Body;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionOptions, Role, Stream};
use crate::streaming::httpstream::is_upgrade_request;

pub const HEADER_SPDY31: &str = "SPDY/3.1";

/// Upgrade accepted; the connection becomes available once hyper hands
/// over the socket after the 101 response has been written.
pub struct PendingConnection {
    on_upgrade: OnUpgrade,
    options: ConnectionOptions,
}

impl PendingConnection {
    /// Wait for the hijacked socket and start the SPDY session on it.
    ///
    /// Bytes the client pipelined after the request are replayed by hyper
    /// before reads reach the socket. Returns `None` after logging when the
    /// upgrade or session setup fails.
    pub async fn establish(self) -> Option<(Connection, mpsc::Receiver<Stream>)> {
        let upgraded = match self.on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(error = %e, "unable to upgrade: error hijacking connection");
                return None;
            }
        };
        match Connection::new(upgraded, Role::Server, self.options) {
            Ok(conn) => {
                debug!("SPDY/3.1 connection established");
                Some(conn)
            }
            Err(e) => {
                warn!(error = %e, "unable to upgrade: error creating SPDY server connection");
                None
            }
        }
    }
}

fn text_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

fn header_contains(headers: &HeaderMap, name: http::header::HeaderName, needle: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.to_ascii_lowercase().contains(needle))
            .unwrap_or(false)
    })
}

/// Validate a SPDY upgrade request and build the 101 response.
///
/// `headers` are extra response headers (the negotiated protocol version).
/// On failure the returned response carries the error: 400 when the
/// upgrade headers are missing, 500 when the transport cannot hand over
/// the connection.
pub fn upgrade_response(
    req: &mut Request<Body>,
    headers: HeaderMap,
    options: ConnectionOptions,
) -> Result<(Response<Body>, PendingConnection), Response<Body>> {
    if !is_upgrade_request(req.headers()) || !header_contains(req.headers(), UPGRADE, "spdy/3.1") {
        let message = format!(
            "unable to upgrade: missing upgrade headers in request: {:?}",
            req.headers()
        );
        return Err(text_response(StatusCode::BAD_REQUEST, message));
    }

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
    let out = response.headers_mut();
    out.extend(headers);
    out.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    out.insert(UPGRADE, HeaderValue::from_static(HEADER_SPDY31));

    Ok((response, PendingConnection { on_upgrade, options }))
}
