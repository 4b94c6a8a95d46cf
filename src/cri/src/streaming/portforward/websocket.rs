//! Port forwarding over the WebSocket channel protocol.
//!
//! Ports come from repeated `port` query parameters. Port `i` uses channel
//! `2i` for data and `2i + 1` for errors; both start with the port number
//! as two little-endian bytes.

use futures::future::join_all;
use http::{Request, Response, StatusCode};
use hyper::Body;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::streaming::httpstream::PORT_HEADER;
use crate::streaming::wsstream::{
    self, Channel, ChannelType, Encoding, WsConnection, V4_BASE64_PROTOCOL, V4_BINARY_PROTOCOL,
};
use crate::streaming::SessionContext;

const WEBSOCKET_PROTOCOLS: &[(&str, Encoding)] = &[
    (V4_BINARY_PROTOCOL, Encoding::Binary),
    (V4_BASE64_PROTOCOL, Encoding::Base64),
];

fn bad_request(message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Parse the `port` query parameters.
pub(crate) fn parse_ports(query: Option<&str>) -> Result<Vec<u16>, String> {
    let mut ports = Vec::new();
    for pair in query.unwrap_or_default().split('&') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        if name != PORT_HEADER {
            continue;
        }
        let port: u16 = value
            .parse()
            .map_err(|e| format!("unable to parse {:?} as a port: {}", value, e))?;
        if port < 1 {
            return Err(format!("port {:?} must be > 0", value));
        }
        ports.push(port);
    }
    if ports.is_empty() {
        return Err("query parameter \"port\" is required".to_string());
    }
    Ok(ports)
}

async fn forward_port(
    ctx: &SessionContext,
    pod_sandbox_id: &str,
    port: u16,
    mut data: Channel,
    mut error: Channel,
) {
    let prefix = port.to_le_bytes();
    if data.write_all(&prefix).await.is_err() || error.write_all(&prefix).await.is_err() {
        debug!(port, "websocket closed before forwarding started");
        return;
    }

    ctx.metrics.pair_started();
    let result = ctx.runtime.port_forward(pod_sandbox_id, port, &mut data).await;
    ctx.metrics.pair_finished();

    if let Err(e) = result {
        let message = format!(
            "error forwarding port {} to pod {}: {}",
            port, pod_sandbox_id, e
        );
        warn!("{}", message);
        if let Err(e) = error.write_all(message.as_bytes()).await {
            debug!(error = %e, "failed to write port forward error");
        }
    }
}

pub(super) fn serve(ctx: SessionContext, mut req: Request<Body>, pod_sandbox_id: String) -> Response<Body> {
    let ports = match parse_ports(req.uri().query()) {
        Ok(ports) => ports,
        Err(message) => return bad_request(message),
    };
    let negotiated = match wsstream::negotiate(req.headers(), WEBSOCKET_PROTOCOLS) {
        Ok(negotiated) => negotiated,
        Err(message) => return bad_request(format!("unable to upgrade: {}", message)),
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
        let kinds: Vec<ChannelType> = ports
            .iter()
            .flat_map(|_| [ChannelType::ReadWrite, ChannelType::Write])
            .collect();
        let (conn, channels) = WsConnection::open(
            upgraded,
            &kinds,
            negotiated.encoding,
            ctx.config.stream_idle_timeout(),
        )
        .await;

        let metrics = ctx.metrics.clone();
        let mut guard = metrics.session_started("portforward");
        info!(pod_sandbox_id = %pod_sandbox_id, ports = ?ports, "port forward session started");

        let mut channels = channels.into_iter();
        let mut forwards = Vec::with_capacity(ports.len());
        for port in &ports {
            let (Some(data), Some(error)) = (channels.next(), channels.next()) else {
                break;
            };
            forwards.push(forward_port(&ctx, &pod_sandbox_id, *port, data, error));
        }
        join_all(forwards).await;

        conn.close().await;
        guard.set_outcome("success");
        info!(pod_sandbox_id = %pod_sandbox_id, "port forward session finished");
    });
    response
}
