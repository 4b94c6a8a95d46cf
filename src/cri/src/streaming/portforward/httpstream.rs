//! Port forwarding over SPDY.
//!
//! Every forwarded connection is a pair of sub-streams, `data` and `error`,
//! grouped by the `requestID` header. A pair is forwarded once both halves
//! have arrived and stays registered until forwarding ends, so late
//! duplicates are reported on its error stream. Pairs that stay incomplete
//! past the creation timeout are reported and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use http::header::HeaderMap;
use http::{Request, Response};
use hyper::Body;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::streaming::deadline::{with_deadline, Outcome};
use crate::streaming::httpstream::{
    handshake, StreamType, PORT_FORWARD_REQUEST_ID_HEADER, PORT_HEADER, STREAM_TYPE_HEADER,
};
use crate::streaming::spdy::{self, upgrade_response, ConnectionOptions, StreamWriter};
use crate::streaming::SessionContext;

/// Accept filter run on every SYN_STREAM before it is acknowledged.
pub(crate) fn validate_stream_headers(headers: &HeaderMap) -> Result<(), String> {
    let port = headers
        .get(PORT_HEADER)
        .ok_or_else(|| "\"port\" header is required".to_string())?;
    let port = port.to_str().map_err(|e| e.to_string())?;
    let parsed: u16 = port
        .parse()
        .map_err(|e| format!("unable to parse {:?} as a port: {}", port, e))?;
    if parsed < 1 {
        return Err(format!("port {:?} must be > 0", port));
    }

    match StreamType::from_headers(headers) {
        Some(StreamType::Error) | Some(StreamType::Data) => Ok(()),
        _ => Err(format!(
            "invalid stream type {:?}",
            headers
                .get(STREAM_TYPE_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        )),
    }
}

fn stream_port(headers: &HeaderMap) -> Option<u16> {
    headers.get(PORT_HEADER)?.to_str().ok()?.parse().ok()
}

/// Request id of a sub-stream. Clients that predate the header pair their
/// streams by id: the error stream's own id, or the data stream's id - 2.
fn request_id(stream: &spdy::Stream) -> String {
    if let Some(id) = stream
        .headers()
        .get(PORT_FORWARD_REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return id.to_string();
    }
    match StreamType::from_headers(stream.headers()) {
        Some(StreamType::Error) => stream.id().to_string(),
        Some(StreamType::Data) => (i64::from(stream.id()) - 2).to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PairError {
    #[error("error stream already assigned")]
    ErrorAssigned,
    #[error("data stream already assigned")]
    DataAssigned,
    #[error("invalid stream type")]
    InvalidType,
}

#[derive(Default)]
struct PairStreams {
    data: Option<spdy::Stream>,
    error: Option<spdy::Stream>,
    data_writer: Option<StreamWriter>,
    error_writer: Option<StreamWriter>,
}

/// The data and error streams of one forwarded connection.
pub(crate) struct StreamPair {
    request_id: String,
    streams: Mutex<PairStreams>,
    complete: watch::Sender<bool>,
}

impl StreamPair {
    fn new(request_id: String) -> Self {
        let (complete, _) = watch::channel(false);
        Self {
            request_id,
            streams: Mutex::new(PairStreams::default()),
            complete,
        }
    }

    /// Slot `stream` into the pair. A rejected stream is dropped.
    fn add(&self, stream: spdy::Stream) -> Result<(), PairError> {
        let mut streams = self.streams.lock();
        let result = match StreamType::from_headers(stream.headers()) {
            Some(StreamType::Error) if streams.error_writer.is_some() => {
                Err(PairError::ErrorAssigned)
            }
            Some(StreamType::Data) if streams.data_writer.is_some() => Err(PairError::DataAssigned),
            Some(StreamType::Error) => {
                stream.close_read();
                streams.error_writer = Some(stream.writer());
                streams.error = Some(stream);
                Ok(())
            }
            Some(StreamType::Data) => {
                streams.data_writer = Some(stream.writer());
                streams.data = Some(stream);
                Ok(())
            }
            _ => Err(PairError::InvalidType),
        };
        if let Err(ref e) = result {
            debug!(request_id = %self.request_id, error = %e, "rejecting port forward stream");
        }
        if streams.data_writer.is_some() && streams.error_writer.is_some() {
            self.complete.send_replace(true);
        }
        result
    }

    fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    async fn wait_complete(&self) {
        let mut rx = self.complete.subscribe();
        let _ = rx.wait_for(|complete| *complete).await;
    }

    /// Take both streams for forwarding.
    fn take(&self) -> Option<(spdy::Stream, spdy::Stream)> {
        let mut streams = self.streams.lock();
        match (streams.data.take(), streams.error.take()) {
            (Some(data), Some(error)) => Some((data, error)),
            (data, error) => {
                streams.data = data;
                streams.error = error;
                None
            }
        }
    }

    /// Write a diagnostic on the error stream, if it has arrived.
    async fn print_error(&self, message: &str) {
        let writer = self.streams.lock().error_writer.clone();
        self.write_diagnostic(writer, message).await;
    }

    /// Report a pair that never completed on whichever stream it has.
    async fn print_timeout(&self, message: &str) {
        let writer = {
            let streams = self.streams.lock();
            streams.error_writer.clone().or_else(|| streams.data_writer.clone())
        };
        self.write_diagnostic(writer, message).await;
    }

    async fn write_diagnostic(&self, writer: Option<StreamWriter>, message: &str) {
        if let Some(writer) = writer {
            if let Err(e) = writer.write_all(message.as_bytes()).await {
                debug!(request_id = %self.request_id, error = %e, "failed to write port forward error");
            }
        }
    }
}

/// One upgraded port-forward connection.
struct PortForwardSession {
    ctx: SessionContext,
    conn: spdy::Connection,
    pod_sandbox_id: String,
    pairs: Mutex<HashMap<String, Arc<StreamPair>>>,
}

impl PortForwardSession {
    fn get_or_create_pair(&self, request_id: &str) -> (Arc<StreamPair>, bool) {
        let mut pairs = self.pairs.lock();
        if let Some(pair) = pairs.get(request_id) {
            return (pair.clone(), false);
        }
        let pair = Arc::new(StreamPair::new(request_id.to_string()));
        pairs.insert(request_id.to_string(), pair.clone());
        (pair, true)
    }

    fn remove_pair(&self, request_id: &str) {
        self.pairs.lock().remove(request_id);
    }

    /// Single intake loop: sort incoming streams into pairs until the
    /// connection closes.
    async fn run(self: Arc<Self>, mut incoming: mpsc::Receiver<spdy::Stream>) {
        let closed = self.conn.close_token();
        loop {
            let stream = tokio::select! {
                _ = closed.cancelled() => break,
                next = incoming.recv() => match next {
                    Some(stream) => stream,
                    None => break,
                },
            };

            let request_id = request_id(&stream);
            let (pair, created) = self.get_or_create_pair(&request_id);
            if created {
                tokio::spawn(self.clone().monitor_pair(pair.clone()));
            }

            match pair.add(stream) {
                Ok(()) if pair.is_complete() => {
                    debug!(request_id = %request_id, "port forward streams received");
                    tokio::spawn(self.clone().forward(pair));
                }
                Ok(()) => {}
                Err(e) => {
                    let message = format!(
                        "error processing stream for request {}: {}",
                        request_id, e
                    );
                    warn!(pod_sandbox_id = %self.pod_sandbox_id, "{}", message);
                    tokio::spawn(async move { pair.print_error(&message).await });
                }
            }
        }
        self.pairs.lock().clear();
    }

    /// Drop the pair if it times out or the connection ends before it
    /// completes. Completed pairs are dropped when forwarding finishes.
    async fn monitor_pair(self: Arc<Self>, pair: Arc<StreamPair>) {
        let closed = self.conn.close_token();
        let outcome = with_deadline(
            self.ctx.config.stream_creation_timeout(),
            &closed,
            pair.wait_complete(),
        )
        .await;
        match outcome {
            Outcome::Completed(()) => {}
            Outcome::TimedOut => {
                self.remove_pair(&pair.request_id);
                let message = format!(
                    "(conn={}, request={}) timed out waiting for streams",
                    self.pod_sandbox_id, pair.request_id
                );
                warn!("{}", message);
                pair.print_timeout(&message).await;
            }
            Outcome::Cancelled => self.remove_pair(&pair.request_id),
        }
    }

    async fn forward(self: Arc<Self>, pair: Arc<StreamPair>) {
        let Some((mut data, mut error)) = pair.take() else {
            return;
        };
        let Some(port) = stream_port(data.headers()) else {
            self.remove_pair(&pair.request_id);
            return;
        };

        debug!(pod_sandbox_id = %self.pod_sandbox_id, port, request_id = %pair.request_id, "forwarding port");
        self.ctx.metrics.pair_started();
        let result = self
            .ctx
            .runtime
            .port_forward(&self.pod_sandbox_id, port, &mut data)
            .await;
        self.ctx.metrics.pair_finished();

        if let Err(e) = result {
            let message = format!(
                "error forwarding port {} to pod {}: {}",
                port, self.pod_sandbox_id, e
            );
            warn!("{}", message);
            if let Err(e) = error.write_all(message.as_bytes()).await {
                debug!(error = %e, "failed to write port forward error");
            }
        }
        let _ = error.shutdown().await;
        let _ = data.shutdown().await;
        self.remove_pair(&pair.request_id);
    }
}

/// Upgrade `req` to SPDY and serve port-forward pairs for the sandbox.
pub(super) fn serve(ctx: SessionContext, mut req: Request<Body>, pod_sandbox_id: String) -> Response<Body> {
    let mut headers = HeaderMap::new();
    if let Err(e) = handshake(
        req.headers(),
        &mut headers,
        &ctx.config.supported_port_forward_protocols,
    ) {
        debug!(error = %e, "port forward negotiation failed");
        return e.into_response();
    }

    let options = ConnectionOptions {
        idle_timeout: Some(ctx.config.stream_idle_timeout()),
        ping_period: ctx.config.ping_period(),
        ..Default::default()
    }
    .with_filter(validate_stream_headers);
    let (response, pending) = match upgrade_response(&mut req, headers, options) {
        Ok(upgrade) => upgrade,
        Err(response) => return response,
    };

    tokio::spawn(async move {
        let Some((conn, incoming)) = pending.establish().await else {
            return;
        };
        let metrics = ctx.metrics.clone();
        let mut guard = metrics.session_started("portforward");
        info!(pod_sandbox_id = %pod_sandbox_id, "port forward session started");

        let session = Arc::new(PortForwardSession {
            ctx,
            conn: conn.clone(),
            pod_sandbox_id,
            pairs: Mutex::new(HashMap::new()),
        });
        session.clone().run(incoming).await;
        conn.close().await;
        guard.set_outcome("success");
        info!(pod_sandbox_id = %session.pod_sandbox_id, "port forward session finished");
    });
    response
}
