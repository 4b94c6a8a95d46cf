//! Session server: issues streaming URLs and serves them.
//!
//! Besides the token endpoints, the router accepts `POST /exec`,
//! `POST /attach` and `POST /portforward` with a JSON request body and
//! answers `{"url": ...}`, so the daemon can hand out URLs without a CRI
//! front end. Every route is also served under the path of the configured
//! base URL.

use std::convert::Infallible;
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use hyper::body::HttpBody;
use hyper::Body;
use serde::de::DeserializeOwned;
use tonic::Status;
use tracing::debug;

use berth_core::config::StreamingConfig;
use berth_core::error::{BerthError, Result};

use super::cache::RequestCache;
use super::remotecommand::{self, RemoteCommand};
use super::request::{
    AttachRequest, AttachResponse, ExecRequest, ExecResponse, PortForwardRequest,
    PortForwardResponse, StreamOptions, StreamRequest,
};
use super::runtime::Runtime;
use super::{portforward, SessionContext};
use crate::error::{berth_error_to_response, berth_error_to_status, status_to_http};
use crate::metrics::StreamingMetrics;

const MAX_ISSUE_BODY: usize = 64 * 1024;

/// Issues single-use streaming URLs and serves the endpoints behind them.
pub struct StreamingServer {
    ctx: SessionContext,
    cache: RequestCache<StreamRequest>,
    base_url: String,
    /// Path of `base_url` without a trailing slash; empty at the root.
    base_path: String,
}

impl StreamingServer {
    /// Create a server. Fails if `config` is unusable.
    pub fn new(
        config: StreamingConfig,
        runtime: Arc<dyn Runtime>,
        metrics: Arc<StreamingMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = RequestCache::new(config.request_cache_ttl(), config.max_in_flight);
        let base_url = config.base_url();
        let base_path = base_url
            .parse::<Uri>()
            .map_err(|e| BerthError::Config(format!("invalid base_url {:?}: {}", base_url, e)))?
            .path()
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            ctx: SessionContext {
                config: Arc::new(config),
                runtime,
                metrics,
            },
            cache,
            base_url,
            base_path,
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> &StreamingMetrics {
        &self.ctx.metrics
    }

    /// Park `request` and return the URL that redeems it.
    fn issue(&self, request: StreamRequest) -> std::result::Result<String, Status> {
        let method = request.method();
        match self.cache.insert(request) {
            Ok(token) => {
                self.ctx.metrics.token_issued(method);
                Ok(format!("{}/{}/{}", self.base_url, method, token))
            }
            Err(e) => {
                if let BerthError::TooManyInFlight = e {
                    self.ctx.metrics.cache_rejected();
                    debug!(method, "streaming request cache is full");
                }
                Err(berth_error_to_status(e))
            }
        }
    }

    pub fn get_exec(&self, req: ExecRequest) -> std::result::Result<ExecResponse, Status> {
        let url = self.issue(StreamRequest::Exec(req))?;
        Ok(ExecResponse { url })
    }

    pub fn get_attach(&self, req: AttachRequest) -> std::result::Result<AttachResponse, Status> {
        let url = self.issue(StreamRequest::Attach(req))?;
        Ok(AttachResponse { url })
    }

    pub fn get_port_forward(
        &self,
        req: PortForwardRequest,
    ) -> std::result::Result<PortForwardResponse, Status> {
        if req.pod_sandbox_id.is_empty() {
            return Err(berth_error_to_status(BerthError::InvalidArgument(
                "missing required pod_sandbox_id".to_string(),
            )));
        }
        let url = self.issue(StreamRequest::PortForward(req))?;
        Ok(PortForwardResponse { url })
    }

    fn not_found(&self, token: &str) -> Response<Body> {
        let err = BerthError::NotFound(format!("streaming request {:?}", token));
        berth_error_to_response(&err, self.cache.ttl())
    }

    pub fn serve_exec(&self, req: Request<Body>, token: &str) -> Response<Body> {
        match self.cache.consume(token) {
            Some(StreamRequest::Exec(exec)) => {
                let opts = StreamOptions::from(&exec);
                let command = RemoteCommand::Exec {
                    container_id: exec.container_id,
                    cmd: exec.cmd,
                };
                remotecommand::serve(self.ctx.clone(), req, command, opts)
            }
            _ => self.not_found(token),
        }
    }

    pub fn serve_attach(&self, req: Request<Body>, token: &str) -> Response<Body> {
        match self.cache.consume(token) {
            Some(StreamRequest::Attach(attach)) => {
                let opts = StreamOptions::from(&attach);
                let command = RemoteCommand::Attach {
                    container_id: attach.container_id,
                };
                remotecommand::serve(self.ctx.clone(), req, command, opts)
            }
            _ => self.not_found(token),
        }
    }

    pub fn serve_port_forward(&self, req: Request<Body>, token: &str) -> Response<Body> {
        match self.cache.consume(token) {
            Some(StreamRequest::PortForward(pf)) => {
                portforward::serve(self.ctx.clone(), req, pf.pod_sandbox_id)
            }
            _ => self.not_found(token),
        }
    }

    fn serve_metrics(&self) -> Response<Body> {
        match self.ctx.metrics.render() {
            Ok(text) => {
                let mut response = Response::new(Body::from(text));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => berth_error_to_response(&e, self.cache.ttl()),
        }
    }

    /// Decode a JSON request body, issue a URL for it and answer
    /// `{"url": ...}`.
    async fn issue_from_body<T, F>(&self, req: Request<Body>, get_url: F) -> Response<Body>
    where
        T: DeserializeOwned,
        F: FnOnce(&Self, T) -> std::result::Result<String, Status>,
    {
        let mut body = req.into_body();
        let mut raw = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    return text_response(
                        StatusCode::BAD_REQUEST,
                        format!("failed to read request body: {}", e),
                    )
                }
            };
            if raw.len() + chunk.len() > MAX_ISSUE_BODY {
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            raw.extend_from_slice(&chunk);
        }
        let request: T = match serde_json::from_slice(&raw) {
            Ok(request) => request,
            Err(e) => {
                return text_response(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e))
            }
        };
        match get_url(self, request) {
            Ok(url) => {
                let mut response = Response::new(Body::from(serde_json::json!({ "url": url }).to_string()));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(status) => text_response(status_to_http(status.code()), status.message().to_string()),
        }
    }

    /// Strip the base URL's path, if the request carries it.
    fn route_path<'a>(&self, path: &'a str) -> &'a str {
        if self.base_path.is_empty() {
            return path;
        }
        match path.strip_prefix(self.base_path.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        }
    }

    /// Route one HTTP request.
    pub async fn handle(self: Arc<Self>, req: Request<Body>) -> std::result::Result<Response<Body>, Infallible> {
        let path = self.route_path(req.uri().path()).to_string();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        let method = req.method().clone();
        let streaming = method == Method::GET || method == Method::POST;
        let response = match segments.as_slice() {
            ["metrics"] if method == Method::GET => self.serve_metrics(),
            ["exec"] if method == Method::POST => {
                self.issue_from_body(req, |server, body| server.get_exec(body).map(|r| r.url))
                    .await
            }
            ["attach"] if method == Method::POST => {
                self.issue_from_body(req, |server, body| server.get_attach(body).map(|r| r.url))
                    .await
            }
            ["portforward"] if method == Method::POST => {
                self.issue_from_body(req, |server, body| {
                    server.get_port_forward(body).map(|r| r.url)
                })
                .await
            }
            ["exec", token] if streaming => self.serve_exec(req, token),
            ["attach", token] if streaming => self.serve_attach(req, token),
            ["portforward", token] if streaming => self.serve_port_forward(req, token),
            ["exec" | "attach" | "portforward"] | ["exec" | "attach" | "portforward", _] | ["metrics"] => {
                status_response(StatusCode::METHOD_NOT_ALLOWED)
            }
            _ => status_response(StatusCode::NOT_FOUND),
        };
        Ok(response)
    }
}

fn text_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

fn status_response(status: StatusCode) -> Response<Body> {
    text_response(
        status,
        status.canonical_reason().unwrap_or_default().to_string(),
    )
}
