//! Prometheus metrics for the streaming server.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use berth_core::error::{BerthError, Result};

/// Streaming server metrics, registered on a registry owned by this object.
pub struct StreamingMetrics {
    registry: Registry,
    tokens_issued: IntCounterVec,
    cache_rejections: IntCounter,
    active_sessions: IntGaugeVec,
    sessions_finished: IntCounterVec,
    active_port_forward_pairs: IntGauge,
}

fn metrics_error(e: prometheus::Error) -> BerthError {
    BerthError::Other(format!("metrics: {}", e))
}

impl StreamingMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("berth_streaming".to_string()), None)
            .map_err(metrics_error)?;

        let tokens_issued = IntCounterVec::new(
            Opts::new("tokens_issued_total", "Streaming URLs issued"),
            &["method"],
        )
        .map_err(metrics_error)?;
        let cache_rejections = IntCounter::with_opts(Opts::new(
            "token_cache_rejections_total",
            "Requests refused because the token cache was full",
        ))
        .map_err(metrics_error)?;
        let active_sessions = IntGaugeVec::new(
            Opts::new("active_sessions", "Upgraded sessions currently running"),
            &["method"],
        )
        .map_err(metrics_error)?;
        let sessions_finished = IntCounterVec::new(
            Opts::new("sessions_finished_total", "Sessions finished by outcome"),
            &["method", "outcome"],
        )
        .map_err(metrics_error)?;
        let active_port_forward_pairs = IntGauge::with_opts(Opts::new(
            "active_port_forward_pairs",
            "Port-forward stream pairs being forwarded",
        ))
        .map_err(metrics_error)?;

        registry
            .register(Box::new(tokens_issued.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(cache_rejections.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(active_sessions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(sessions_finished.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(active_port_forward_pairs.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            tokens_issued,
            cache_rejections,
            active_sessions,
            sessions_finished,
            active_port_forward_pairs,
        })
    }

    pub fn token_issued(&self, method: &str) {
        self.tokens_issued.with_label_values(&[method]).inc();
    }

    pub fn cache_rejected(&self) {
        self.cache_rejections.inc();
    }

    /// Count a session as active until the returned guard is dropped.
    pub fn session_started(&self, method: &'static str) -> SessionGuard<'_> {
        self.active_sessions.with_label_values(&[method]).inc();
        SessionGuard {
            metrics: self,
            method,
            outcome: "aborted",
        }
    }

    pub fn pair_started(&self) {
        self.active_port_forward_pairs.inc();
    }

    pub fn pair_finished(&self) {
        self.active_port_forward_pairs.dec();
    }

    /// Render every metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metrics_error)?;
        String::from_utf8(buf).map_err(|e| BerthError::Other(e.to_string()))
    }
}

/// Tracks one active session; records its outcome when dropped.
pub struct SessionGuard<'a> {
    metrics: &'a StreamingMetrics,
    method: &'static str,
    outcome: &'static str,
}

impl SessionGuard<'_> {
    pub fn set_outcome(&mut self, outcome: &'static str) {
        self.outcome = outcome;
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .active_sessions
            .with_label_values(&[self.method])
            .dec();
        self.metrics
            .sessions_finished
            .with_label_values(&[self.method, self.outcome])
            .inc();
    }
}
