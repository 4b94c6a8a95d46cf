//! HTTP listener for the streaming endpoints.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tokio::net::TcpListener;

use berth_core::error::{BerthError, Result};

use crate::streaming::StreamingServer;

/// A bound TCP listener serving a `StreamingServer`.
pub struct StreamingListener {
    listener: TcpListener,
    server: Arc<StreamingServer>,
}

impl StreamingListener {
    /// Bind the address from the server's configuration.
    pub async fn bind(server: Arc<StreamingServer>) -> Result<Self> {
        let addr = server.config().addr;
        Self::bind_addr(server, addr).await
    }

    pub async fn bind_addr(server: Arc<StreamingServer>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, server })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves. Upgraded sessions keep running on
    /// their own tasks.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        let incoming = AddrIncoming::from_listener(self.listener)
            .map_err(|e| BerthError::Other(format!("listener: {}", e)))?;

        let server = self.server;
        let make_svc = make_service_fn(move |_conn| {
            let server = server.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| server.clone().handle(req)))
            }
        });

        tracing::info!(addr = %addr, "CRI streaming server listening");
        Server::builder(incoming)
            .serve(make_svc)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| BerthError::Other(format!("streaming server: {}", e)))
    }
}
