//! Port forwarding into pod sandboxes.

mod httpstream;
mod websocket;

use http::{Request, Response};
use hyper::Body;

use super::remotecommand::Transport;
use super::SessionContext;

/// Upgrade `req` and forward ports into `pod_sandbox_id` on a background
/// task.
pub fn serve(ctx: SessionContext, req: Request<Body>, pod_sandbox_id: String) -> Response<Body> {
    match Transport::select(req.headers()) {
        Transport::Spdy => httpstream::serve(ctx, req, pod_sandbox_id),
        Transport::WebSocket => websocket::serve(ctx, req, pod_sandbox_id),
    }
}
