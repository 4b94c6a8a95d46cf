//! Channel-backed byte pipes behind the multiplexed stream types.

use std::io;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::ReadBuf;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

/// Chunks buffered per stream before the connection's reader task waits
/// for the consumer to catch up.
pub(crate) const INBOUND_QUEUE_DEPTH: usize = 16;

/// Read side fed by the connection's reader task.
///
/// The queue is bounded: a consumer that stops reading stalls the reader
/// task, which in turn stops draining the transport. Dropping the sender
/// is end-of-stream.
pub(crate) struct InboundPipe {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

pub(crate) fn inbound_channel() -> (mpsc::Sender<Bytes>, InboundPipe) {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    (tx, InboundPipe::new(rx))
}

impl InboundPipe {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }

    pub(crate) fn poll_read(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) => self.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Write side feeding the connection's bounded writer queue.
pub(crate) struct OutboundPipe<M: Send + 'static> {
    tx: PollSender<M>,
}

impl<M: Send + 'static> OutboundPipe<M> {
    pub(crate) fn new(tx: mpsc::Sender<M>) -> Self {
        Self {
            tx: PollSender::new(tx),
        }
    }

    /// Wait for queue capacity, then enqueue the message built by `make`.
    pub(crate) fn poll_send(
        &mut self,
        cx: &mut Context<'_>,
        make: impl FnOnce() -> M,
    ) -> Poll<io::Result<()>> {
        ready!(self.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        self.tx.send_item(make()).map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(()))
    }

    pub(crate) fn close(&mut self) {
        self.tx.close();
    }
}
