//! SPDY/3.1 session multiplexing byte streams over one connection.
//!
//! A connection runs a reader task, a writer task and, when idle or ping
//! timers are configured, a keepalive task. Peer-opened streams are handed
//! to the owner through a bounded queue; the SYN_REPLY acknowledging each
//! one is queued before the stream is delivered, and the stream exposes a
//! signal that fires once that reply is on the wire.
//!
//! WINDOW_UPDATE and SETTINGS are read and ignored. Inbound data is
//! queued per stream in a bounded buffer instead; when a stream's buffer
//! is full the reader task waits, so a consumer that stops reading holds
//! back the whole connection rather than growing memory. Data for streams
//! whose read side was closed with `Stream::close_read` is discarded.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{
    rst, Frame, FrameError, SpdyDecoder, SpdyEncoder, FLAG_FIN, MAX_DATA_PAYLOAD,
};
use crate::streaming::pipe::{inbound_channel, InboundPipe, OutboundPipe};

const WRITE_QUEUE_DEPTH: usize = 64;
const DEFAULT_ACCEPT_QUEUE: usize = 32;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which end of the connection we are. Servers allocate even stream ids,
/// clients odd ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_local_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn is_peer_id(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 0,
            Role::Server => id % 2 == 1,
        }
    }
}

/// Inspects the headers of a peer-opened stream before it is accepted.
/// An `Err` resets the stream with the returned reason logged.
pub type StreamFilter = Arc<dyn Fn(&HeaderMap) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct ConnectionOptions {
    /// Close the connection after this long without stream activity.
    pub idle_timeout: Option<Duration>,
    /// Send a PING this often.
    pub ping_period: Option<Duration>,
    /// Capacity of the queue of accepted streams awaiting the owner.
    pub accept_queue: usize,
    pub filter: Option<StreamFilter>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            ping_period: None,
            accept_queue: DEFAULT_ACCEPT_QUEUE,
            filter: None,
        }
    }
}

impl ConnectionOptions {
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&HeaderMap) -> Result<(), String> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

enum Outbound {
    Frame(Frame),
    /// Write the frame, then signal the sender.
    Notify(Frame, oneshot::Sender<()>),
    /// Send GOAWAY and shut the transport down.
    Shutdown,
}

#[derive(Default)]
struct StreamState {
    reset: AtomicBool,
    local_fin: AtomicBool,
    remote_fin: AtomicBool,
}

struct StreamSlot {
    inbound: Option<mpsc::Sender<Bytes>>,
    reply: Option<oneshot::Sender<HeaderMap>>,
    state: Arc<StreamState>,
}

struct Shared {
    role: Role,
    out: mpsc::Sender<Outbound>,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    next_stream_id: AtomicU32,
    last_peer_stream_id: AtomicU32,
    going_away: AtomicBool,
    closed: CancellationToken,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    async fn send(&self, msg: Outbound) -> bool {
        self.out.send(msg).await.is_ok()
    }

    async fn reset_stream(&self, stream_id: u32, status: u32) -> bool {
        self.send(Outbound::Frame(Frame::RstStream { stream_id, status }))
            .await
    }

    /// Forget a stream once both directions have finished.
    fn finish_local(&self, stream_id: u32, state: &StreamState) {
        state.local_fin.store(true, Ordering::SeqCst);
        if state.remote_fin.load(Ordering::SeqCst) {
            self.streams.lock().remove(&stream_id);
        }
    }
}

/// Handle to a running SPDY connection. Clones share the session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start a SPDY session over `io`.
    ///
    /// Returns the connection handle and the queue of streams opened by
    /// the peer.
    pub fn new<T>(
        io: T,
        role: Role,
        options: ConnectionOptions,
    ) -> Result<(Connection, mpsc::Receiver<Stream>), FrameError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let encoder = SpdyEncoder::new()?;
        let (read_half, write_half) = tokio::io::split(io);
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(options.accept_queue.max(1));

        let shared = Arc::new(Shared {
            role,
            out: out_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(role.first_local_id()),
            last_peer_stream_id: AtomicU32::new(0),
            going_away: AtomicBool::new(false),
            closed: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
        });

        tokio::spawn(run_writer(
            shared.clone(),
            FramedWrite::new(write_half, encoder),
            out_rx,
        ));
        tokio::spawn(run_reader(
            shared.clone(),
            FramedRead::new(read_half, SpdyDecoder::new()),
            accept_tx,
            options.filter.clone(),
        ));
        if options.idle_timeout.is_some() || options.ping_period.is_some() {
            tokio::spawn(run_keepalive(
                shared.clone(),
                options.idle_timeout,
                options.ping_period,
            ));
        }

        Ok((Connection { shared }, accept_rx))
    }

    /// Open a stream to the peer and wait for its SYN_REPLY.
    pub async fn open_stream(&self, headers: HeaderMap) -> io::Result<Stream> {
        if self.is_closed() || self.shared.going_away.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (in_tx, in_rx) = inbound_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let state = Arc::new(StreamState::default());
        self.shared.streams.lock().insert(
            stream_id,
            StreamSlot {
                inbound: Some(in_tx),
                reply: Some(reply_tx),
                state: state.clone(),
            },
        );

        let syn = Frame::SynStream {
            stream_id,
            associated_id: 0,
            priority: 0,
            flags: 0,
            headers: headers.clone(),
        };
        if !self.shared.send(Outbound::Frame(syn)).await {
            self.shared.streams.lock().remove(&stream_id);
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ));
        }

        tokio::select! {
            reply = reply_rx => match reply {
                Ok(_) => Ok(Stream::new(self.shared.clone(), stream_id, headers, in_rx, state, None)),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("stream {} was reset by peer", stream_id),
                )),
            },
            _ = self.shared.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }

    /// Close gracefully: queued frames are flushed, GOAWAY is sent and the
    /// transport is shut down. Bounded by a timeout.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.shared.out.send(Outbound::Shutdown)).await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.shared.closed.cancelled()).await;
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves when the connection has closed for any reason.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// A token cancelled when the connection closes. Cancelling it does not
    /// close the connection.
    pub fn close_token(&self) -> CancellationToken {
        self.shared.closed.child_token()
    }
}

async fn run_reader<R>(
    shared: Arc<Shared>,
    mut frames: FramedRead<R, SpdyDecoder>,
    accept: mpsc::Sender<Stream>,
    filter: Option<StreamFilter>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = frames.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "SPDY read failed, closing connection");
                break;
            }
            None => {
                debug!("SPDY peer closed the connection");
                break;
            }
        };
        if !matches!(frame, Frame::Ping { .. }) {
            shared.touch();
        }
        if !handle_frame(&shared, frame, &accept, filter.as_ref()).await {
            break;
        }
    }

    shared.closed.cancel();
    // Dropping the slots ends every inbound pipe and fails pending opens.
    let slots: Vec<StreamSlot> = shared.streams.lock().drain().map(|(_, s)| s).collect();
    drop(slots);
}

async fn handle_frame(
    shared: &Arc<Shared>,
    frame: Frame,
    accept: &mpsc::Sender<Stream>,
    filter: Option<&StreamFilter>,
) -> bool {
    match frame {
        Frame::SynStream {
            stream_id,
            flags,
            headers,
            ..
        } => on_syn_stream(shared, stream_id, flags, headers, accept, filter).await,
        Frame::SynReply {
            stream_id,
            flags,
            headers,
        } => {
            let mut streams = shared.streams.lock();
            if let Some(slot) = streams.get_mut(&stream_id) {
                if let Some(reply) = slot.reply.take() {
                    let _ = reply.send(headers);
                }
                if flags & FLAG_FIN != 0 {
                    remote_fin(&mut streams, stream_id);
                }
            }
            true
        }
        Frame::Data {
            stream_id,
            flags,
            data,
        } => {
            let inbound = match shared.streams.lock().get(&stream_id) {
                Some(slot) => slot.inbound.clone(),
                None => {
                    debug!(stream_id, "dropping data for unknown SPDY stream");
                    return true;
                }
            };
            if let (Some(tx), false) = (inbound, data.is_empty()) {
                // Waits while the stream's buffer is full.
                tokio::select! {
                    _ = shared.closed.cancelled() => return false,
                    _ = tx.send(data) => {}
                }
            }
            if flags & FLAG_FIN != 0 {
                remote_fin(&mut shared.streams.lock(), stream_id);
            }
            true
        }
        Frame::RstStream { stream_id, status } => {
            debug!(stream_id, status, "SPDY stream reset by peer");
            if let Some(slot) = shared.streams.lock().remove(&stream_id) {
                slot.state.reset.store(true, Ordering::SeqCst);
            }
            true
        }
        Frame::Ping { id } => {
            if shared.role.is_peer_id(id) {
                shared.send(Outbound::Frame(Frame::Ping { id })).await
            } else {
                true
            }
        }
        Frame::GoAway {
            last_good_stream_id,
            status,
        } => {
            debug!(last_good_stream_id, status, "SPDY peer is going away");
            shared.going_away.store(true, Ordering::SeqCst);
            true
        }
        Frame::Settings { .. } | Frame::WindowUpdate { .. } | Frame::Headers { .. } => true,
    }
}

fn remote_fin(streams: &mut HashMap<u32, StreamSlot>, stream_id: u32) {
    let done = match streams.get_mut(&stream_id) {
        Some(slot) => {
            slot.inbound = None;
            slot.state.remote_fin.store(true, Ordering::SeqCst);
            slot.state.local_fin.load(Ordering::SeqCst)
        }
        None => false,
    };
    if done {
        streams.remove(&stream_id);
    }
}

async fn on_syn_stream(
    shared: &Arc<Shared>,
    stream_id: u32,
    flags: u8,
    headers: HeaderMap,
    accept: &mpsc::Sender<Stream>,
    filter: Option<&StreamFilter>,
) -> bool {
    if stream_id == 0 || !shared.role.is_peer_id(stream_id) {
        warn!(stream_id, "peer opened SPDY stream with an invalid id");
        return shared.reset_stream(stream_id, rst::PROTOCOL_ERROR).await;
    }
    if shared.going_away.load(Ordering::SeqCst) || shared.closed.is_cancelled() {
        return shared.reset_stream(stream_id, rst::REFUSED_STREAM).await;
    }
    if shared.streams.lock().contains_key(&stream_id) {
        warn!(stream_id, "peer reused an open SPDY stream id");
        return shared.reset_stream(stream_id, rst::STREAM_IN_USE).await;
    }
    if let Some(filter) = filter {
        if let Err(reason) = filter(&headers) {
            warn!(stream_id, %reason, "rejecting SPDY stream");
            return shared.reset_stream(stream_id, rst::CANCEL).await;
        }
    }

    // Claim a queue slot first so a stream is never acknowledged and then
    // dropped for lack of a consumer.
    let permit = match accept.try_reserve() {
        Ok(permit) => permit,
        Err(_) => {
            warn!(stream_id, "no consumer for new SPDY stream, refusing it");
            return shared.reset_stream(stream_id, rst::REFUSED_STREAM).await;
        }
    };

    let (in_tx, in_rx) = inbound_channel();
    let state = Arc::new(StreamState::default());
    let remote_done = flags & FLAG_FIN != 0;
    state.remote_fin.store(remote_done, Ordering::SeqCst);
    shared.streams.lock().insert(
        stream_id,
        StreamSlot {
            inbound: (!remote_done).then_some(in_tx),
            reply: None,
            state: state.clone(),
        },
    );
    shared
        .last_peer_stream_id
        .fetch_max(stream_id, Ordering::SeqCst);

    // The reply is queued ahead of anything the owner writes on the stream.
    let (reply_tx, reply_rx) = oneshot::channel();
    let reply = Frame::SynReply {
        stream_id,
        flags: 0,
        headers: HeaderMap::new(),
    };
    if !shared.send(Outbound::Notify(reply, reply_tx)).await {
        return false;
    }

    permit.send(Stream::new(
        shared.clone(),
        stream_id,
        headers,
        in_rx,
        state,
        Some(reply_rx),
    ));
    true
}

async fn run_writer<W>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<W, SpdyEncoder>,
    mut queue: mpsc::Receiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some(next) = next else { break };
        let result = match next {
            Outbound::Frame(frame) => {
                if matches!(frame, Frame::Data { .. }) {
                    shared.touch();
                }
                write_frame(&shared, &mut sink, frame).await
            }
            Outbound::Notify(frame, done) => {
                let result = write_frame(&shared, &mut sink, frame).await;
                if result.is_ok() {
                    let _ = done.send(());
                }
                result
            }
            Outbound::Shutdown => {
                let goaway = Frame::GoAway {
                    last_good_stream_id: shared.last_peer_stream_id.load(Ordering::SeqCst),
                    status: 0,
                };
                if let Err(e) = sink.send(goaway).await {
                    debug!(error = %e, "failed to send SPDY GOAWAY");
                }
                let _ = sink.close().await;
                break;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "SPDY write failed, closing connection");
            break;
        }
    }
    shared.closed.cancel();
}

async fn write_frame<W>(
    shared: &Shared,
    sink: &mut FramedWrite<W, SpdyEncoder>,
    frame: Frame,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        result = sink.send(frame) => result,
        _ = shared.closed.cancelled() => Err(FrameError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "connection closed",
        ))),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_keepalive(
    shared: Arc<Shared>,
    idle_timeout: Option<Duration>,
    ping_period: Option<Duration>,
) {
    let mut pings = ping_period.map(|p| tokio::time::interval_at(Instant::now() + p, p));
    let mut ping_id = shared.role.first_local_id();
    loop {
        let idle_deadline = idle_timeout.map(|t| *shared.last_activity.lock() + t);
        tokio::select! {
            _ = shared.closed.cancelled() => return,
            _ = sleep_until_opt(idle_deadline) => {
                let idle_for = shared.last_activity.lock().elapsed();
                if idle_timeout.map_or(false, |limit| idle_for >= limit) {
                    info!(idle_secs = idle_for.as_secs(), "SPDY connection idle, closing");
                    Connection { shared: shared.clone() }.close().await;
                    return;
                }
            }
            _ = tick_opt(&mut pings) => {
                if !shared.send(Outbound::Frame(Frame::Ping { id: ping_id })).await {
                    return;
                }
                ping_id = ping_id.wrapping_add(2);
            }
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

/// One multiplexed stream. Reads yield the peer's data until it half-closes;
/// `shutdown` sends our FIN.
pub struct Stream {
    id: u32,
    headers: HeaderMap,
    shared: Arc<Shared>,
    state: Arc<StreamState>,
    inbound: InboundPipe,
    outbound: OutboundPipe<Outbound>,
    reply_sent: Option<oneshot::Receiver<()>>,
}

impl Stream {
    fn new(
        shared: Arc<Shared>,
        id: u32,
        headers: HeaderMap,
        inbound: InboundPipe,
        state: Arc<StreamState>,
        reply_sent: Option<oneshot::Receiver<()>>,
    ) -> Self {
        let outbound = OutboundPipe::new(shared.out.clone());
        Self {
            id,
            headers,
            shared,
            state,
            inbound,
            outbound,
            reply_sent,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Headers the stream was opened with.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Resolves once the SYN_REPLY for this stream has been written:
    /// `true` on success, `false` if the connection died first. Streams we
    /// opened resolve immediately.
    pub fn reply_sent(&mut self) -> BoxFuture<'static, bool> {
        match self.reply_sent.take() {
            Some(rx) => async move { rx.await.is_ok() }.boxed(),
            None => futures::future::ready(true).boxed(),
        }
    }

    /// A cloneable handle that can write to this stream from elsewhere.
    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            id: self.id,
            out: self.shared.out.clone(),
            state: self.state.clone(),
        }
    }

    /// Stop accepting data from the peer. Anything it sends afterwards is
    /// discarded and reads see end-of-stream once buffered data is drained.
    pub fn close_read(&self) {
        if let Some(slot) = self.shared.streams.lock().get_mut(&self.id) {
            slot.inbound = None;
        }
    }

    /// Abort the stream with RST_STREAM.
    pub fn reset(&self) {
        if self.state.reset.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.streams.lock().remove(&self.id);
        let _ = self.shared.out.try_send(Outbound::Frame(Frame::RstStream {
            stream_id: self.id,
            status: rst::CANCEL,
        }));
    }

    fn write_closed(&self) -> bool {
        self.state.reset.load(Ordering::SeqCst) || self.state.local_fin.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("headers", &self.headers)
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().inbound.poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_DATA_PAYLOAD);
        let stream_id = this.id;
        ready!(this.outbound.poll_send(cx, || {
            Outbound::Frame(Frame::Data {
                stream_id,
                flags: 0,
                data: Bytes::copy_from_slice(&buf[..n]),
            })
        }))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed() {
            return Poll::Ready(Ok(()));
        }
        let stream_id = this.id;
        ready!(this.outbound.poll_send(cx, || {
            Outbound::Frame(Frame::Data {
                stream_id,
                flags: FLAG_FIN,
                data: Bytes::new(),
            })
        }))?;
        this.shared.finish_local(this.id, &this.state);
        this.outbound.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.state.reset.load(Ordering::SeqCst)
            && !self.state.local_fin.swap(true, Ordering::SeqCst)
            && !self.shared.closed.is_cancelled()
        {
            let _ = self.shared.out.try_send(Outbound::Frame(Frame::Data {
                stream_id: self.id,
                flags: FLAG_FIN,
                data: Bytes::new(),
            }));
        }
        self.shared.streams.lock().remove(&self.id);
    }
}

/// Writes to a stream without owning it. Used for diagnostics on error
/// streams whose owner is busy elsewhere.
#[derive(Clone)]
pub struct StreamWriter {
    id: u32,
    out: mpsc::Sender<Outbound>,
    state: Arc<StreamState>,
}

impl StreamWriter {
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(MAX_DATA_PAYLOAD) {
            if self.state.reset.load(Ordering::SeqCst) || self.state.local_fin.load(Ordering::SeqCst) {
                return Err(broken_pipe());
            }
            let frame = Frame::Data {
                stream_id: self.id,
                flags: 0,
                data: Bytes::copy_from_slice(chunk),
            };
            self.out
                .send(Outbound::Frame(frame))
                .await
                .map_err(|_| broken_pipe())?;
        }
        Ok(())
    }
}
