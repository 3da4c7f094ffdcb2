//! TCP transport.
//!
//! The transport owns a multi-threaded runtime that acts as the shared
//! I/O pool: readers, writers, and accept loops live there. Everything a
//! user can observe — handler invocations, future completions, listeners —
//! is marshalled onto the owning [`Context`]s.
//!
//! A connection is a pair of tasks over a split stream. The writer drains
//! an ordered queue, which is what "accepted by the channel" means for the
//! pending-insert ordering: once the queue has taken a request frame, no
//! response can arrive before the pending entry exists, and a request that
//! the queue refused is failed without ever inserting.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{self, Handle, Runtime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::buffer_pool::BufferPool;
use crate::codec::{
    self, KIND_CONNECT, KIND_REQUEST, KIND_RESPONSE, STATUS_FAILURE, STATUS_SUCCESS,
};
use crate::connection::{
    box_handler, Connection, HandlerHolder, HandlerMap, ListenerHandle, Listeners, ResponseFuture,
};
use crate::context::{Context, Scheduled};
use crate::error::{Error, Fault};
use crate::serializer::{BoxedValue, Serializer};
use crate::transport::{Client, Server, Transport};

/// How long a request may wait for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Period of the timeout reaper tick.
const REAP_INTERVAL: Duration = Duration::from_millis(250);

/// How long an outbound connect may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn runtime_gone() -> Error {
    Error::Transport(Arc::new(io::Error::new(
        io::ErrorKind::Other,
        "transport runtime unavailable",
    )))
}

fn configure_socket(stream: &TcpStream) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(error = %error, "set_nodelay failed");
    }
    if let Err(error) = socket2::SockRef::from(stream).set_keepalive(true) {
        debug!(error = %error, "set_keepalive failed");
    }
}

fn encode_connect(id: &str) -> Result<Bytes, Error> {
    let mut body = Vec::with_capacity(5 + id.len());
    body.push(KIND_CONNECT);
    body.extend_from_slice(&(id.len() as u32).to_be_bytes());
    body.extend_from_slice(id.as_bytes());
    codec::encode(&body)
}

fn parse_connect(mut frame: Bytes) -> Result<String, Error> {
    if frame.is_empty() || frame.get_u8() != KIND_CONNECT {
        return Err(Error::Protocol("expected a CONNECT frame".into()));
    }
    if frame.len() < 4 {
        return Err(Error::Protocol("truncated CONNECT frame".into()));
    }
    let len = frame.get_u32() as usize;
    if frame.len() != len {
        return Err(Error::Protocol("CONNECT identifier length mismatch".into()));
    }
    String::from_utf8(frame.to_vec())
        .map_err(|_| Error::Protocol("CONNECT identifier is not utf-8".into()))
}

/// Record `conn` in a connection set and take it back out when it closes.
fn track(connections: &Arc<Mutex<Vec<TcpConnection>>>, conn: &TcpConnection) {
    connections.lock().push(conn.clone());
    let connections = Arc::downgrade(connections);
    let target = Arc::as_ptr(&conn.inner) as usize;
    let _ = conn.close_listener(move || {
        if let Some(connections) = connections.upgrade() {
            connections
                .lock()
                .retain(|c| Arc::as_ptr(&c.inner) as usize != target);
        }
    });
}

// ---------------------------------------------------------------------------
// Channel plumbing
// ---------------------------------------------------------------------------

enum WriteCommand {
    Frame(Bytes),
    Shutdown,
}

/// Write side of a connection's channel: an ordered queue into the writer
/// task.
#[derive(Clone)]
struct Channel {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl Channel {
    fn send(&self, frame: Bytes) -> Result<(), Error> {
        self.tx
            .send(WriteCommand::Frame(frame))
            .map_err(|_| Error::Closed)
    }

    fn shutdown(&self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
    }
}

async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    mut writer: OwnedWriteHalf,
    conn: Weak<ConnInner>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Frame(frame) => {
                if let Err(error) = writer.write_all(&frame).await {
                    if let Some(conn) = conn.upgrade() {
                        conn.handle_exception(Error::from(error));
                        conn.finish_close();
                    }
                    break;
                }
            }
            WriteCommand::Shutdown => {
                // In-flight frames were drained in order before this
                // command, which is the close-after-pending-writes rule.
                let _ = writer.shutdown().await;
                if let Some(conn) = conn.upgrade() {
                    conn.finish_close();
                }
                break;
            }
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, mut buf: BytesMut, conn: Arc<ConnInner>) {
    loop {
        loop {
            match codec::decode(&mut buf) {
                Ok(Some(frame)) => conn.handle_frame(frame),
                Ok(None) => break,
                Err(error) => {
                    conn.handle_exception(error);
                    conn.channel.shutdown();
                    conn.handle_closed();
                    return;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                conn.channel.shutdown();
                conn.handle_closed();
                return;
            }
            Ok(_) => {}
            Err(error) => {
                if !conn.closed.load(Ordering::Acquire) {
                    conn.handle_exception(Error::from(error));
                }
                conn.channel.shutdown();
                conn.handle_closed();
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// An established duplex channel to one peer.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<ConnInner>,
}

pub(crate) struct ConnectionParams {
    pub(crate) stream: TcpStream,
    pub(crate) context: Context,
    pub(crate) serializer: Serializer,
    pub(crate) pool: BufferPool,
    pub(crate) io: Handle,
    pub(crate) peer_id: Option<String>,
    pub(crate) connect_frame: Option<Bytes>,
    pub(crate) residual: BytesMut,
}

struct PendingEntry {
    tx: oneshot::Sender<Result<BoxedValue, Error>>,
    enqueued: Instant,
    context: Context,
}

fn complete_pending(entry: PendingEntry, outcome: Result<BoxedValue, Error>) {
    let PendingEntry { tx, context, .. } = entry;
    context.execute(move || {
        let _ = tx.send(outcome);
    });
}

struct ConnInner {
    context: Context,
    serializer: Serializer,
    pool: BufferPool,
    channel: Channel,
    peer_id: Option<String>,
    handlers: HandlerMap,
    /// Keyed by monotonic request id, so iteration order is insertion
    /// order and the reaper can stop at the first live entry.
    pending: Mutex<BTreeMap<u64, PendingEntry>>,
    next_request_id: AtomicU64,
    exception_listeners: Listeners<Error>,
    close_listeners: Listeners<()>,
    failure: Mutex<Option<Error>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    reap: Mutex<Option<Scheduled>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    pub(crate) fn spawn(params: ConnectionParams) -> TcpConnection {
        let (read_half, write_half) = params.stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(ConnInner {
            context: params.context.clone(),
            serializer: params.serializer,
            pool: params.pool,
            channel: Channel { tx },
            peer_id: params.peer_id,
            handlers: HandlerMap::new(),
            pending: Mutex::new(BTreeMap::new()),
            next_request_id: AtomicU64::new(0),
            exception_listeners: Listeners::new(),
            close_listeners: Listeners::new(),
            failure: Mutex::new(None),
            closed: AtomicBool::new(false),
            closed_tx,
            reap: Mutex::new(None),
            reader: Mutex::new(None),
        });

        if let Some(frame) = params.connect_frame {
            let _ = inner.channel.send(frame);
        }

        let _ = params
            .io
            .spawn(write_loop(rx, write_half, Arc::downgrade(&inner)));
        let reader = params
            .io
            .spawn(read_loop(read_half, params.residual, inner.clone()));
        *inner.reader.lock() = Some(reader);

        let weak = Arc::downgrade(&inner);
        let scheduled = params.context.schedule(REAP_INTERVAL, REAP_INTERVAL, move || {
            if let Some(inner) = weak.upgrade() {
                inner.reap();
            }
        });
        *inner.reap.lock() = Some(scheduled);

        TcpConnection { inner }
    }

    /// The identifier the peer presented in its CONNECT handshake.
    /// Present on server-side connections only.
    pub fn peer_id(&self) -> Option<&str> {
        self.inner.peer_id.as_deref()
    }
}

impl ConnInner {
    fn latched_error(&self) -> Option<Error> {
        if let Some(error) = self.failure.lock().clone() {
            return Some(error);
        }
        if self.closed.load(Ordering::Acquire) {
            return Some(Error::Closed);
        }
        None
    }

    fn encode_request(&self, id: u64, value: &dyn Any) -> Result<Bytes, Error> {
        let mut body = self.pool.get();
        body.push(KIND_REQUEST);
        body.extend_from_slice(&id.to_be_bytes());
        self.serializer.write_object(value, &mut body)?;
        codec::encode(&body)
    }

    fn encode_response(&self, id: u64, result: &Result<BoxedValue, Error>) -> Result<Bytes, Error> {
        let mut body = self.pool.get();
        body.push(KIND_RESPONSE);
        body.extend_from_slice(&id.to_be_bytes());
        match result {
            Ok(value) => {
                body.push(STATUS_SUCCESS);
                self.serializer.write_object(value.as_ref(), &mut body)?;
            }
            Err(error) => {
                body.push(STATUS_FAILURE);
                Fault::from_error(error).write(&mut body)?;
            }
        }
        codec::encode(&body)
    }

    /// Entry point for the I/O thread: exactly one complete frame.
    fn handle_frame(self: &Arc<Self>, mut frame: Bytes) {
        if frame.is_empty() {
            self.fatal(Error::Protocol("empty frame body".into()));
            return;
        }
        match frame.get_u8() {
            KIND_REQUEST => self.handle_request(frame),
            KIND_RESPONSE => self.handle_response(frame),
            kind => self.fatal(Error::Protocol(format!(
                "unexpected kind byte {kind:#04x}"
            ))),
        }
    }

    fn handle_request(self: &Arc<Self>, mut frame: Bytes) {
        if frame.len() < 8 {
            self.fatal(Error::Protocol("truncated request".into()));
            return;
        }
        let id = frame.get_u64();
        match self.serializer.read_object(&mut frame) {
            Ok((key, value)) => match self.handlers.get(key) {
                Some(holder) => {
                    let conn = self.clone();
                    let handler = holder.handler.clone();
                    let _ = holder.context.spawn(async move {
                        let result = handler(value).await;
                        conn.respond(id, result);
                    });
                }
                None => {
                    debug!(id, %key, "request without a handler");
                    self.respond(id, Err(Error::UnknownType(key)));
                }
            },
            Err(Error::UnknownType(key)) => {
                debug!(id, %key, "request with an unregistered type key");
                self.respond(id, Err(Error::UnknownType(key)));
            }
            // A body the serializer cannot decode fails that request
            // alone; only wire-level damage is fatal for the channel.
            Err(error @ Error::Codec(_)) => {
                debug!(id, error = %error, "undecodable request body");
                self.respond(id, Err(error));
            }
            Err(error) => self.fatal(error),
        }
    }

    /// Serialize and send a response on the owning context.
    fn respond(self: &Arc<Self>, id: u64, result: Result<BoxedValue, Error>) {
        let conn = self.clone();
        self.context.execute(move || {
            let frame = conn.encode_response(id, &result).or_else(|encode_error| {
                warn!(id, error = %encode_error, "failed to serialize response");
                conn.encode_response(id, &Err::<BoxedValue, _>(encode_error))
            });
            match frame {
                Ok(frame) => {
                    if conn.channel.send(frame).is_err() {
                        debug!(id, "response dropped: channel closed");
                    }
                }
                Err(error) => {
                    warn!(id, error = %error, "failed to serialize failure response")
                }
            }
        });
    }

    fn handle_response(&self, mut frame: Bytes) {
        if frame.len() < 9 {
            self.fatal(Error::Protocol("truncated response".into()));
            return;
        }
        let id = frame.get_u64();
        let status = frame.get_u8();

        let entry = self.pending.lock().remove(&id);
        let Some(entry) = entry else {
            // Timed out or surfaced at close before the response landed.
            trace!(id, "response without a pending entry");
            return;
        };

        let outcome = match status {
            STATUS_SUCCESS => self.serializer.read_object(&mut frame).map(|(_, value)| value),
            STATUS_FAILURE => match Fault::read(&frame) {
                Ok(fault) => Err(fault.into_error()),
                Err(error) => Err(error),
            },
            other => {
                let error = Error::Protocol(format!("unknown status byte {other:#04x}"));
                complete_pending(entry, Err(error.clone()));
                self.fatal(error);
                return;
            }
        };
        complete_pending(entry, outcome);
    }

    /// Fail expired entries, oldest first, stopping at the first one still
    /// inside the timeout window.
    fn reap(&self) {
        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock();
            let now = Instant::now();
            while let Some(entry) = pending.first_entry() {
                if now.duration_since(entry.get().enqueued) > REQUEST_TIMEOUT {
                    expired.push(entry.remove());
                } else {
                    break;
                }
            }
        }
        for entry in expired {
            complete_pending(entry, Err(Error::Timeout));
        }
    }

    fn drain_pending(&self) -> Vec<PendingEntry> {
        let mut pending = self.pending.lock();
        std::mem::take(&mut *pending).into_values().collect()
    }

    fn handle_exception(&self, error: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                return;
            }
            *failure = Some(error.clone());
        }
        warn!(error = %error, "connection failure");
        for entry in self.drain_pending() {
            complete_pending(entry, Err(error.clone()));
        }
        self.exception_listeners.notify(&error);
    }

    fn handle_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("connection closed");
        for entry in self.drain_pending() {
            complete_pending(entry, Err(Error::Closed));
        }
        self.close_listeners.notify(&());
        if let Some(scheduled) = self.reap.lock().take() {
            scheduled.cancel();
        }
        let _ = self.closed_tx.send(true);
    }

    /// Tear down after a channel-fatal error.
    fn fatal(&self, error: Error) {
        self.handle_exception(error);
        self.channel.shutdown();
        self.handle_closed();
    }

    fn finish_close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.handle_closed();
    }
}

impl Connection for TcpConnection {
    fn send<T, U>(&self, request: T) -> ResponseFuture<U>
    where
        T: Any + Send + 'static,
        U: Any + Send + 'static,
    {
        let caller = match Context::current_or("send requires a context") {
            Ok(context) => context,
            Err(error) => return ResponseFuture::failed(error),
        };
        if let Some(error) = self.inner.latched_error() {
            return ResponseFuture::failed(error);
        }

        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let value: BoxedValue = Box::new(request);
        let inner = self.inner.clone();

        self.inner.context.execute(move || {
            match inner.encode_request(id, value.as_ref()) {
                Ok(frame) => {
                    // The insert happens only once the channel has accepted
                    // the write, and under the pending lock so the response
                    // path cannot observe the gap between the two.
                    let mut pending = inner.pending.lock();
                    if inner.channel.send(frame).is_ok() {
                        pending.insert(
                            id,
                            PendingEntry {
                                tx,
                                enqueued: Instant::now(),
                                context: caller,
                            },
                        );
                        drop(pending);
                        // A teardown may have drained `pending` before the
                        // insert; sweep so the entry cannot be stranded.
                        if let Some(error) = inner.latched_error() {
                            if let Some(entry) = inner.pending.lock().remove(&id) {
                                complete_pending(entry, Err(error));
                            }
                        }
                    } else {
                        drop(pending);
                        let error = inner.latched_error().unwrap_or(Error::Closed);
                        let _ = tx.send(Err(error));
                    }
                }
                Err(error) => {
                    let _ = tx.send(Err(error));
                }
            }
        });

        ResponseFuture::new(rx)
    }

    fn handler<T, U, H, Fut>(&self, handler: H) -> &Self
    where
        T: Any + Send + 'static,
        U: Any + Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, Error>> + Send + 'static,
    {
        let context = Context::current().expect("handler registration requires a context");
        let Some(key) = self.inner.serializer.key_for::<T>() else {
            panic!(
                "no type key registered for {}",
                std::any::type_name::<T>()
            );
        };
        self.inner.handlers.insert(
            key,
            HandlerHolder {
                handler: box_handler(handler),
                context,
            },
        );
        self
    }

    fn remove_handler<T: Any>(&self) -> &Self {
        if let Some(key) = self.inner.serializer.key_for::<T>() {
            self.inner.handlers.remove(key);
        }
        self
    }

    fn exception_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        if let Some(error) = self.inner.failure.lock().clone() {
            listener(&error);
        }
        self.inner.exception_listeners.add(listener)
    }

    fn close_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            listener();
        }
        self.inner.close_listeners.add(move |_: &()| listener())
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            let mut closed_rx = inner.closed_tx.subscribe();
            inner.channel.shutdown();
            loop {
                if *closed_rx.borrow_and_update() {
                    return;
                }
                if closed_rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Initiates outbound TCP connections.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: String,
    io: Handle,
    serializer: Serializer,
    pool: BufferPool,
    connections: Arc<Mutex<Vec<TcpConnection>>>,
}

impl TcpClient {
    fn new(id: String, io: Handle, serializer: Serializer, pool: BufferPool) -> TcpClient {
        TcpClient {
            inner: Arc::new(ClientInner {
                id,
                io,
                serializer,
                pool,
                connections: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }
}

impl Client for TcpClient {
    type Connection = TcpConnection;

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn connect(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<TcpConnection, Error>> + Send {
        let inner = self.inner.clone();
        let address = address.clone();
        async move {
            let context = Context::current_or("connect requires a context")?;
            let addr = address.socket_addr()?;
            info!(address = %address, client = %inner.id, "connecting");

            let stream = inner
                .io
                .spawn(async move {
                    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                        Ok(result) => result,
                        Err(_) => Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connect timed out",
                        )),
                    }
                })
                .await
                .map_err(|_| runtime_gone())??;

            configure_socket(&stream);
            let connect_frame = encode_connect(&inner.id)?;

            let conn = TcpConnection::spawn(ConnectionParams {
                stream,
                context,
                serializer: inner.serializer.clone(),
                pool: inner.pool.clone(),
                io: inner.io.clone(),
                peer_id: None,
                connect_frame: Some(connect_frame),
                residual: BytesMut::with_capacity(8 * 1024),
            });
            track(&inner.connections, &conn);
            debug!(address = %address, "connected");
            Ok(conn)
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            let conns: Vec<TcpConnection> = inner.connections.lock().drain(..).collect();
            for conn in conns {
                conn.close().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

type AcceptFn = Arc<dyn Fn(TcpConnection) + Send + Sync>;
type ListenShared = Shared<BoxFuture<'static, Result<(), Error>>>;

/// Accepts inbound TCP connections.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    id: String,
    io: Handle,
    serializer: Serializer,
    pool: BufferPool,
    connections: Arc<Mutex<Vec<TcpConnection>>>,
    listen: Mutex<Option<ListenShared>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    fn new(id: String, io: Handle, serializer: Serializer, pool: BufferPool) -> TcpServer {
        TcpServer {
            inner: Arc::new(ServerInner {
                id,
                io,
                serializer,
                pool,
                connections: Arc::new(Mutex::new(Vec::new())),
                listen: Mutex::new(None),
                accept_task: Mutex::new(None),
            }),
        }
    }
}

async fn bind(
    inner: Arc<ServerInner>,
    address: Address,
    accept: AcceptFn,
    context: Context,
) -> Result<(), Error> {
    let addr = address
        .socket_addr()
        .map_err(|e| Error::Bind(Arc::new(e)))?;
    let listener = inner
        .io
        .spawn(async move { TcpListener::bind(addr).await })
        .await
        .map_err(|_| runtime_gone())?
        .map_err(|e| Error::Bind(Arc::new(e)))?;
    info!(address = %address, server = %inner.id, "listening");

    let task = inner
        .io
        .spawn(accept_loop(inner.clone(), listener, accept, context));
    *inner.accept_task.lock() = Some(task);
    Ok(())
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    accept: AcceptFn,
    context: Context,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "inbound channel");
                let inner = inner.clone();
                let accept = accept.clone();
                let context = context.clone();
                let _ = tokio::spawn(async move {
                    if let Err(error) = handshake(inner, stream, accept, context).await {
                        debug!(error = %error, "handshake failed");
                    }
                });
            }
            Err(error) => {
                warn!(error = %error, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Consume the CONNECT frame from a fresh inbound channel and promote it
/// to a connection. A malformed CONNECT drops the channel.
async fn handshake(
    inner: Arc<ServerInner>,
    mut stream: TcpStream,
    accept: AcceptFn,
    context: Context,
) -> Result<(), Error> {
    configure_socket(&stream);

    let mut buf = BytesMut::with_capacity(256);
    let frame = loop {
        if let Some(frame) = codec::decode(&mut buf)? {
            break frame;
        }
        if stream.read_buf(&mut buf).await.map_err(Error::from)? == 0 {
            return Err(Error::Closed);
        }
    };
    let peer_id = parse_connect(frame)?;
    debug!(peer_id = %peer_id, "handshake complete");

    let conn = TcpConnection::spawn(ConnectionParams {
        stream,
        context: context.clone(),
        serializer: inner.serializer.clone(),
        pool: inner.pool.clone(),
        io: inner.io.clone(),
        peer_id: Some(peer_id),
        connect_frame: None,
        // The client may have pipelined requests behind its CONNECT.
        residual: buf,
    });
    track(&inner.connections, &conn);

    let callback_conn = conn.clone();
    context.execute(move || accept(callback_conn));
    Ok(())
}

impl Server for TcpServer {
    type Connection = TcpConnection;

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn listen<F>(
        &self,
        address: &Address,
        accept: F,
    ) -> impl Future<Output = Result<(), Error>> + Send
    where
        F: Fn(TcpConnection) + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let address = address.clone();
        async move {
            let context = Context::current_or("listen requires a context")?;
            let shared = {
                let mut slot = inner.listen.lock();
                match slot.as_ref() {
                    Some(existing) => existing.clone(),
                    None => {
                        let accept: AcceptFn = Arc::new(accept);
                        let fut = bind(inner.clone(), address, accept, context)
                            .boxed()
                            .shared();
                        *slot = Some(fut.clone());
                        fut
                    }
                }
            };
            shared.await
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            if let Some(task) = inner.accept_task.lock().take() {
                task.abort();
            }
            let conns: Vec<TcpConnection> = inner.connections.lock().drain(..).collect();
            for conn in conns {
                conn.close().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Factory for TCP clients and servers sharing one I/O pool.
pub struct TcpTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    runtime: Mutex<Option<Runtime>>,
    io: Handle,
    serializer: Serializer,
    pool: BufferPool,
    clients: Mutex<HashMap<String, TcpClient>>,
    servers: Mutex<HashMap<String, TcpServer>>,
}

impl TcpTransport {
    /// A transport whose I/O pool is sized to the host's parallelism.
    pub fn new() -> TcpTransport {
        Self::build(default_threads(), Serializer::default())
            .expect("default thread count is positive")
    }

    /// A transport with an explicit I/O pool size.
    pub fn with_threads(threads: usize) -> Result<TcpTransport, Error> {
        Self::build(threads, Serializer::default())
    }

    /// A transport using the given serializer registry.
    pub fn with_serializer(serializer: Serializer) -> TcpTransport {
        Self::build(default_threads(), serializer).expect("default thread count is positive")
    }

    fn build(threads: usize, serializer: Serializer) -> Result<TcpTransport, Error> {
        if threads == 0 {
            return Err(Error::Argument("thread count must be positive"));
        }
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("goshawk-io")
            .enable_all()
            .build()?;
        let io = runtime.handle().clone();
        Ok(TcpTransport {
            inner: Arc::new(TransportInner {
                runtime: Mutex::new(Some(runtime)),
                io,
                serializer,
                pool: BufferPool::new(),
                clients: Mutex::new(HashMap::new()),
                servers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The serializer shared by every connection of this transport.
    pub fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    type Client = TcpClient;
    type Server = TcpServer;

    fn client(&self, id: &str) -> TcpClient {
        self.inner
            .clients
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| {
                TcpClient::new(
                    id.to_string(),
                    self.inner.io.clone(),
                    self.inner.serializer.clone(),
                    self.inner.pool.clone(),
                )
            })
            .clone()
    }

    fn server(&self, id: &str) -> TcpServer {
        self.inner
            .servers
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| {
                TcpServer::new(
                    id.to_string(),
                    self.inner.io.clone(),
                    self.inner.serializer.clone(),
                    self.inner.pool.clone(),
                )
            })
            .clone()
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            let clients: Vec<TcpClient> = inner.clients.lock().values().cloned().collect();
            for client in clients {
                client.close().await;
            }
            let servers: Vec<TcpServer> = inner.servers.lock().values().cloned().collect();
            for server in servers {
                server.close().await;
            }
            if let Some(runtime) = inner.runtime.lock().take() {
                runtime.shutdown_background();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frames_round_trip_the_identifier() {
        let framed = encode_connect("node-17").unwrap();
        let mut buf = BytesMut::from(&framed[..]);
        let body = codec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(parse_connect(body).unwrap(), "node-17");
    }

    #[test]
    fn malformed_connect_is_a_protocol_error() {
        // Length field promises more bytes than the frame carries.
        let mut body = vec![KIND_CONNECT];
        body.extend_from_slice(&8u32.to_be_bytes());
        body.extend_from_slice(b"abc");
        assert!(matches!(
            parse_connect(Bytes::from(body)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn zero_threads_is_an_argument_error() {
        assert!(matches!(
            TcpTransport::with_threads(0),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn clients_and_servers_are_memoized_per_identifier() {
        let transport = TcpTransport::with_threads(1).unwrap();
        let a = transport.client("alpha");
        let b = transport.client("alpha");
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        let s1 = transport.server("srv");
        let s2 = transport.server("srv");
        assert!(Arc::ptr_eq(&s1.inner, &s2.inner));
    }
}
