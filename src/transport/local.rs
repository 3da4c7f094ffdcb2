//! In-process transport.
//!
//! Serves the same contract as the TCP backend without a socket: a shared
//! registry maps listen addresses to accept entries, and a connect creates
//! a pair of connections pointing at each other. Requests still pass
//! through the serializer, so the wire contract is exercised even when
//! both peers share an address space; only the framing layer is bypassed.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::address::Address;
use crate::buffer_pool::BufferPool;
use crate::codec::{STATUS_FAILURE, STATUS_SUCCESS};
use crate::connection::{
    box_handler, Connection, HandlerHolder, HandlerMap, ListenerHandle, Listeners, ResponseFuture,
};
use crate::context::Context;
use crate::error::{Error, Fault};
use crate::serializer::{BoxedValue, Serializer};
use crate::transport::{Client, Server, Transport};

type AcceptFn = Arc<dyn Fn(LocalConnection) + Send + Sync>;

/// Shared mapping from listen address to accept entry.
///
/// Transports constructed over the same registry can reach each other's
/// servers; a `Default` registry shared process-wide gives the usual
/// single-process topology.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    entries: Arc<Mutex<HashMap<String, RegistryEntry>>>,
}

#[derive(Clone)]
struct RegistryEntry {
    accept: AcceptFn,
    context: Context,
    serializer: Serializer,
    pool: BufferPool,
    connections: Arc<Mutex<Vec<LocalConnection>>>,
}

impl LocalRegistry {
    pub fn new() -> LocalRegistry {
        Self::default()
    }

    fn register(&self, address: String, entry: RegistryEntry) -> Result<(), Error> {
        match self.entries.lock().entry(address) {
            Entry::Occupied(occupied) => Err(Error::Bind(Arc::new(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("local address {} already registered", occupied.key()),
            )))),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    fn lookup(&self, address: &str) -> Option<RegistryEntry> {
        self.entries.lock().get(address).cloned()
    }

    fn remove(&self, address: &str) {
        self.entries.lock().remove(address);
    }
}

impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("servers", &self.entries.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One end of an in-process connection pair.
#[derive(Clone)]
pub struct LocalConnection {
    inner: Arc<LocalConnInner>,
}

struct LocalConnInner {
    context: Context,
    serializer: Serializer,
    pool: BufferPool,
    peer_id: Option<String>,
    peer: OnceLock<Weak<LocalConnInner>>,
    handlers: HandlerMap,
    exception_listeners: Listeners<Error>,
    close_listeners: Listeners<()>,
    closed: AtomicBool,
}

impl LocalConnection {
    fn new(
        context: Context,
        serializer: Serializer,
        pool: BufferPool,
        peer_id: Option<String>,
    ) -> LocalConnection {
        LocalConnection {
            inner: Arc::new(LocalConnInner {
                context,
                serializer,
                pool,
                peer_id,
                peer: OnceLock::new(),
                handlers: HandlerMap::new(),
                exception_listeners: Listeners::new(),
                close_listeners: Listeners::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn pair(client: &LocalConnection, server: &LocalConnection) {
        let _ = client.inner.peer.set(Arc::downgrade(&server.inner));
        let _ = server.inner.peer.set(Arc::downgrade(&client.inner));
    }

    /// The identifier of the connecting client. Present on server-side
    /// connections only.
    pub fn peer_id(&self) -> Option<&str> {
        self.inner.peer_id.as_deref()
    }
}

fn decode_response(serializer: &Serializer, mut payload: Bytes) -> Result<BoxedValue, Error> {
    if payload.is_empty() {
        return Err(Error::Protocol("empty response buffer".into()));
    }
    match payload.get_u8() {
        STATUS_SUCCESS => serializer.read_object(&mut payload).map(|(_, value)| value),
        STATUS_FAILURE => match Fault::read(&payload) {
            Ok(fault) => Err(fault.into_error()),
            Err(error) => Err(error),
        },
        other => Err(Error::Protocol(format!("unknown status byte {other:#04x}"))),
    }
}

impl LocalConnInner {
    /// Deserialize a request, dispatch it, and serialize the outcome.
    /// Runs on this (the receiving) connection's owning context.
    async fn receive(self: Arc<Self>, mut payload: Bytes) -> Result<Bytes, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (key, value) = self.serializer.read_object(&mut payload)?;
        drop(payload);

        let Some(holder) = self.handlers.get(key) else {
            debug!(%key, "request without a handler");
            return Err(Error::Transport(Arc::new(io::Error::new(
                io::ErrorKind::Other,
                "no handler registered",
            ))));
        };

        let handler = holder.handler.clone();
        let result = match holder.context.spawn(async move { handler(value).await }).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(Error::Remote("handler panicked".into())),
            Err(_) => Err(Error::Closed),
        };

        let mut buf = self.pool.get();
        match result {
            Ok(value) => {
                buf.push(STATUS_SUCCESS);
                self.serializer.write_object(value.as_ref(), &mut buf)?;
            }
            Err(error) => {
                buf.push(STATUS_FAILURE);
                Fault::from_error(&error).write(&mut buf)?;
            }
        }
        Ok(Bytes::copy_from_slice(&buf))
    }

    fn do_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("local connection closed");
        self.close_listeners.notify(&());
    }
}

impl Connection for LocalConnection {
    fn send<T, U>(&self, request: T) -> ResponseFuture<U>
    where
        T: Any + Send + 'static,
        U: Any + Send + 'static,
    {
        let caller = match Context::current_or("send requires a context") {
            Ok(context) => context,
            Err(error) => return ResponseFuture::failed(error),
        };
        if self.inner.closed.load(Ordering::Acquire) {
            return ResponseFuture::failed(Error::Closed);
        }
        let Some(peer) = self.inner.peer.get().and_then(Weak::upgrade) else {
            return ResponseFuture::failed(Error::Closed);
        };

        // Serialize on the sending side, preserving the serializer
        // contract even though no framing happens.
        let mut buf = self.inner.pool.get();
        if let Err(error) = self.inner.serializer.write_object(&request, &mut buf) {
            return ResponseFuture::failed(error);
        }
        let payload = Bytes::copy_from_slice(&buf);
        drop(buf);

        let (tx, rx) = oneshot::channel();
        let serializer = self.inner.serializer.clone();
        let peer_context = peer.context.clone();
        let _ = peer_context.spawn(async move {
            let result = peer.receive(payload).await;
            caller.execute(move || {
                let outcome = result.and_then(|payload| decode_response(&serializer, payload));
                let _ = tx.send(outcome);
            });
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

    /// Registered for contract parity, but never invoked: the in-process
    /// channel has no I/O failures, so no failure ever latches on a local
    /// connection. Only close notification is delivered on this backend.
    fn exception_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
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
            inner.do_close();
            if let Some(peer) = inner.peer.get().and_then(Weak::upgrade) {
                peer.do_close();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client and server
// ---------------------------------------------------------------------------

/// Initiates in-process connections through a [`LocalRegistry`].
#[derive(Clone)]
pub struct LocalClient {
    inner: Arc<LocalClientInner>,
}

struct LocalClientInner {
    id: String,
    registry: LocalRegistry,
    serializer: Serializer,
    pool: BufferPool,
    connections: Arc<Mutex<Vec<LocalConnection>>>,
}

impl Client for LocalClient {
    type Connection = LocalConnection;

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn connect(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<LocalConnection, Error>> + Send {
        let inner = self.inner.clone();
        let address = address.clone();
        async move {
            let context = Context::current_or("connect requires a context")?;
            let Some(entry) = inner.registry.lookup(&address.to_string()) else {
                return Err(Error::Transport(Arc::new(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no local server at {address}"),
                ))));
            };
            debug!(address = %address, client = %inner.id, "local connect");

            let client_conn = LocalConnection::new(
                context,
                inner.serializer.clone(),
                inner.pool.clone(),
                None,
            );
            let server_conn = LocalConnection::new(
                entry.context.clone(),
                entry.serializer.clone(),
                entry.pool.clone(),
                Some(inner.id.clone()),
            );
            LocalConnection::pair(&client_conn, &server_conn);

            entry.connections.lock().push(server_conn.clone());
            inner.connections.lock().push(client_conn.clone());

            let accept = entry.accept.clone();
            entry.context.execute(move || accept(server_conn));
            Ok(client_conn)
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            let conns: Vec<LocalConnection> = inner.connections.lock().drain(..).collect();
            for conn in conns {
                conn.close().await;
            }
        }
    }
}

/// Accepts in-process connections registered in a [`LocalRegistry`].
#[derive(Clone)]
pub struct LocalServer {
    inner: Arc<LocalServerInner>,
}

struct LocalServerInner {
    id: String,
    registry: LocalRegistry,
    serializer: Serializer,
    pool: BufferPool,
    connections: Arc<Mutex<Vec<LocalConnection>>>,
    address: Mutex<Option<String>>,
    listen_outcome: Mutex<Option<Result<(), Error>>>,
}

impl Server for LocalServer {
    type Connection = LocalConnection;

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn listen<F>(
        &self,
        address: &Address,
        accept: F,
    ) -> impl Future<Output = Result<(), Error>> + Send
    where
        F: Fn(LocalConnection) + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let address = address.clone();
        async move {
            let context = Context::current_or("listen requires a context")?;
            let mut outcome = inner.listen_outcome.lock();
            if let Some(existing) = outcome.as_ref() {
                return existing.clone();
            }
            let key = address.to_string();
            let result = inner.registry.register(
                key.clone(),
                RegistryEntry {
                    accept: Arc::new(accept),
                    context,
                    serializer: inner.serializer.clone(),
                    pool: inner.pool.clone(),
                    connections: inner.connections.clone(),
                },
            );
            if result.is_ok() {
                *inner.address.lock() = Some(key.clone());
                info!(address = %key, server = %inner.id, "local server registered");
            }
            *outcome = Some(result.clone());
            result
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            if let Some(address) = inner.address.lock().take() {
                inner.registry.remove(&address);
            }
            let conns: Vec<LocalConnection> = inner.connections.lock().drain(..).collect();
            for conn in conns {
                conn.close().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Factory for in-process clients and servers over one registry.
pub struct LocalTransport {
    inner: Arc<LocalTransportInner>,
}

struct LocalTransportInner {
    registry: LocalRegistry,
    serializer: Serializer,
    pool: BufferPool,
    clients: Mutex<HashMap<String, LocalClient>>,
    servers: Mutex<HashMap<String, LocalServer>>,
}

impl LocalTransport {
    pub fn new(registry: LocalRegistry) -> LocalTransport {
        Self::with_serializer(registry, Serializer::default())
    }

    pub fn with_serializer(registry: LocalRegistry, serializer: Serializer) -> LocalTransport {
        LocalTransport {
            inner: Arc::new(LocalTransportInner {
                registry,
                serializer,
                pool: BufferPool::new(),
                clients: Mutex::new(HashMap::new()),
                servers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The serializer shared by every connection of this transport.
    pub fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }
}

impl Transport for LocalTransport {
    type Client = LocalClient;
    type Server = LocalServer;

    fn client(&self, id: &str) -> LocalClient {
        self.inner
            .clients
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| LocalClient {
                inner: Arc::new(LocalClientInner {
                    id: id.to_string(),
                    registry: self.inner.registry.clone(),
                    serializer: self.inner.serializer.clone(),
                    pool: self.inner.pool.clone(),
                    connections: Arc::new(Mutex::new(Vec::new())),
                }),
            })
            .clone()
    }

    fn server(&self, id: &str) -> LocalServer {
        self.inner
            .servers
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| LocalServer {
                inner: Arc::new(LocalServerInner {
                    id: id.to_string(),
                    registry: self.inner.registry.clone(),
                    serializer: self.inner.serializer.clone(),
                    pool: self.inner.pool.clone(),
                    connections: Arc::new(Mutex::new(Vec::new())),
                    address: Mutex::new(None),
                    listen_outcome: Mutex::new(None),
                }),
            })
            .clone()
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            let clients: Vec<LocalClient> = inner.clients.lock().values().cloned().collect();
            for client in clients {
                client.close().await;
            }
            let servers: Vec<LocalServer> = inner.servers.lock().values().cloned().collect();
            for server in servers {
                server.close().await;
            }
        }
    }
}
