//! The pluggable backend contract.

use std::future::Future;

use crate::address::Address;
use crate::connection::Connection;
use crate::error::Error;

pub mod local;
pub mod tcp;

/// Factory for clients and servers sharing one backend.
pub trait Transport: Send + Sync + 'static {
    type Client: Client;
    type Server: Server;

    /// The client for `id`, creating it on first use.
    fn client(&self, id: &str) -> Self::Client;

    /// The server for `id`, creating it on first use.
    fn server(&self, id: &str) -> Self::Server;

    /// Close every owned client and server, then release backend
    /// resources.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Initiates outbound connections.
pub trait Client: Clone + Send + Sync + 'static {
    type Connection: Connection;

    fn id(&self) -> &str;

    /// Connect to `address`. Must be called on a context; the future
    /// resolves on the caller's context, exceptionally on connect failure.
    fn connect(&self, address: &Address)
        -> impl Future<Output = Result<Self::Connection, Error>> + Send;

    /// Close every connection this client opened.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Accepts inbound connections.
pub trait Server: Clone + Send + Sync + 'static {
    type Connection: Connection;

    fn id(&self) -> &str;

    /// Bind `address` and invoke `accept` (on the caller's context) for
    /// each inbound connection that completes its handshake.
    ///
    /// Must be called on a context. Idempotent per server instance: a
    /// second call returns the in-flight or completed outcome without
    /// re-binding.
    fn listen<F>(
        &self,
        address: &Address,
        accept: F,
    ) -> impl Future<Output = Result<(), Error>> + Send
    where
        F: Fn(Self::Connection) + Send + Sync + 'static;

    /// Stop accepting and close every owned connection. The future
    /// completes once all of them have closed.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
