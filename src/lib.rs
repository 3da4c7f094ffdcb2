//! goshawk: a pluggable duplex message-passing layer for cluster
//! communication.
//!
//! Peers exchange typed request/response messages over a framed byte
//! stream with correlation, per-request timeouts, and handler dispatch.
//! Two interchangeable backends sit behind one contract:
//! - [`TcpTransport`] — TCP with 16-bit length framing
//! - [`LocalTransport`] — in-process buffer handoff through a registry
//!
//! Every public entry point runs on a [`Context`], a single-threaded
//! cooperative executor; handlers and completions are routed back to the
//! context that registered them.
//!
//! ```no_run
//! use goshawk::{Address, Client, Connection, Context, Error, Server, TcpTransport, Transport};
//!
//! let transport = TcpTransport::new();
//! let server = transport.server("server");
//! let client = transport.client("client");
//! let address = Address::new("127.0.0.1", 5555);
//!
//! let context = Context::new("example");
//! let addr = address.clone();
//! context.block_on(async move {
//!     server
//!         .listen(&addr, |conn| {
//!             conn.handler(|message: String| async move { Ok::<String, Error>(message) });
//!         })
//!         .await
//!         .unwrap();
//! });
//!
//! let response: String = context.block_on(async move {
//!     let conn = client.connect(&address).await.unwrap();
//!     conn.send("Hello world!".to_string()).await.unwrap()
//! });
//! assert_eq!(response, "Hello world!");
//! ```

mod address;
mod buffer_pool;
pub mod codec;
mod connection;
mod context;
mod error;
mod serializer;
mod transport;

pub use address::Address;
pub use buffer_pool::{BufferPool, PooledBuf};
pub use connection::{Connection, ListenerHandle, ResponseFuture};
pub use context::{Context, Scheduled};
pub use error::Error;
pub use serializer::{Serializer, TypeKey};
pub use transport::local::{
    LocalClient, LocalConnection, LocalRegistry, LocalServer, LocalTransport,
};
pub use transport::tcp::{TcpClient, TcpConnection, TcpServer, TcpTransport};
pub use transport::{Client, Server, Transport};
