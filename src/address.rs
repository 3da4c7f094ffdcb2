//! Endpoint identity.

use core::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;

/// A host/port endpoint.
///
/// Resolution happens lazily and the result is cached for the lifetime of
/// the value. Two addresses are equal when they resolve to the same socket
/// address; unresolvable addresses fall back to comparing host and port.
#[derive(Debug, Clone)]
pub struct Address {
    host: String,
    port: u16,
    resolved: OnceLock<Option<SocketAddr>>,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Address {
        Address {
            host: host.into(),
            port,
            resolved: OnceLock::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to a socket address, taking the first result.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.resolved.get_or_init(|| self.resolve()) {
            Ok(*addr)
        } else {
            Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("could not resolve {}:{}", self.host, self.port),
            ))
        }
    }

    fn resolve(&self) -> Option<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        let resolved = OnceLock::new();
        let _ = resolved.set(Some(addr));
        Address {
            host: addr.ip().to_string(),
            port: addr.port(),
            resolved,
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        match (
            self.resolved.get_or_init(|| self.resolve()),
            other.resolved.get_or_init(|| other.resolve()),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => self.host == other.host && self.port == other.port,
        }
    }
}

impl Eq for Address {}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
