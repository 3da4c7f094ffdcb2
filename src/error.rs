//! Error types and the wire fault record.

use core::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::serializer::TypeKey;

/// Errors surfaced by the transport layer.
///
/// The enum is cheap to clone so that one channel-wide failure can fan out
/// to every pending request future; I/O sources are shared behind an `Arc`
/// for the same reason.
#[derive(Debug, Clone)]
pub enum Error {
    /// Underlying I/O failure on a channel (read, write, or connect).
    Transport(Arc<io::Error>),
    /// Failed to bind a listening socket.
    Bind(Arc<io::Error>),
    /// No response arrived within the request timeout.
    Timeout,
    /// The connection is closed, or was closed while the request was pending.
    Closed,
    /// The peer has no handler registered for the request's type-key.
    UnknownType(TypeKey),
    /// Malformed frame or envelope. Fatal for the channel that produced it.
    Protocol(String),
    /// Invalid argument, or a public entry point called off-context.
    Argument(&'static str),
    /// Serializer failure while encoding or decoding a payload.
    Codec(String),
    /// Failure reported by the remote handler.
    Remote(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Bind(e) => write!(f, "bind failed: {e}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Closed => write!(f, "connection closed"),
            Self::UnknownType(key) => write!(f, "unknown message type: {key}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Argument(msg) => write!(f, "{msg}"),
            Self::Codec(msg) => write!(f, "serialization error: {msg}"),
            Self::Remote(msg) => write!(f, "remote failure: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) | Self::Bind(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(Arc::new(e))
    }
}

/// Failure record carried inside a FAILURE response payload.
///
/// The original protocol ships the handler's serialized error object; the
/// fixed record here preserves the one distinction callers can act on
/// (unknown message type vs. handler failure) without requiring the error
/// itself to be a registered wire type.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Fault {
    kind: FaultKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    type_key: Option<u32>,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum FaultKind {
    UnknownType,
    Remote,
}

impl Fault {
    pub(crate) fn from_error(err: &Error) -> Fault {
        match err {
            Error::UnknownType(key) => Fault {
                kind: FaultKind::UnknownType,
                type_key: Some(key.0),
                message: err.to_string(),
            },
            // Carry the handler's own message; `into_error` re-wraps it,
            // so re-serializing the `Display` here would stack prefixes
            // on every hop.
            Error::Remote(message) => Fault {
                kind: FaultKind::Remote,
                type_key: None,
                message: message.clone(),
            },
            other => Fault {
                kind: FaultKind::Remote,
                type_key: None,
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn into_error(self) -> Error {
        match self.kind {
            FaultKind::UnknownType => Error::UnknownType(TypeKey(self.type_key.unwrap_or(0))),
            FaultKind::Remote => Error::Remote(self.message),
        }
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        serde_json::to_writer(buf, self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub(crate) fn read(bytes: &[u8]) -> Result<Fault, Error> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("malformed fault payload: {e}")))
    }
}
