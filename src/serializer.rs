//! Type-key registry serializer.
//!
//! The serializer is the boundary between typed user values and wire
//! payloads. Types register under a numeric [`TypeKey`]; a serialized
//! payload is the key (`u32` big-endian) followed by the JSON body. The
//! key doubles as the handler-routing tag on the receiving side.
//!
//! The connections only consume this interface; nothing in the transport
//! core depends on the body encoding.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// Numeric tag identifying a registered wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey(pub u32);

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type-key {}", self.0)
    }
}

/// Values cross the untyped interior of the transport as boxed `Any`.
pub(crate) type BoxedValue = Box<dyn Any + Send>;

struct TypeEntry {
    key: TypeKey,
    encode: Box<dyn Fn(&dyn Any, &mut Vec<u8>) -> Result<(), Error> + Send + Sync>,
    decode: Box<dyn Fn(&[u8]) -> Result<BoxedValue, Error> + Send + Sync>,
}

/// Registry of wire types.
///
/// Keys 1..=15 are reserved for the built-in scalar registrations that
/// [`Serializer::default`] installs; applications register their own types
/// from 16 up. Registering a key or type twice replaces the prior entry.
#[derive(Clone)]
pub struct Serializer {
    inner: Arc<SerializerInner>,
}

struct SerializerInner {
    by_key: RwLock<HashMap<TypeKey, Arc<TypeEntry>>>,
    by_type: RwLock<HashMap<TypeId, Arc<TypeEntry>>>,
}

impl Serializer {
    /// An empty registry with no types.
    pub fn new() -> Serializer {
        Serializer {
            inner: Arc::new(SerializerInner {
                by_key: RwLock::new(HashMap::new()),
                by_type: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register `T` under `key`.
    pub fn register<T>(&self, key: u32) -> &Serializer
    where
        T: Serialize + DeserializeOwned + Any + Send + 'static,
    {
        let key = TypeKey(key);
        let entry = Arc::new(TypeEntry {
            key,
            encode: Box::new(|value, buf| {
                let value = value
                    .downcast_ref::<T>()
                    .ok_or_else(|| Error::Codec("value type does not match registration".into()))?;
                serde_json::to_writer(buf, value).map_err(|e| Error::Codec(e.to_string()))
            }),
            decode: Box::new(|body| {
                let value: T = serde_json::from_slice(body).map_err(|e| {
                    Error::Codec(format!("{}: {e}", std::any::type_name::<T>()))
                })?;
                Ok(Box::new(value))
            }),
        });
        self.inner.by_key.write().insert(key, entry.clone());
        self.inner.by_type.write().insert(TypeId::of::<T>(), entry);
        self
    }

    /// The key `T` is registered under, if any.
    pub fn key_for<T: Any>(&self) -> Option<TypeKey> {
        self.inner
            .by_type
            .read()
            .get(&TypeId::of::<T>())
            .map(|entry| entry.key)
    }

    /// Serialize a value into `buf` as `key | body`.
    pub fn write_object(&self, value: &dyn Any, buf: &mut Vec<u8>) -> Result<(), Error> {
        let entry = self
            .inner
            .by_type
            .read()
            .get(&value.type_id())
            .cloned()
            .ok_or_else(|| Error::Codec("no type key registered for value".into()))?;
        buf.extend_from_slice(&entry.key.0.to_be_bytes());
        (entry.encode)(value, buf)
    }

    /// Deserialize a `key | body` payload, consuming `buf`.
    ///
    /// An unregistered key surfaces as [`Error::UnknownType`]; the caller
    /// decides whether that is routable (a request nobody handles) or
    /// fatal. A malformed body is a codec error.
    pub fn read_object(&self, buf: &mut Bytes) -> Result<(TypeKey, BoxedValue), Error> {
        if buf.len() < 4 {
            return Err(Error::Protocol("truncated payload".into()));
        }
        let key = TypeKey(buf.get_u32());
        let entry = self
            .inner
            .by_key
            .read()
            .get(&key)
            .cloned()
            .ok_or(Error::UnknownType(key))?;
        let body = buf.split_to(buf.len());
        let value = (entry.decode)(&body)?;
        Ok((key, value))
    }
}

impl Default for Serializer {
    /// A registry pre-loaded with the common scalar types.
    fn default() -> Serializer {
        let serializer = Serializer::new();
        serializer
            .register::<String>(1)
            .register::<i64>(2)
            .register::<f64>(3)
            .register::<bool>(4)
            .register::<Vec<u8>>(5);
        serializer
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("types", &self.inner.by_key.read().len())
            .finish()
    }
}
