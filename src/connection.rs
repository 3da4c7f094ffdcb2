//! Connection contract and shared connection machinery.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::context::Context;
use crate::error::Error;
use crate::serializer::{BoxedValue, TypeKey};

/// A duplex peer-to-peer channel carrying typed request/response messages.
///
/// Both backends implement this contract; the scheduling rules are shared:
/// `send` must be called on a context and its future resolves for that
/// context, handlers run on the context they were registered from, and
/// listeners fire in registration order.
pub trait Connection: Clone + Send + Sync + 'static {
    /// Send a request and await the typed response.
    ///
    /// Requires the caller to be on a [`Context`]; otherwise the returned
    /// future resolves immediately with an argument error. Fails with the
    /// backend's request timeout (500 ms on the TCP backend) if no response
    /// arrives, or with a closed error if the connection is torn down
    /// first.
    fn send<T, U>(&self, request: T) -> ResponseFuture<U>
    where
        T: Any + Send + 'static,
        U: Any + Send + 'static;

    /// Register the handler for requests of type `T`, replacing any prior
    /// registration. The handler runs on the context it was registered
    /// from.
    ///
    /// # Panics
    ///
    /// Panics when called off-context or when `T` has no type key in the
    /// connection's serializer.
    fn handler<T, U, H, Fut>(&self, handler: H) -> &Self
    where
        T: Any + Send + 'static,
        U: Any + Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, Error>> + Send + 'static;

    /// Drop the handler registration for `T`, if any.
    fn remove_handler<T: Any>(&self) -> &Self;

    /// Register a listener for channel-wide failures. If a failure is
    /// already latched, the listener is invoked synchronously before the
    /// handle is returned.
    fn exception_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Error) + Send + Sync + 'static;

    /// Register a listener for connection close. If the connection is
    /// already closed, the listener is invoked synchronously before the
    /// handle is returned.
    fn close_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static;

    /// Close the connection. Idempotent; the future completes once the
    /// channel is down, always successfully.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Completion of a [`Connection::send`] call.
///
/// The transport resolves the future with the deserialized response value;
/// the downcast to `U` happens here, at the typed edge.
pub struct ResponseFuture<U> {
    state: ResponseState,
    _marker: PhantomData<fn() -> U>,
}

enum ResponseState {
    Failed(Option<Error>),
    Waiting(oneshot::Receiver<Result<BoxedValue, Error>>),
}

impl<U> ResponseFuture<U> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<BoxedValue, Error>>) -> Self {
        ResponseFuture {
            state: ResponseState::Waiting(rx),
            _marker: PhantomData,
        }
    }

    pub(crate) fn failed(error: Error) -> Self {
        ResponseFuture {
            state: ResponseState::Failed(Some(error)),
            _marker: PhantomData,
        }
    }
}

impl<U: Any> Future for ResponseFuture<U> {
    type Output = Result<U, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ResponseState::Failed(error) => Poll::Ready(Err(error
                .take()
                .expect("response future polled after completion"))),
            ResponseState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(Ok(value))) => Poll::Ready(
                    value
                        .downcast::<U>()
                        .map(|boxed| *boxed)
                        .map_err(|_| Error::Codec("response type mismatch".into())),
                ),
                Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(error)),
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Handler plus the context it was registered from.
#[derive(Clone)]
pub(crate) struct HandlerHolder {
    pub(crate) handler: HandlerFn,
    pub(crate) context: Context,
}

pub(crate) type HandlerFn =
    Arc<dyn Fn(BoxedValue) -> BoxFuture<'static, Result<BoxedValue, Error>> + Send + Sync>;

/// Erase a typed handler into the registry's boxed form. The downcast is
/// routed by type-key, so a mismatch means registry corruption and is
/// reported as a codec error rather than reaching the handler.
pub(crate) fn box_handler<T, U, H, Fut>(handler: H) -> HandlerFn
where
    T: Any + Send + 'static,
    U: Any + Send + 'static,
    H: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, Error>> + Send + 'static,
{
    use futures::FutureExt;

    let handler = Arc::new(handler);
    Arc::new(move |value: BoxedValue| {
        let handler = handler.clone();
        match value.downcast::<T>() {
            Ok(value) => {
                let fut = handler(*value);
                async move { fut.await.map(|response| Box::new(response) as BoxedValue) }.boxed()
            }
            Err(_) => {
                futures::future::ready(Err(Error::Codec("handler value type mismatch".into())))
                    .boxed()
            }
        }
    })
}

/// Type-key routed handler registry.
///
/// Written by owning contexts, read by the I/O upcall.
pub(crate) struct HandlerMap {
    entries: RwLock<std::collections::HashMap<TypeKey, HandlerHolder>>,
}

impl HandlerMap {
    pub(crate) fn new() -> HandlerMap {
        HandlerMap {
            entries: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: TypeKey, holder: HandlerHolder) {
        self.entries.write().insert(key, holder);
    }

    pub(crate) fn remove(&self, key: TypeKey) {
        self.entries.write().remove(&key);
    }

    pub(crate) fn get(&self, key: TypeKey) -> Option<HandlerHolder> {
        self.entries.read().get(&key).cloned()
    }
}

/// Ordered, append-only listener set.
///
/// Notification snapshots the set under the lock and invokes outside it,
/// so listeners may detach (or register more listeners) reentrantly.
pub(crate) struct Listeners<T> {
    entries: Arc<Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>>,
    next_id: AtomicU64,
}

impl<T> Listeners<T> {
    pub(crate) fn new() -> Listeners<T> {
        Listeners {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, Arc::new(listener)));

        let entries: Weak<Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>> =
            Arc::downgrade(&self.entries);
        ListenerHandle {
            on_detach: Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    entries.lock().retain(|(entry_id, _)| *entry_id != id);
                }
            }),
        }
    }

    pub(crate) fn notify(&self, value: &T) {
        let snapshot: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }
}

/// Detachment handle for a registered listener.
///
/// Detaching after the emitting connection is gone is a no-op.
pub struct ListenerHandle {
    on_detach: Box<dyn Fn() + Send + Sync>,
}

impl ListenerHandle {
    pub fn detach(&self) {
        (self.on_detach)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_in_registration_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            let _handle = listeners.add(move |value: &u32| {
                order.lock().push((tag, *value));
            });
        }

        listeners.notify(&9);
        assert_eq!(
            *order.lock(),
            vec![("first", 9), ("second", 9), ("third", 9)]
        );
    }

    #[test]
    fn detached_listeners_stop_firing() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let observed = count.clone();
        let handle = listeners.add(move |_| {
            observed.fetch_add(1, Ordering::Relaxed);
        });

        listeners.notify(&());
        handle.detach();
        listeners.notify(&());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn detach_after_set_teardown_is_a_no_op() {
        let handle = {
            let listeners: Listeners<()> = Listeners::new();
            listeners.add(|_| {})
        };
        handle.detach();
    }

    #[test]
    fn response_future_downcasts_at_the_edge() {
        let (tx, rx) = oneshot::channel();
        let future: ResponseFuture<String> = ResponseFuture::new(rx);
        tx.send(Ok(Box::new("typed".to_string()) as BoxedValue))
            .ok()
            .unwrap();

        let result = futures::executor::block_on(future);
        assert_eq!(result.unwrap(), "typed");
    }

    #[test]
    fn response_future_reports_type_mismatches() {
        let (tx, rx) = oneshot::channel();
        let future: ResponseFuture<String> = ResponseFuture::new(rx);
        tx.send(Ok(Box::new(7i64) as BoxedValue)).ok().unwrap();

        let result = futures::executor::block_on(future);
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn dropped_sender_resolves_as_closed() {
        let (tx, rx) = oneshot::channel::<Result<BoxedValue, Error>>();
        drop(tx);
        let future: ResponseFuture<String> = ResponseFuture::new(rx);
        assert!(matches!(
            futures::executor::block_on(future),
            Err(Error::Closed)
        ));
    }
}
