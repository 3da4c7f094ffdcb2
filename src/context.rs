//! Cooperative execution contexts.
//!
//! Every public entry point of the transport runs on a [`Context`]: a named
//! thread driving a single-threaded task executor with a timer. Callbacks
//! and future completions are routed back to the context that registered
//! them, so user code never observes the transport's I/O threads.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

use tokio::runtime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Error;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Weak<ContextInner>>> = const { RefCell::new(None) };
}

/// Handle to a single-threaded cooperative executor.
///
/// Cheap to clone; the backing thread shuts down when the last handle is
/// dropped. The thread marks itself as the current context, so code running
/// on it can recover its own handle through [`Context::current`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    name: String,
    handle: runtime::Handle,
    shutdown: Arc<Notify>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

impl Context {
    /// Start a new context thread.
    pub fn new(name: impl Into<String>) -> Context {
        let name = name.into();
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shutdown = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel();

        let thread_name = name.clone();
        let thread_shutdown = shutdown.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let rt = runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build context runtime");
                let inner = Arc::new(ContextInner {
                    id,
                    name: thread_name,
                    handle: rt.handle().clone(),
                    shutdown: thread_shutdown.clone(),
                });
                CURRENT.with(|current| {
                    *current.borrow_mut() = Some(Arc::downgrade(&inner));
                });
                let _ = tx.send(Context { inner });
                rt.block_on(thread_shutdown.notified());
            })
            .expect("failed to spawn context thread");

        rx.recv().expect("context thread failed to start")
    }

    /// The context owning the calling thread, if any.
    pub fn current() -> Option<Context> {
        CURRENT
            .with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
            .map(|inner| Context { inner })
    }

    pub(crate) fn current_or(message: &'static str) -> Result<Context, Error> {
        Context::current().ok_or(Error::Argument(message))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Post a closure to the context's executor.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.inner.handle.spawn(async move { f() });
    }

    /// Spawn a future onto the context's executor.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Run `task` periodically on this context.
    ///
    /// The first run happens after `initial`, subsequent runs every
    /// `period`. Ticks never overlap; a missed tick is delayed, not
    /// bunched.
    pub fn schedule<F>(&self, initial: Duration, period: Duration, mut task: F) -> Scheduled
    where
        F: FnMut() + Send + 'static,
    {
        let task = self.inner.handle.spawn(async move {
            let start = tokio::time::Instant::now() + initial;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                task();
            }
        });
        Scheduled { task }
    }

    /// Drive a future to completion on this context from a foreign thread.
    ///
    /// # Panics
    ///
    /// Panics when called from the context's own thread, which would
    /// deadlock, or when the context shuts down before the future
    /// completes.
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert!(
            !self.is_current(),
            "Context::block_on called from its own context"
        );
        let (tx, rx) = mpsc::channel();
        let _ = self.inner.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv()
            .expect("context shut down before the future completed")
    }

    fn is_current(&self) -> bool {
        Context::current().is_some_and(|c| c.id() == self.id())
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Context) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Cancellation handle for a periodic task started by [`Context::schedule`].
pub struct Scheduled {
    task: JoinHandle<()>,
}

impl Scheduled {
    pub fn cancel(&self) {
        self.task.abort();
    }
}
