//! Serial task queue: callbacks run strictly one at a time, in submission
//! order, never on the submitter's thread.

use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use waitq::IdAllocator;

static IDS: IdAllocator = IdAllocator::new();

/// Failure of an individual queued callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFault {
    /// The callback panicked. Only its own handle fails; later callbacks
    /// still run.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The queue was torn down before the callback could run.
    #[error("task dropped before completion")]
    Dropped,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Queue funneling callbacks into strictly ordered execution.
///
/// Submissions are chained onto one dedicated worker task: a callback
/// starts only after every previously submitted callback (including
/// asynchronous ones) has finished. Cancellation is not a queue-level
/// concern; callers embed it in their callbacks.
///
/// Must be created within a tokio runtime. Dropping the queue lets the
/// worker drain what was already submitted, then stop.
pub struct SerialTaskQueue {
    tx: mpsc::UnboundedSender<Job>,
    id: OnceLock<NonZeroU32>,
}

impl SerialTaskQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            tracing::trace!("serial queue worker started");
            while let Some(job) = rx.recv().await {
                job().await;
            }
            tracing::trace!("serial queue worker stopped");
        });
        Self {
            tx,
            id: OnceLock::new(),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.id.get_or_init(|| IDS.next())
    }

    /// Submit a synchronous callback; the handle resolves to its return
    /// value once every earlier submission has finished.
    pub fn enqueue<F, T>(&self, callback: F) -> SerialHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_future(move || std::future::ready(callback()))
    }

    /// Submit an asynchronous callback; the returned future is awaited to
    /// completion before the next submission starts.
    pub fn enqueue_future<F, Fut, T>(&self, callback: F) -> SerialHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let outcome = AssertUnwindSafe(async move { callback().await })
                    .catch_unwind()
                    .await;
                let outcome = outcome.map_err(|payload| {
                    let fault = TaskFault::Panicked(panic_message(payload.as_ref()));
                    tracing::warn!(%fault, "serial task failed");
                    fault
                });
                let _ = tx.send(outcome);
            }
            .boxed()
        });
        // Send can only fail after the runtime tore the worker down; the
        // handle then settles as `Dropped`.
        let _ = self.tx.send(job);
        SerialHandle { rx }
    }
}

impl Default for SerialTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SerialTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerialTaskQueue")
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Completion handle for one queued callback.
pub struct SerialHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskFault>>,
}

impl<T> Future for SerialHandle<T> {
    type Output = Result<T, TaskFault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|res| match res {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskFault::Dropped),
        })
    }
}
