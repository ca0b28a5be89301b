//! Bounded producer/consumer queue with a completion marker.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use futures::Stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled};

use crate::condvar::{Condvar, WaitStatus};
use crate::lock::AsyncLock;

static IDS: IdAllocator = IdAllocator::new();

/// Failure of a queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Cancelled(#[from] WaitCancelled),
    /// Enqueue after completion, or dequeue from a completed, drained queue.
    #[error("the queue has completed adding")]
    Completed,
}

/// Rejected construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueConfigError {
    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("initial items ({len}) exceed the capacity ({capacity})")]
    TooManyItems { len: usize, capacity: usize },
}

struct Inner<T> {
    items: VecDeque<T>,
    completed: bool,
}

struct Shared<T> {
    lock: AsyncLock,
    // Signaled (one waiter at a time) when space frees up or completion hits.
    not_full: Condvar,
    // Likewise for items becoming available.
    not_empty: Condvar,
    inner: Mutex<Inner<T>>,
    capacity: usize,
    id: OnceLock<NonZeroU32>,
}

/// Bounded FIFO queue connecting producers and consumers.
///
/// Producers wait while the queue is full, consumers while it is empty.
/// [`complete`](Self::complete) marks the end of input: waiting producers
/// and consumers wake, later enqueues fail with [`QueueError::Completed`],
/// and dequeues drain the remaining items before failing the same way.
///
/// The handle is cheap to clone; clones operate on the same queue.
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> BoundedQueue<T> {
    /// New empty queue holding at most `capacity` items.
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueConfigError> {
        Self::build(VecDeque::new(), capacity)
    }

    /// New queue pre-filled with `items`.
    pub fn with_items(
        items: impl IntoIterator<Item = T>,
        capacity: usize,
    ) -> Result<Self, QueueConfigError> {
        Self::build(items.into_iter().collect(), capacity)
    }

    fn build(items: VecDeque<T>, capacity: usize) -> Result<Self, QueueConfigError> {
        if capacity == 0 {
            return Err(QueueConfigError::ZeroCapacity);
        }
        if items.len() > capacity {
            return Err(QueueConfigError::TooManyItems {
                len: items.len(),
                capacity,
            });
        }
        let lock = AsyncLock::new();
        let not_full = Condvar::new(&lock);
        let not_empty = Condvar::new(&lock);
        Ok(Self {
            shared: Arc::new(Shared {
                lock,
                not_full,
                not_empty,
                inner: Mutex::new(Inner {
                    items,
                    completed: false,
                }),
                capacity,
                id: OnceLock::new(),
            }),
        })
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.shared.id.get_or_init(|| IDS.next())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.inner.lock().items.is_empty()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared.inner.lock().completed
    }

    /// Append `item`, waiting while the queue is full.
    pub async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        let mut guard = self.shared.lock.lock(cancel).await?;
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if inner.completed {
                    return Err(QueueError::Completed);
                }
                if inner.items.len() < self.shared.capacity {
                    inner.items.push_back(item);
                    drop(inner);
                    self.shared.not_empty.notify_one(&guard);
                    return Ok(());
                }
            }
            let (reacquired, status) = self.shared.not_full.wait(guard, cancel).await;
            guard = reacquired;
            if status == WaitStatus::Cancelled {
                return Err(WaitCancelled.into());
            }
        }
    }

    /// Remove the head item, waiting while the queue is empty.
    ///
    /// On a completed queue the remaining items still drain; only then does
    /// the operation fail with [`QueueError::Completed`].
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        let mut guard = self.shared.lock.lock(cancel).await?;
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.shared.not_full.notify_one(&guard);
                    return Ok(item);
                }
                if inner.completed {
                    return Err(QueueError::Completed);
                }
            }
            let (reacquired, status) = self.shared.not_empty.wait(guard, cancel).await;
            guard = reacquired;
            if status == WaitStatus::Cancelled {
                return Err(WaitCancelled.into());
            }
        }
    }

    /// Wait until an item is available or the queue completes; `true` when
    /// output is available.
    pub async fn output_available(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bool, WaitCancelled> {
        let mut guard = self.shared.lock.lock(cancel).await?;
        loop {
            {
                let inner = self.shared.inner.lock();
                if !inner.items.is_empty() {
                    return Ok(true);
                }
                if inner.completed {
                    return Ok(false);
                }
            }
            let (reacquired, status) = self.shared.not_empty.wait(guard, cancel).await;
            guard = reacquired;
            if status == WaitStatus::Cancelled {
                return Err(WaitCancelled);
            }
        }
    }

    /// Mark the end of input and wake every waiter. Idempotent.
    pub async fn complete(&self) {
        let guard = self.shared.lock.lock_uncancellable().await;
        {
            let mut inner = self.shared.inner.lock();
            if inner.completed {
                return;
            }
            inner.completed = true;
        }
        tracing::debug!("queue completed; waking producers and consumers");
        self.shared.not_full.notify_all(&guard);
        self.shared.not_empty.notify_all(&guard);
    }

    /// Blocking variant of [`enqueue`](Self::enqueue). Must not be called
    /// from async context.
    pub fn blocking_enqueue(&self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        futures::executor::block_on(self.enqueue(item, cancel))
    }

    /// Blocking variant of [`dequeue`](Self::dequeue). Must not be called
    /// from async context.
    pub fn blocking_dequeue(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        futures::executor::block_on(self.dequeue(cancel))
    }

    /// Blocking variant of [`complete`](Self::complete). Must not be called
    /// from async context.
    pub fn blocking_complete(&self) {
        futures::executor::block_on(self.complete());
    }

    /// Stream of dequeued items, ending when the queue is completed and
    /// drained. A cancellation yields one final `Err` and then ends.
    pub fn consume<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<T, QueueError>> + 'a {
        futures::stream::unfold(true, move |alive| async move {
            if !alive {
                return None;
            }
            match self.dequeue(cancel).await {
                Ok(item) => Some((Ok(item), true)),
                Err(QueueError::Completed) => None,
                Err(err) => Some((Err(err), false)),
            }
        })
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &inner.items.len())
            .field("capacity", &self.shared.capacity)
            .field("completed", &inner.completed)
            .finish()
    }
}
