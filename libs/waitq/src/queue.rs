//! Cancellable FIFO wait queue.
//!
//! A [`WaitQueue`] holds the suspended waiters of one coordination
//! primitive. It is deliberately a plain data structure: every mutating
//! operation must run under the owning primitive's mutex, and the queue
//! never takes locks of its own.
//!
//! Completion is delivered through a `tokio::sync::oneshot` channel, so a
//! completed waiter resumes on its own task. The mutex that protected the
//! `dequeue` call is never observed held by the waiter's continuation.
//!
//! Waiters that were dropped without being cancelled ("dead" waiters) are
//! detected at dequeue time: `dequeue` hands the value back so the caller
//! can re-offer it to the next waiter in line.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Outcome of a wait that was cancelled through its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the wait was cancelled")]
pub struct WaitCancelled;

/// Identifies one queued waiter for targeted cancellation.
///
/// Keys are unique per queue for the queue's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitKey(u64);

struct Waiter<T> {
    key: WaitKey,
    tx: oneshot::Sender<T>,
}

/// Ordered (FIFO) collection of pending waiters completed with values of
/// type `T`.
pub struct WaitQueue<T> {
    waiters: VecDeque<Waiter<T>>,
    next_key: u64,
}

impl<T> WaitQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            next_key: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Append a new waiter and return the handle its task will await.
    pub fn enqueue(&mut self) -> WaitHandle<T> {
        let key = WaitKey(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { key, tx });
        WaitHandle { key, rx }
    }

    /// Complete the front waiter with `value`.
    ///
    /// Returns `Err(value)` when the front waiter's future has been dropped,
    /// so the caller can offer the value to the next waiter (or keep it).
    /// Callers check `is_empty()` first; popping an empty queue also hands
    /// the value back.
    pub fn dequeue(&mut self, value: T) -> Result<(), T> {
        match self.waiters.pop_front() {
            Some(waiter) => waiter.tx.send(value),
            None => Err(value),
        }
    }

    /// Complete every waiter with a clone of `value` and clear the queue.
    pub fn dequeue_all(&mut self, value: T)
    where
        T: Clone,
    {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(value.clone());
        }
    }

    /// Cancel the waiter identified by `key`, if it is still queued.
    ///
    /// Returns `false` when the waiter already left the queue — completed by
    /// a dequeue or cancelled earlier. O(n) scan; queues stay short.
    pub fn try_cancel(&mut self, key: WaitKey) -> bool {
        match self.waiters.iter().position(|w| w.key == key) {
            Some(idx) => {
                // Dropping the sender settles the handle as cancelled.
                self.waiters.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Cancel every queued waiter and clear the queue.
    pub fn cancel_all(&mut self) {
        self.waiters.clear();
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The awaitable half of a queued waiter.
///
/// Resolves to `Ok(value)` when the waiter is dequeued and to
/// `Err(WaitCancelled)` when it is cancelled (targeted or `cancel_all`) or
/// the owning queue is dropped.
pub struct WaitHandle<T> {
    key: WaitKey,
    rx: oneshot::Receiver<T>,
}

impl<T> WaitHandle<T> {
    /// Key for targeted cancellation of this waiter.
    #[inline]
    #[must_use]
    pub fn key(&self) -> WaitKey {
        self.key
    }

    /// Await completion, racing the wait against `cancel`.
    ///
    /// `try_cancel` runs when the token fires and must remove this waiter
    /// from its queue under the owning primitive's mutex, returning whether
    /// the removal happened. When it returns `false` the completion already
    /// settled and wins: the cancellation is ignored and the delivered value
    /// is returned. Dropping the internal `cancelled()` future is what
    /// disposes the registration once the wait settles.
    pub async fn cancellable<F>(
        self,
        cancel: &CancellationToken,
        try_cancel: F,
    ) -> Result<T, WaitCancelled>
    where
        F: FnOnce(WaitKey) -> bool,
    {
        let WaitHandle { key, mut rx } = self;
        tokio::select! {
            biased;
            res = &mut rx => return res.map_err(|_| WaitCancelled),
            _ = cancel.cancelled() => {}
        }
        if try_cancel(key) {
            return Err(WaitCancelled);
        }
        // The completion raced ahead of the cancellation; take it.
        rx.await.map_err(|_| WaitCancelled)
    }
}

impl<T> Future for WaitHandle<T> {
    type Output = Result<T, WaitCancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|res| res.map_err(|_| WaitCancelled))
    }
}
