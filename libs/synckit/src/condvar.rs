//! Mesa-style asynchronous condition variable bound to an [`AsyncLock`].

use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled, WaitQueue};

use crate::lock::{AsyncLock, LockGuard};

static IDS: IdAllocator = IdAllocator::new();

/// How a [`Condvar::wait`] resumed. The associated lock is held either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Notified,
    Cancelled,
}

impl WaitStatus {
    #[inline]
    #[must_use]
    pub fn is_notified(self) -> bool {
        matches!(self, WaitStatus::Notified)
    }
}

struct CvState {
    waiters: WaitQueue<Notification>,
}

type SharedState = Arc<Mutex<CvState>>;

/// Condition variable with mesa semantics.
///
/// Notifiers keep the associated lock; an awakened waiter re-contests it,
/// so predicates must be re-checked in a loop after every wakeup. `wait`
/// re-acquires the lock on every resumption path, including cancellation:
/// the caller always gets its guard back.
pub struct Condvar {
    lock: AsyncLock,
    shared: SharedState,
    id: OnceLock<NonZeroU32>,
}

impl Condvar {
    /// New condition variable associated with `lock`.
    #[must_use]
    pub fn new(lock: &AsyncLock) -> Self {
        Self {
            lock: lock.clone_ref(),
            shared: Arc::new(Mutex::new(CvState {
                waiters: WaitQueue::new(),
            })),
            id: OnceLock::new(),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.id.get_or_init(|| IDS.next())
    }

    /// Wake the front waiter. The caller must hold the associated lock.
    pub fn notify_one(&self, guard: &LockGuard) {
        debug_assert!(guard.is_for(&self.lock), "guard is for a different lock");
        let mut state = self.shared.lock();
        forward(&self.shared, &mut state);
    }

    /// Wake every queued waiter. The caller must hold the associated lock.
    pub fn notify_all(&self, guard: &LockGuard) {
        debug_assert!(guard.is_for(&self.lock), "guard is for a different lock");
        let mut state = self.shared.lock();
        while !state.waiters.is_empty() {
            // Broadcast notifications need no forwarding on abandonment:
            // everyone is being woken anyway.
            let _ = state.waiters.dequeue(Notification { shared: None });
        }
    }

    /// Atomically release the lock, wait for a notification, and re-acquire
    /// the lock before returning.
    ///
    /// A pre-triggered `cancel` returns immediately with the lock still
    /// held. Cancellation of a queued wait also re-acquires the lock before
    /// surfacing [`WaitStatus::Cancelled`].
    pub async fn wait(
        &self,
        guard: LockGuard,
        cancel: &CancellationToken,
    ) -> (LockGuard, WaitStatus) {
        debug_assert!(guard.is_for(&self.lock), "guard is for a different lock");
        if cancel.is_cancelled() {
            return (guard, WaitStatus::Cancelled);
        }
        // Enqueue while still holding the lock, so no notification issued
        // between release and suspension can be missed.
        let handle = { self.shared.lock().waiters.enqueue() };
        drop(guard);

        let shared = &self.shared;
        let outcome = handle
            .cancellable(cancel, |key| shared.lock().waiters.try_cancel(key))
            .await;

        let guard = self.lock.lock_uncancellable().await;
        match outcome {
            Ok(notification) => {
                notification.consume();
                (guard, WaitStatus::Notified)
            }
            Err(WaitCancelled) => (guard, WaitStatus::Cancelled),
        }
    }
}

fn forward(shared: &SharedState, state: &mut CvState) {
    while !state.waiters.is_empty() {
        let notification = Notification {
            shared: Some(Arc::clone(shared)),
        };
        match state.waiters.dequeue(notification) {
            Ok(()) => return,
            Err(mut dead) => dead.defuse(),
        }
    }
}

/// A single delivered notification. If its waiter future is dropped before
/// observing it, `Drop` passes the notification to the next waiter so a
/// `notify_one` is never silently lost.
struct Notification {
    shared: Option<SharedState>,
}

impl Notification {
    fn defuse(&mut self) {
        self.shared = None;
    }

    fn consume(mut self) {
        self.shared = None;
    }
}

impl Drop for Notification {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut state = shared.lock();
            forward(&shared, &mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn notify_one_wakes_in_fifo_order() {
        let tok = token();
        let lock = AsyncLock::new();
        let cv = Condvar::new(&lock);

        let g = lock.lock(&token()).await.unwrap();
        let mut w1 = Box::pin(cv.wait(g, &tok));
        assert!(w1.as_mut().now_or_never().is_none(), "waiting, lock free");

        let g = lock.lock(&token()).await.unwrap();
        let mut w2 = Box::pin(cv.wait(g, &tok));
        assert!(w2.as_mut().now_or_never().is_none());

        let g = lock.lock(&token()).await.unwrap();
        cv.notify_one(&g);
        drop(g);

        let (g1, status) = w1.await;
        assert_eq!(status, WaitStatus::Notified);
        assert!(w2.as_mut().now_or_never().is_none(), "only one notified");
        drop(g1);

        let g = lock.lock(&token()).await.unwrap();
        cv.notify_all(&g);
        drop(g);
        let (_g2, status) = w2.await;
        assert_eq!(status, WaitStatus::Notified);
    }

    #[tokio::test]
    async fn wait_releases_the_lock_while_suspended() {
        let tok = token();
        let lock = AsyncLock::new();
        let cv = Condvar::new(&lock);

        let g = lock.lock(&token()).await.unwrap();
        let mut waiting = Box::pin(cv.wait(g, &tok));
        assert!(waiting.as_mut().now_or_never().is_none());

        // The waiter released the lock; we can take it now.
        let g = lock.lock(&token()).await.unwrap();
        cv.notify_one(&g);

        // Mesa: the notified waiter re-contests the lock, so it cannot
        // finish until we let go.
        assert!(waiting.as_mut().now_or_never().is_none());
        drop(g);
        let (_g, status) = waiting.await;
        assert_eq!(status, WaitStatus::Notified);
    }

    #[tokio::test]
    async fn cancelled_wait_still_holds_the_lock() {
        let lock = AsyncLock::new();
        let cv = Condvar::new(&lock);
        let cancel = token();

        let g = lock.lock(&token()).await.unwrap();
        let mut waiting = Box::pin(cv.wait(g, &cancel));
        assert!(waiting.as_mut().now_or_never().is_none());

        cancel.cancel();
        let (guard, status) = waiting.await;
        assert_eq!(status, WaitStatus::Cancelled);

        // The guard we got back genuinely holds the lock.
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[tokio::test]
    async fn pretriggered_cancel_returns_without_releasing() {
        let lock = AsyncLock::new();
        let cv = Condvar::new(&lock);
        let cancel = token();
        cancel.cancel();

        let g = lock.lock(&token()).await.unwrap();
        let (guard, status) = cv.wait(g, &cancel).await;
        assert_eq!(status, WaitStatus::Cancelled);
        assert!(lock.try_lock().is_none());
        drop(guard);
    }

    #[tokio::test]
    async fn abandoned_notified_waiter_forwards_to_the_next() {
        let tok = token();
        let lock = AsyncLock::new();
        let cv = Condvar::new(&lock);

        let g = lock.lock(&token()).await.unwrap();
        let mut w1 = Box::pin(cv.wait(g, &tok));
        assert!(w1.as_mut().now_or_never().is_none());

        let g = lock.lock(&token()).await.unwrap();
        let mut w2 = Box::pin(cv.wait(g, &tok));
        assert!(w2.as_mut().now_or_never().is_none());

        let g = lock.lock(&token()).await.unwrap();
        cv.notify_one(&g);
        drop(g);

        // First waiter is dropped before it can observe the notification;
        // the notification must move on to the second.
        drop(w1);
        let (_g, status) = w2.await;
        assert_eq!(status, WaitStatus::Notified);
    }

    #[test]
    fn id_is_nonzero() {
        let lock = AsyncLock::new();
        assert_ne!(Condvar::new(&lock).id().get(), 0);
    }
}
