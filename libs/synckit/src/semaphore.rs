//! Counted-permit asynchronous semaphore.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled, WaitQueue};

use crate::OverflowError;

static IDS: IdAllocator = IdAllocator::new();

struct SemState {
    count: i64,
    waiters: WaitQueue<SemaphoreGuard>,
}

struct Shared {
    state: Mutex<SemState>,
    id: OnceLock<NonZeroU32>,
}

/// Asynchronous semaphore.
///
/// `release_many(n)` hands permits to up to `n` queued waiters directly and
/// adds the remainder to the counter, so `release(n)` followed by
/// `release(m)` is observationally equal to `release(n + m)`.
pub struct AsyncSemaphore {
    shared: Arc<Shared>,
}

impl AsyncSemaphore {
    /// New semaphore with `initial` free permits.
    ///
    /// # Panics
    ///
    /// Panics when `initial` is negative.
    #[must_use]
    pub fn new(initial: i64) -> Self {
        assert!(initial >= 0, "initial semaphore count must be non-negative");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SemState {
                    count: initial,
                    waiters: WaitQueue::new(),
                }),
                id: OnceLock::new(),
            }),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.shared.id.get_or_init(|| IDS.next())
    }

    /// Currently free permits.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.shared.state.lock().count
    }

    /// Acquire one permit and keep it until the returned guard is dropped.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SemaphoreGuard, WaitCancelled> {
        let handle = {
            let mut state = self.shared.state.lock();
            if state.count != 0 {
                state.count -= 1;
                return Ok(SemaphoreGuard::new(&self.shared));
            }
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            state.waiters.enqueue()
        };
        let shared = &self.shared;
        handle
            .cancellable(cancel, |key| shared.state.lock().waiters.try_cancel(key))
            .await
    }

    /// Acquire one permit and consume it; the caller releases explicitly
    /// via [`release`](Self::release) when appropriate.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        self.acquire(cancel).await.map(SemaphoreGuard::forget)
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from
    /// async context.
    pub fn blocking_wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        futures::executor::block_on(self.wait(cancel))
    }

    /// Return one permit.
    pub fn release(&self) -> Result<(), OverflowError> {
        self.release_many(1)
    }

    /// Return `n` permits. Queued waiters are satisfied first (the permit
    /// transfers directly); the remainder increments the counter.
    /// Releasing zero is a no-op.
    ///
    /// # Panics
    ///
    /// Panics when `n` is negative.
    pub fn release_many(&self, n: i64) -> Result<(), OverflowError> {
        assert!(n >= 0, "cannot release a negative number of permits");
        if n == 0 {
            return Ok(());
        }
        release_shared(&self.shared, n)
    }
}

impl fmt::Debug for AsyncSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSemaphore")
            .field("count", &self.count())
            .finish()
    }
}

fn release_shared(shared: &Arc<Shared>, n: i64) -> Result<(), OverflowError> {
    let mut state = shared.state.lock();
    // Verify the whole release fits before distributing any of it.
    state.count.checked_add(n).ok_or(OverflowError)?;
    let mut remaining = n;
    while remaining > 0 && !state.waiters.is_empty() {
        let guard = SemaphoreGuard::new(shared);
        match state.waiters.dequeue(guard) {
            Ok(()) => remaining -= 1,
            Err(mut dead) => dead.defuse(),
        }
    }
    state.count += remaining;
    Ok(())
}

/// Scoped permit for [`AsyncSemaphore`]; dropping it releases one permit.
pub struct SemaphoreGuard {
    shared: Option<Arc<Shared>>,
}

impl SemaphoreGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }

    fn defuse(&mut self) {
        self.shared = None;
    }

    /// Consume the permit without returning it to the semaphore.
    pub fn forget(mut self) {
        self.shared = None;
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            // Adding one permit back after a successful acquire cannot
            // overflow a live counter.
            let _ = release_shared(&shared, 1);
        }
    }
}

impl fmt::Debug for SemaphoreGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SemaphoreGuard")
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
    async fn wait_consumes_and_release_restores() {
        let tok = token();
        let sem = AsyncSemaphore::new(2);
        sem.wait(&token()).await.unwrap();
        sem.wait(&token()).await.unwrap();
        assert_eq!(sem.count(), 0);

        let mut blocked = Box::pin(sem.wait(&tok));
        assert!(blocked.as_mut().now_or_never().is_none());

        sem.release().unwrap();
        blocked.await.unwrap();
        assert_eq!(sem.count(), 0, "permit went to the waiter, not the count");
    }

    #[tokio::test]
    async fn starts_empty_signals_one_waiter_per_release() {
        let tok = token();
        let sem = AsyncSemaphore::new(0);
        let mut first = Box::pin(sem.wait(&tok));
        assert!(first.as_mut().now_or_never().is_none());

        sem.release().unwrap();
        first.await.unwrap();

        let mut second = Box::pin(sem.wait(&tok));
        assert!(second.as_mut().now_or_never().is_none());
        sem.release().unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn release_many_prefers_waiters_then_counts() {
        let tok = token();
        let sem = AsyncSemaphore::new(0);
        let mut a = Box::pin(sem.wait(&tok));
        let mut b = Box::pin(sem.wait(&tok));
        assert!(a.as_mut().now_or_never().is_none());
        assert!(b.as_mut().now_or_never().is_none());

        sem.release_many(3).unwrap();
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(sem.count(), 1);
    }

    #[tokio::test]
    async fn release_zero_is_a_noop() {
        let sem = AsyncSemaphore::new(1);
        sem.release_many(0).unwrap();
        assert_eq!(sem.count(), 1);
    }

    #[tokio::test]
    async fn release_overflow_is_rejected() {
        let sem = AsyncSemaphore::new(1);
        assert_eq!(sem.release_many(i64::MAX), Err(OverflowError));
        assert_eq!(sem.count(), 1, "failed release must not change state");
    }

    #[tokio::test]
    async fn cancelled_waiter_consumes_no_permit() {
        let sem = AsyncSemaphore::new(0);
        let cancel = token();
        let mut waiter = Box::pin(sem.wait(&cancel));
        assert!(waiter.as_mut().now_or_never().is_none());

        cancel.cancel();
        assert_eq!(waiter.await.unwrap_err(), WaitCancelled);

        sem.release().unwrap();
        assert_eq!(sem.count(), 1, "permit latches instead of vanishing");
    }

    #[tokio::test]
    async fn guard_drop_releases_once() {
        let sem = AsyncSemaphore::new(1);
        let guard = sem.acquire(&token()).await.unwrap();
        assert_eq!(sem.count(), 0);
        drop(guard);
        assert_eq!(sem.count(), 1);
    }

    #[tokio::test]
    async fn pretriggered_cancel_takes_an_available_permit() {
        let sem = AsyncSemaphore::new(1);
        let cancel = token();
        cancel.cancel();
        sem.wait(&cancel).await.unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn id_is_nonzero() {
        assert_ne!(AsyncSemaphore::new(0).id().get(), 0);
    }
}
