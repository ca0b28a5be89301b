//! Monitor: an [`AsyncLock`] and a [`Condvar`] bundled together.

use std::num::NonZeroU32;

use tokio_util::sync::CancellationToken;
use waitq::WaitCancelled;

use crate::condvar::{Condvar, WaitStatus};
use crate::lock::{AsyncLock, LockGuard};

/// Lock + condition variable under one roof, for the common
/// enter / check / wait / pulse pattern.
pub struct Monitor {
    lock: AsyncLock,
    cv: Condvar,
}

impl Monitor {
    #[must_use]
    pub fn new() -> Self {
        let lock = AsyncLock::new();
        let cv = Condvar::new(&lock);
        Self { lock, cv }
    }

    /// The monitor's identifier is its lock's identifier.
    pub fn id(&self) -> NonZeroU32 {
        self.lock.id()
    }

    /// Enter the monitor (acquire its lock).
    pub async fn enter(&self, cancel: &CancellationToken) -> Result<LockGuard, WaitCancelled> {
        self.lock.lock(cancel).await
    }

    /// Blocking variant of [`enter`](Self::enter). Must not be called from
    /// async context.
    pub fn blocking_enter(&self, cancel: &CancellationToken) -> Result<LockGuard, WaitCancelled> {
        self.lock.blocking_lock(cancel)
    }

    /// Enter without waiting; `None` when the monitor is held.
    #[must_use]
    pub fn try_enter(&self) -> Option<LockGuard> {
        self.lock.try_lock()
    }

    /// Release the monitor, wait for a pulse, re-enter before returning.
    pub async fn wait(
        &self,
        guard: LockGuard,
        cancel: &CancellationToken,
    ) -> (LockGuard, WaitStatus) {
        self.cv.wait(guard, cancel).await
    }

    /// Wake one waiter. The caller must hold the monitor.
    pub fn pulse(&self, guard: &LockGuard) {
        self.cv.notify_one(guard);
    }

    /// Wake every waiter. The caller must hold the monitor.
    pub fn pulse_all(&self, guard: &LockGuard) {
        self.cv.notify_all(guard);
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
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
    async fn enter_wait_pulse_round_trip() {
        let tok = token();
        let monitor = Monitor::new();

        let g = monitor.enter(&token()).await.unwrap();
        let mut waiting = Box::pin(monitor.wait(g, &tok));
        assert!(waiting.as_mut().now_or_never().is_none());

        let g = monitor.enter(&token()).await.unwrap();
        monitor.pulse(&g);
        drop(g);

        let (_g, status) = waiting.await;
        assert_eq!(status, WaitStatus::Notified);
    }

    #[tokio::test]
    async fn monitor_is_exclusive() {
        let monitor = Monitor::new();
        let g = monitor.enter(&token()).await.unwrap();
        assert!(monitor.try_enter().is_none());
        drop(g);
        assert!(monitor.try_enter().is_some());
    }

    #[test]
    fn id_matches_across_accesses() {
        let monitor = Monitor::new();
        assert_ne!(monitor.id().get(), 0);
        assert_eq!(monitor.id(), monitor.id());
    }
}
