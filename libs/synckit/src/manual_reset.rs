//! Manual-reset event: a latched signal for many waiters.

use std::num::NonZeroU32;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled, WaitQueue};

static IDS: IdAllocator = IdAllocator::new();

struct MrState {
    set: bool,
    waiters: WaitQueue<()>,
}

/// Event that stays signaled until explicitly reset.
///
/// While set, every wait completes immediately; `reset` only affects waits
/// that arrive afterwards.
pub struct ManualResetEvent {
    state: Mutex<MrState>,
    id: OnceLock<NonZeroU32>,
}

impl ManualResetEvent {
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: Mutex::new(MrState {
                set: initially_set,
                waiters: WaitQueue::new(),
            }),
            id: OnceLock::new(),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.id.get_or_init(|| IDS.next())
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Signal the event, waking every queued waiter. Idempotent.
    pub fn set(&self) {
        let mut state = self.state.lock();
        if state.set {
            return;
        }
        state.set = true;
        state.waiters.dequeue_all(());
    }

    /// Return the event to the unsignaled state. Waits already completed
    /// are unaffected.
    pub fn reset(&self) {
        self.state.lock().set = false;
    }

    /// Wait until the event is set. A set event wins over a pre-triggered
    /// `cancel`.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        let handle = {
            let mut state = self.state.lock();
            if state.set {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            state.waiters.enqueue()
        };
        handle
            .cancellable(cancel, |key| self.state.lock().waiters.try_cancel(key))
            .await
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from
    /// async context.
    pub fn blocking_wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        futures::executor::block_on(self.wait(cancel))
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new(false)
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
    async fn set_wakes_all_waiters_and_latches() {
        let tok = token();
        let event = ManualResetEvent::new(false);
        let mut a = Box::pin(event.wait(&tok));
        let mut b = Box::pin(event.wait(&tok));
        assert!(a.as_mut().now_or_never().is_none());
        assert!(b.as_mut().now_or_never().is_none());

        event.set();
        a.await.unwrap();
        b.await.unwrap();

        // Latched: later waits are immediate.
        event.wait(&token()).await.unwrap();
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn reset_only_affects_future_waits() {
        let tok = token();
        let event = ManualResetEvent::new(true);
        event.wait(&token()).await.unwrap();

        event.reset();
        assert!(!event.is_set());
        let mut blocked = Box::pin(event.wait(&tok));
        assert!(blocked.as_mut().now_or_never().is_none());

        event.set();
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn set_event_beats_pretriggered_cancel() {
        let event = ManualResetEvent::new(true);
        let cancel = token();
        cancel.cancel();
        event.wait(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn unset_event_with_pretriggered_cancel_fails_fast() {
        let event = ManualResetEvent::new(false);
        let cancel = token();
        cancel.cancel();
        assert_eq!(event.wait(&cancel).await.unwrap_err(), WaitCancelled);
    }

    #[tokio::test]
    async fn double_set_is_idempotent() {
        let event = ManualResetEvent::new(false);
        event.set();
        event.set();
        assert!(event.is_set());
    }

    #[test]
    fn id_is_nonzero() {
        assert_ne!(ManualResetEvent::new(false).id().get(), 0);
    }
}
