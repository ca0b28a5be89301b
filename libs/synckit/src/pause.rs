//! Cooperative pause/resume shared across tasks.

use std::num::NonZeroU32;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use waitq::WaitCancelled;

use crate::manual_reset::ManualResetEvent;

/// Owner side of a pause signal.
///
/// The source starts unpaused. Tasks hold [`PauseToken`] snapshots and call
/// `wait_while_paused` at safe points; while the source is paused those
/// waits suspend, and `resume` lets everyone continue.
pub struct PauseTokenSource {
    // Set = running, unset = paused.
    event: Arc<ManualResetEvent>,
}

impl PauseTokenSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            event: Arc::new(ManualResetEvent::new(true)),
        }
    }

    /// Identifier of the underlying event.
    pub fn id(&self) -> NonZeroU32 {
        self.event.id()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        !self.event.is_set()
    }

    pub fn pause(&self) {
        self.event.reset();
    }

    pub fn resume(&self) {
        self.event.set();
    }

    pub fn set_paused(&self, paused: bool) {
        if paused {
            self.pause();
        } else {
            self.resume();
        }
    }

    /// Token handing out the pause state to a task.
    #[must_use]
    pub fn token(&self) -> PauseToken {
        PauseToken {
            event: Some(Arc::clone(&self.event)),
        }
    }

    /// Suspend while paused.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        self.event.wait(cancel).await
    }
}

impl Default for PauseTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Value-typed snapshot of a pause source.
///
/// A default-constructed token has no source and can never be paused; its
/// waits return immediately.
#[derive(Clone, Default)]
pub struct PauseToken {
    event: Option<Arc<ManualResetEvent>>,
}

impl PauseToken {
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.event.as_ref().is_some_and(|event| !event.is_set())
    }

    /// Suspend while the source is paused.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        match &self.event {
            Some(event) => event.wait(cancel).await,
            None => Ok(()),
        }
    }

    /// Blocking variant of [`wait_while_paused`](Self::wait_while_paused).
    /// Must not be called from async context.
    pub fn blocking_wait_while_paused(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), WaitCancelled> {
        futures::executor::block_on(self.wait_while_paused(cancel))
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
    async fn pause_suspends_and_resume_releases() {
        let tok = token();
        let source = PauseTokenSource::new();
        let pause = source.token();

        // Unpaused: waits pass straight through.
        pause.wait_while_paused(&token()).await.unwrap();

        source.pause();
        assert!(source.is_paused());
        assert!(pause.is_paused());

        let mut waiting = Box::pin(pause.wait_while_paused(&tok));
        assert!(waiting.as_mut().now_or_never().is_none());

        source.resume();
        waiting.await.unwrap();
        assert!(!pause.is_paused());
    }

    #[tokio::test]
    async fn tokens_are_shared_snapshots() {
        let source = PauseTokenSource::new();
        let a = source.token();
        let b = a.clone();

        source.set_paused(true);
        assert!(a.is_paused());
        assert!(b.is_paused());
        source.set_paused(false);
        assert!(!a.is_paused());
        assert!(!b.is_paused());
    }

    #[tokio::test]
    async fn default_token_never_pauses() {
        let pause = PauseToken::default();
        assert!(!pause.is_paused());
        pause.wait_while_paused(&token()).await.unwrap();
    }

    #[tokio::test]
    async fn paused_wait_can_be_cancelled() {
        let source = PauseTokenSource::new();
        source.pause();
        let pause = source.token();

        let cancel = token();
        let mut waiting = Box::pin(pause.wait_while_paused(&cancel));
        assert!(waiting.as_mut().now_or_never().is_none());
        cancel.cancel();
        assert_eq!(waiting.await.unwrap_err(), WaitCancelled);
    }
}
