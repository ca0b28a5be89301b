//! Shared-reader / exclusive-writer asynchronous lock with writer priority.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled, WaitQueue};

static IDS: IdAllocator = IdAllocator::new();

// locks_held: -1 = writer holds, 0 = idle, n > 0 = n readers.
struct RwState {
    locks_held: i64,
    writer_waiters: WaitQueue<WriteGuard>,
    reader_waiters: WaitQueue<ReadGuard>,
}

struct Shared {
    state: Mutex<RwState>,
    id: OnceLock<NonZeroU32>,
}

/// Asynchronous reader/writer lock.
///
/// Any number of readers share the lock; a writer holds it exclusively.
/// Writers have priority: while one is queued, no new reader is admitted,
/// even though current readers keep theirs until release. Cancelling a
/// queued writer re-runs the release scan so queued readers are not left
/// stranded behind it.
pub struct AsyncRwLock {
    shared: Arc<Shared>,
}

impl AsyncRwLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RwState {
                    locks_held: 0,
                    writer_waiters: WaitQueue::new(),
                    reader_waiters: WaitQueue::new(),
                }),
                id: OnceLock::new(),
            }),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.shared.id.get_or_init(|| IDS.next())
    }

    /// Acquire a shared reader slot.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<ReadGuard, WaitCancelled> {
        let handle = {
            let mut state = self.shared.state.lock();
            if state.locks_held >= 0 && state.writer_waiters.is_empty() {
                state.locks_held += 1;
                return Ok(ReadGuard::new(&self.shared));
            }
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            state.reader_waiters.enqueue()
        };
        let shared = &self.shared;
        handle
            .cancellable(cancel, |key| {
                shared.state.lock().reader_waiters.try_cancel(key)
            })
            .await
    }

    /// Acquire the exclusive writer slot.
    pub async fn write(&self, cancel: &CancellationToken) -> Result<WriteGuard, WaitCancelled> {
        let handle = {
            let mut state = self.shared.state.lock();
            if state.locks_held == 0 {
                state.locks_held = -1;
                return Ok(WriteGuard::new(&self.shared));
            }
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            state.writer_waiters.enqueue()
        };
        let shared = &self.shared;
        handle
            .cancellable(cancel, |key| {
                let mut state = shared.state.lock();
                let removed = state.writer_waiters.try_cancel(key);
                if removed {
                    // The queued writer was blocking readers; re-scan so
                    // whoever can now proceed does.
                    release_waiters(shared, &mut state);
                }
                removed
            })
            .await
    }

    /// Blocking variant of [`read`](Self::read). Must not be called from
    /// async context.
    pub fn blocking_read(&self, cancel: &CancellationToken) -> Result<ReadGuard, WaitCancelled> {
        futures::executor::block_on(self.read(cancel))
    }

    /// Blocking variant of [`write`](Self::write). Must not be called from
    /// async context.
    pub fn blocking_write(&self, cancel: &CancellationToken) -> Result<WriteGuard, WaitCancelled> {
        futures::executor::block_on(self.write(cancel))
    }

    /// Take a reader slot without waiting.
    #[must_use]
    pub fn try_read(&self) -> Option<ReadGuard> {
        let mut state = self.shared.state.lock();
        if state.locks_held >= 0 && state.writer_waiters.is_empty() {
            state.locks_held += 1;
            Some(ReadGuard::new(&self.shared))
        } else {
            None
        }
    }

    /// Take the writer slot without waiting.
    #[must_use]
    pub fn try_write(&self) -> Option<WriteGuard> {
        let mut state = self.shared.state.lock();
        if state.locks_held == 0 {
            state.locks_held = -1;
            Some(WriteGuard::new(&self.shared))
        } else {
            None
        }
    }
}

impl Default for AsyncRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRwLock")
            .field("locks_held", &self.shared.state.lock().locks_held)
            .finish()
    }
}

// Hand the lock to whoever is eligible. Writers first: one writer when the
// lock is idle; otherwise, with no writer queued, every queued reader.
fn release_waiters(shared: &Arc<Shared>, state: &mut RwState) {
    if state.locks_held == -1 {
        return;
    }
    while !state.writer_waiters.is_empty() {
        if state.locks_held != 0 {
            // Readers still hold the lock; the writer keeps its priority
            // and everyone waits for the remaining releases.
            return;
        }
        let guard = WriteGuard::new(shared);
        match state.writer_waiters.dequeue(guard) {
            Ok(()) => {
                state.locks_held = -1;
                return;
            }
            Err(mut dead) => dead.defuse(),
        }
    }
    while !state.reader_waiters.is_empty() {
        let guard = ReadGuard::new(shared);
        match state.reader_waiters.dequeue(guard) {
            Ok(()) => state.locks_held += 1,
            Err(mut dead) => dead.defuse(),
        }
    }
}

/// Shared reader slot; dropping it releases the slot.
pub struct ReadGuard {
    shared: Option<Arc<Shared>>,
}

impl ReadGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }

    fn defuse(&mut self) {
        self.shared = None;
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut state = shared.state.lock();
            state.locks_held -= 1;
            release_waiters(&shared, &mut state);
        }
    }
}

impl fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadGuard")
    }
}

/// Exclusive writer slot; dropping it releases the lock.
pub struct WriteGuard {
    shared: Option<Arc<Shared>>,
}

impl WriteGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }

    fn defuse(&mut self) {
        self.shared = None;
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut state = shared.state.lock();
            state.locks_held = 0;
            release_waiters(&shared, &mut state);
        }
    }
}

impl fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteGuard")
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
    async fn readers_share_writers_exclude() {
        let tok = token();
        let rw = AsyncRwLock::new();
        let r1 = rw.read(&token()).await.unwrap();
        let r2 = rw.read(&token()).await.unwrap();

        let mut w = Box::pin(rw.write(&tok));
        assert!(w.as_mut().now_or_never().is_none());

        drop(r1);
        assert!(w.as_mut().now_or_never().is_none(), "one reader remains");
        drop(r2);
        let _writer = w.await.unwrap();
        assert!(rw.try_read().is_none());
    }

    #[tokio::test]
    async fn queued_writer_blocks_new_readers() {
        let tok = token();
        let rw = AsyncRwLock::new();
        let r1 = rw.read(&token()).await.unwrap();

        let mut w = Box::pin(rw.write(&tok));
        assert!(w.as_mut().now_or_never().is_none());

        // A new reader must queue behind the writer even though readers
        // currently hold the lock.
        let mut r2 = Box::pin(rw.read(&tok));
        assert!(r2.as_mut().now_or_never().is_none());
        assert!(rw.try_read().is_none());

        drop(r1);
        let writer = w.await.unwrap();
        assert!(r2.as_mut().now_or_never().is_none());

        drop(writer);
        let _r2 = r2.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_writer_unblocks_queued_readers() {
        let tok = token();
        let rw = AsyncRwLock::new();
        let r1 = rw.read(&token()).await.unwrap();

        let cancel = token();
        let mut w = Box::pin(rw.write(&cancel));
        assert!(w.as_mut().now_or_never().is_none());

        let mut r2 = Box::pin(rw.read(&tok));
        assert!(r2.as_mut().now_or_never().is_none());

        cancel.cancel();
        assert_eq!(w.await.unwrap_err(), WaitCancelled);

        // The release scan triggered by the cancellation admits the reader.
        let _r2 = r2.await.unwrap();
        drop(r1);
    }

    #[tokio::test]
    async fn writer_release_admits_all_queued_readers() {
        let tok = token();
        let rw = AsyncRwLock::new();
        let writer = rw.write(&token()).await.unwrap();

        let mut r1 = Box::pin(rw.read(&tok));
        let mut r2 = Box::pin(rw.read(&tok));
        assert!(r1.as_mut().now_or_never().is_none());
        assert!(r2.as_mut().now_or_never().is_none());

        drop(writer);
        let _g1 = r1.await.unwrap();
        let _g2 = r2.await.unwrap();
    }

    #[tokio::test]
    async fn queued_writers_hand_off_in_order() {
        let tok = token();
        let rw = AsyncRwLock::new();
        let first = rw.write(&token()).await.unwrap();

        let mut w1 = Box::pin(rw.write(&tok));
        let mut w2 = Box::pin(rw.write(&tok));
        assert!(w1.as_mut().now_or_never().is_none());
        assert!(w2.as_mut().now_or_never().is_none());

        drop(first);
        let g1 = w1.await.unwrap();
        assert!(w2.as_mut().now_or_never().is_none());
        drop(g1);
        let _g2 = w2.await.unwrap();
    }

    #[tokio::test]
    async fn pretriggered_cancel_takes_an_available_slot() {
        let rw = AsyncRwLock::new();
        let cancel = token();
        cancel.cancel();

        // Available: the signal wins and the slot is claimed.
        let reader = rw.read(&cancel).await.unwrap();
        // Unavailable: cancellation is delivered without enqueueing.
        assert_eq!(rw.write(&cancel).await.unwrap_err(), WaitCancelled);
        drop(reader);
        assert!(rw.write(&cancel).await.is_ok());
    }

    #[tokio::test]
    async fn try_variants_respect_state() {
        let rw = AsyncRwLock::new();
        let r = rw.try_read().unwrap();
        assert!(rw.try_write().is_none());
        drop(r);
        let w = rw.try_write().unwrap();
        assert!(rw.try_read().is_none());
        drop(w);
    }

    #[test]
    fn id_is_nonzero() {
        assert_ne!(AsyncRwLock::new().id().get(), 0);
    }
}
