//! Non-reentrant asynchronous lock with scoped release.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled, WaitQueue};

static IDS: IdAllocator = IdAllocator::new();

struct LockState {
    taken: bool,
    waiters: WaitQueue<LockGuard>,
}

pub(crate) struct Shared {
    state: Mutex<LockState>,
    id: OnceLock<NonZeroU32>,
}

/// Asynchronous mutual exclusion.
///
/// `lock` resolves to a [`LockGuard`]; dropping the guard releases the
/// lock, handing it to the next queued waiter in FIFO order. The lock is
/// not re-entrant: acquiring it again from the same logical task deadlocks.
///
/// A wait cancelled while queued leaves the lock exactly as if the wait
/// never happened.
pub struct AsyncLock {
    shared: Arc<Shared>,
}

impl AsyncLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LockState {
                    taken: false,
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

    /// Acquire the lock, waiting in line if it is taken.
    ///
    /// With a pre-triggered `cancel`: a free lock is still acquired (the
    /// signal wins on availability); a taken lock settles as cancelled
    /// without enqueueing.
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<LockGuard, WaitCancelled> {
        let handle = {
            let mut state = self.shared.state.lock();
            if !state.taken {
                state.taken = true;
                return Ok(LockGuard::new(&self.shared));
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

    /// Blocking variant of [`lock`](Self::lock); drives the wait on the
    /// calling thread. Must not be called from async context.
    pub fn blocking_lock(&self, cancel: &CancellationToken) -> Result<LockGuard, WaitCancelled> {
        futures::executor::block_on(self.lock(cancel))
    }

    /// Acquire without waiting; `None` when the lock is taken.
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard> {
        let mut state = self.shared.state.lock();
        if state.taken {
            None
        } else {
            state.taken = true;
            Some(LockGuard::new(&self.shared))
        }
    }

    /// Acquire with no cancellation path. Used where the caller must end up
    /// holding the lock no matter what (condition-variable re-acquisition).
    pub(crate) async fn lock_uncancellable(&self) -> LockGuard {
        let handle = {
            let mut state = self.shared.state.lock();
            if !state.taken {
                state.taken = true;
                return LockGuard::new(&self.shared);
            }
            state.waiters.enqueue()
        };
        // The queue lives as long as `self`; the waiter cannot be dropped.
        handle.await.expect("lock dropped while a waiter was queued")
    }

    /// Second handle onto the same lock, for primitives that embed one.
    pub(crate) fn clone_ref(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLock")
            .field("taken", &self.shared.state.lock().taken)
            .finish()
    }
}

fn release(shared: &Arc<Shared>) {
    let mut state = shared.state.lock();
    while !state.waiters.is_empty() {
        let guard = LockGuard::new(shared);
        match state.waiters.dequeue(guard) {
            Ok(()) => return,
            // The waiter's future is gone; defuse the undelivered guard so
            // its drop cannot re-enter this mutex, and try the next one.
            Err(mut dead) => dead.defuse(),
        }
    }
    state.taken = false;
}

/// Scoped release handle for [`AsyncLock`].
///
/// Dropping the guard releases the lock exactly once. A guard delivered to
/// a waiter whose future was dropped mid-handoff still releases through
/// this `Drop`, so the lock can never be stranded.
pub struct LockGuard {
    shared: Option<Arc<Shared>>,
}

impl LockGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }

    fn defuse(&mut self) {
        self.shared = None;
    }

    /// Whether this guard belongs to `lock`.
    pub(crate) fn is_for(&self, lock: &AsyncLock) -> bool {
        matches!(&self.shared, Some(s) if Arc::ptr_eq(s, &lock.shared))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            release(&shared);
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockGuard")
    }
}
