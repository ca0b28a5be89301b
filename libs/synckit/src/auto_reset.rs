//! Auto-reset event: each signal releases at most one waiter.

use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled, WaitQueue};

static IDS: IdAllocator = IdAllocator::new();

struct ArState {
    set: bool,
    waiters: WaitQueue<Signal>,
}

type SharedState = Arc<Mutex<ArState>>;

/// Event that hands each signal to exactly one waiter.
///
/// `set` with waiters queued wakes the front one; with none it latches,
/// and the next wait consumes the latch. Signaling an already-set event
/// is a no-op.
///
/// A waiter cancelled while queued does not consume a signal: a later
/// `set` goes to the next eligible waiter or latches.
pub struct AutoResetEvent {
    shared: SharedState,
    id: OnceLock<NonZeroU32>,
}

impl AutoResetEvent {
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ArState {
                set: initially_set,
                waiters: WaitQueue::new(),
            })),
            id: OnceLock::new(),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.id.get_or_init(|| IDS.next())
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.shared.lock().set
    }

    /// Signal the event: wake the front waiter, or latch when none is
    /// queued.
    pub fn set(&self) {
        let mut state = self.shared.lock();
        if state.set {
            return;
        }
        deliver(&self.shared, &mut state);
    }

    /// Wait for a signal, consuming it. A latched signal wins over a
    /// pre-triggered `cancel`.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        let handle = {
            let mut state = self.shared.lock();
            if state.set {
                state.set = false;
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            state.waiters.enqueue()
        };
        let shared = &self.shared;
        let signal = handle
            .cancellable(cancel, |key| shared.lock().waiters.try_cancel(key))
            .await?;
        signal.consume();
        Ok(())
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from
    /// async context.
    pub fn blocking_wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        futures::executor::block_on(self.wait(cancel))
    }
}

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

fn deliver(shared: &SharedState, state: &mut ArState) {
    while !state.waiters.is_empty() {
        let signal = Signal::new(shared);
        match state.waiters.dequeue(signal) {
            Ok(()) => return,
            Err(mut dead) => dead.defuse(),
        }
    }
    state.set = true;
}

/// One delivered signal. If the receiving waiter's future is dropped
/// before observing it, `Drop` re-delivers: the signal moves on to the
/// next waiter or latches instead of getting lost.
struct Signal {
    shared: Option<SharedState>,
}

impl Signal {
    fn new(shared: &SharedState) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }

    fn defuse(&mut self) {
        self.shared = None;
    }

    fn consume(mut self) {
        self.shared = None;
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut state = shared.lock();
            deliver(&shared, &mut state);
        }
    }
}
