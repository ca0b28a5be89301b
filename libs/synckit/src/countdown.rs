//! Countdown event: a counted signal that latches when it reaches zero.

use std::num::NonZeroU32;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use waitq::{IdAllocator, WaitCancelled};

use crate::manual_reset::ManualResetEvent;
use crate::OverflowError;

static IDS: IdAllocator = IdAllocator::new();

/// Event that becomes signaled exactly while its count is zero.
///
/// `signal` moves the count toward zero, `add_count` away from it; both
/// are checked and commutative in net effect. Crossing zero without
/// landing on it pulses the inner event so waiters see a brief signal.
pub struct CountdownEvent {
    count: Mutex<i64>,
    event: ManualResetEvent,
    id: OnceLock<NonZeroU32>,
}

impl CountdownEvent {
    /// New event with the given remaining count; signaled iff it is zero.
    #[must_use]
    pub fn new(initial_count: i64) -> Self {
        Self {
            count: Mutex::new(initial_count),
            event: ManualResetEvent::new(initial_count == 0),
            id: OnceLock::new(),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.id.get_or_init(|| IDS.next())
    }

    /// Remaining count.
    #[must_use]
    pub fn count(&self) -> i64 {
        *self.count.lock()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.event.is_set()
    }

    /// Record one signal.
    pub fn signal(&self) -> Result<(), OverflowError> {
        self.signal_many(1)
    }

    /// Record `n` signals.
    ///
    /// # Panics
    ///
    /// Panics when `n` is negative.
    pub fn signal_many(&self, n: i64) -> Result<(), OverflowError> {
        assert!(n >= 0, "cannot signal a negative number of times");
        self.modify(n.checked_neg().ok_or(OverflowError)?)
    }

    /// Raise the remaining count by one.
    pub fn add_count(&self) -> Result<(), OverflowError> {
        self.add_count_many(1)
    }

    /// Raise the remaining count by `n`.
    ///
    /// # Panics
    ///
    /// Panics when `n` is negative.
    pub fn add_count_many(&self, n: i64) -> Result<(), OverflowError> {
        assert!(n >= 0, "cannot add a negative count");
        self.modify(n)
    }

    // Single transition point for both directions.
    fn modify(&self, delta: i64) -> Result<(), OverflowError> {
        let mut count = self.count.lock();
        let old = *count;
        let new = old.checked_add(delta).ok_or(OverflowError)?;
        *count = new;
        if old == 0 && new != 0 {
            self.event.reset();
        } else if old != 0 && new == 0 {
            self.event.set();
        } else if (old > 0 && new < 0) || (old < 0 && new > 0) {
            // Crossed zero without landing on it: pulse so current
            // waiters wake while the event ends up unsignaled.
            self.event.set();
            self.event.reset();
        }
        Ok(())
    }

    /// Wait until the count is zero.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        self.event.wait(cancel).await
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from
    /// async context.
    pub fn blocking_wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        futures::executor::block_on(self.wait(cancel))
    }
}
