//! # Synckit — asynchronous coordination toolkit
//!
//! A family of primitives that let cooperative tasks synchronize, signal,
//! wait, and share access to resources without blocking OS threads:
//!
//! - [`AsyncLock`] — non-reentrant mutual exclusion with scoped release
//! - [`AsyncSemaphore`] — counted permits with release-many
//! - [`ManualResetEvent`] / [`AutoResetEvent`] — latched and single-shot signals
//! - [`AsyncRwLock`] — shared readers / exclusive writer, writer priority
//! - [`CountdownEvent`] — counted signal that latches at zero
//! - [`Condvar`] / [`Monitor`] — mesa-style condition variable and its
//!   lock-plus-condvar bundle
//! - [`BoundedQueue`] — bounded producer/consumer queue with a completion
//!   marker
//! - [`AsyncLazy`] — one-shot asynchronous initialization with optional
//!   retry-on-failure
//! - [`PauseTokenSource`] / [`PauseToken`] — cooperative pause/resume
//! - [`SerialTaskQueue`] / [`SerialContext`] — strictly ordered callback
//!   execution and its dispatch-target adapter
//!
//! All waits accept a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and resolve promptly with [`WaitCancelled`] without claiming the
//! resource. A pre-triggered token short-circuits synchronously: when the
//! resource is immediately available it is taken (the signal wins),
//! otherwise the wait settles as cancelled without touching the queue.
//!
//! `blocking_*` variants drive the wait on the calling thread and must not
//! be used from async context.

pub mod auto_reset;
pub mod condvar;
pub mod countdown;
pub mod lazy;
pub mod lock;
pub mod manual_reset;
pub mod monitor;
pub mod pause;
pub mod queue;
pub mod rwlock;
pub mod semaphore;
pub mod serial;
pub mod sync_context;

pub use auto_reset::AutoResetEvent;
pub use condvar::{Condvar, WaitStatus};
pub use countdown::CountdownEvent;
pub use lazy::{AsyncLazy, LazyError, LazyOptions};
pub use lock::{AsyncLock, LockGuard};
pub use manual_reset::ManualResetEvent;
pub use monitor::Monitor;
pub use pause::{PauseToken, PauseTokenSource};
pub use queue::{BoundedQueue, QueueConfigError, QueueError};
pub use rwlock::{AsyncRwLock, ReadGuard, WriteGuard};
pub use semaphore::{AsyncSemaphore, SemaphoreGuard};
pub use serial::{SerialHandle, SerialTaskQueue, TaskFault};
pub use sync_context::SerialContext;

// Re-export the wait-queue layer's cancellation outcome; it is part of
// every wait operation's signature.
pub use waitq::WaitCancelled;

/// Checked-arithmetic failure on a primitive's counter: a semaphore
/// release or a countdown delta would overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("counter overflow")]
pub struct OverflowError;
