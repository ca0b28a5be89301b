//! Wait-queue layer of the synckit toolkit.
//!
//! Everything higher up (locks, events, semaphores, the bounded queue) is
//! built from two small pieces:
//!
//! - [`WaitQueue`] — an ordered set of suspended waiters, each completed
//!   through a oneshot handle. The queue itself is a plain data structure;
//!   the owning primitive's mutex provides the synchronization.
//! - [`IdAllocator`] — a monotonic per-type id source that never yields
//!   zero, so `0` can stay the "not yet allocated" sentinel.

pub mod id;
pub mod queue;

pub use id::IdAllocator;
pub use queue::{WaitCancelled, WaitHandle, WaitKey, WaitQueue};
