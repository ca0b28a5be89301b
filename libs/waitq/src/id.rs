//! Monotonic per-type id allocation.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic id source that never yields zero.
///
/// One `static` allocator exists per primitive type; instances allocate
/// lazily on first access. Ids may wrap after exhausting the counter but
/// zero is always skipped, so it remains usable as the "unset" sentinel.
pub struct IdAllocator(AtomicU32);

impl IdAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Hand out the next id, skipping zero on wrap-around.
    pub fn next(&self) -> NonZeroU32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(id) = NonZeroU32::new(id) {
                return id;
            }
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
