//! Serial synchronization context: exposes a [`SerialTaskQueue`] as a
//! cooperative dispatch target.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use futures::task::{FutureObj, Spawn, SpawnError};
use parking_lot::RwLock;

use crate::serial::{SerialTaskQueue, TaskFault};

// Process-wide registry of queues known to serialize their callbacks, so
// observers can ask whether a given dispatch target is serial.
static SERIALIZING: OnceLock<RwLock<HashSet<NonZeroU32>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashSet<NonZeroU32>> {
    SERIALIZING.get_or_init(|| RwLock::new(HashSet::new()))
}

/// Whether `queue_id` belongs to a dispatch target registered as
/// serializing (one callback at a time, in order).
#[must_use]
pub fn serializes(queue_id: NonZeroU32) -> bool {
    registry().read().contains(&queue_id)
}

/// Dispatch-target adapter over a [`SerialTaskQueue`].
///
/// `post` delivers fire-and-forget callbacks, `send` blocks the calling
/// thread until the callback finished, and the [`Spawn`] implementation
/// lets the context stand in wherever the futures ecosystem expects a
/// spawner. Construction registers the underlying queue as serializing.
#[derive(Clone)]
pub struct SerialContext {
    queue: Arc<SerialTaskQueue>,
}

impl SerialContext {
    /// New context over a fresh queue. Must be created within a tokio
    /// runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::for_queue(Arc::new(SerialTaskQueue::new()))
    }

    /// Adapter over an existing queue.
    #[must_use]
    pub fn for_queue(queue: Arc<SerialTaskQueue>) -> Self {
        registry().write().insert(queue.id());
        Self { queue }
    }

    /// The wrapped queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<SerialTaskQueue> {
        &self.queue
    }

    /// Queue `callback` for ordered execution; do not wait for it.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.queue.enqueue(callback);
    }

    /// Queue `callback` and block until it completed, propagating its
    /// fault. Must not be called from async context, nor from a callback
    /// already running on this queue (that deadlocks).
    pub fn send<F, T>(&self, callback: F) -> Result<T, TaskFault>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        futures::executor::block_on(self.queue.enqueue(callback))
    }

    /// Another adapter over the same queue.
    #[must_use]
    pub fn create_copy(&self) -> Self {
        self.clone()
    }
}

impl Default for SerialContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Spawn for SerialContext {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        let _ = self.queue.enqueue_future(move || future);
        Ok(())
    }
}

// Contexts compare by the identity of the queue they dispatch onto.
impl PartialEq for SerialContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

impl Eq for SerialContext {}

impl Hash for SerialContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.queue.id().hash(state);
    }
}

impl fmt::Debug for SerialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialContext")
            .field("queue_id", &self.queue.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::SpawnExt;
    use parking_lot::Mutex;
    use std::collections::hash_map::DefaultHasher;

    #[tokio::test]
    async fn construction_registers_the_queue_as_serializing() {
        let ctx = SerialContext::new();
        assert!(serializes(ctx.queue().id()));

        // An unregistered queue is not serializing as far as the registry
        // is concerned.
        let bare = SerialTaskQueue::new();
        assert!(!serializes(bare.id()));
    }

    #[tokio::test]
    async fn post_runs_in_order() {
        let ctx = SerialContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            ctx.post(move || seen.lock().push(i));
        }
        // Synchronize on a final queued callback.
        ctx.queue().enqueue(|| ()).await.unwrap();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn spawn_interface_dispatches_onto_the_queue() {
        let ctx = SerialContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            ctx.spawn(async move { seen.lock().push("spawned") })
                .unwrap();
        }
        ctx.queue().enqueue(|| ()).await.unwrap();
        assert_eq!(*seen.lock(), vec!["spawned"]);
    }

    #[tokio::test]
    async fn copies_compare_equal_and_hash_alike() {
        let ctx = SerialContext::new();
        let copy = ctx.create_copy();
        let other = SerialContext::new();

        assert_eq!(ctx, copy);
        assert_ne!(ctx, other);

        let hash = |c: &SerialContext| {
            let mut h = DefaultHasher::new();
            c.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&ctx), hash(&copy));
    }

    #[test]
    fn send_blocks_until_completion() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let ctx = {
            let _guard = runtime.enter();
            SerialContext::new()
        };
        // Blocking dispatch from a thread outside the runtime.
        assert_eq!(ctx.send(|| 6 * 7).unwrap(), 42);
    }
}
