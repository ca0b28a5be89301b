//! One-shot asynchronous initialization with optional retry-on-failure.

use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use waitq::IdAllocator;

static IDS: IdAllocator = IdAllocator::new();

/// How a factory failure surfaces to awaiters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LazyError {
    #[error("initialization failed: {0}")]
    Failed(Arc<anyhow::Error>),
    #[error("initialization task panicked")]
    Panicked,
}

/// Behavior switches for [`AsyncLazy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LazyOptions {
    /// Discard a failed attempt so the next access invokes the factory
    /// again. Without this, the failure is cached like a success.
    pub retry_on_failure: bool,
    /// Run the factory inline on the first awaiting task instead of
    /// dispatching it onto the runtime's worker pool.
    pub run_on_awaiting_task: bool,
}

type Factory<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;
type Attempt<T> = Shared<BoxFuture<'static, Result<T, LazyError>>>;

struct Slot<T> {
    generation: u64,
    attempt: Attempt<T>,
}

struct LazyState<T> {
    slot: Option<Slot<T>>,
    next_generation: u64,
}

/// Asynchronously initialized value.
///
/// The factory runs at most once per attempt; all concurrent awaiters
/// observe the same in-flight attempt, and a successful result is cached
/// for good. `T` must be `Clone` because every awaiter receives the value.
///
/// With the default options the factory is dispatched onto the runtime
/// (`tokio::spawn`), so forcing the slot requires a running runtime.
pub struct AsyncLazy<T> {
    factory: Factory<T>,
    options: LazyOptions,
    state: Mutex<LazyState<T>>,
    id: OnceLock<NonZeroU32>,
}

impl<T: Clone + Send + 'static> AsyncLazy<T> {
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::with_options(factory, LazyOptions::default())
    }

    pub fn with_options<F, Fut>(factory: F, options: LazyOptions) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            factory: Arc::new(move || factory().boxed()),
            options,
            state: Mutex::new(LazyState {
                slot: None,
                next_generation: 0,
            }),
            id: OnceLock::new(),
        }
    }

    /// Semi-unique, non-zero identifier, allocated on first access.
    pub fn id(&self) -> NonZeroU32 {
        *self.id.get_or_init(|| IDS.next())
    }

    /// Force the slot without awaiting the result.
    pub fn start(&self) {
        let _ = self.force();
    }

    /// Whether the slot has been forced (and not reset by a retry).
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.lock().slot.is_some()
    }

    /// Await the initialized value, forcing the factory if needed.
    pub async fn get(&self) -> Result<T, LazyError> {
        let (generation, attempt) = self.force();
        match attempt.await {
            Ok(value) => Ok(value),
            Err(err) => {
                if self.options.retry_on_failure {
                    let mut state = self.state.lock();
                    // Reset only if the slot still holds the attempt we
                    // observed failing; a newer attempt stays untouched.
                    if state
                        .slot
                        .as_ref()
                        .is_some_and(|slot| slot.generation == generation)
                    {
                        state.slot = None;
                        tracing::debug!("async-lazy attempt failed; slot reset for retry");
                    }
                }
                Err(err)
            }
        }
    }

    fn force(&self) -> (u64, Attempt<T>) {
        let mut state = self.state.lock();
        if let Some(slot) = &state.slot {
            return (slot.generation, slot.attempt.clone());
        }
        let generation = state.next_generation;
        state.next_generation += 1;

        let attempt: Attempt<T> = if self.options.run_on_awaiting_task {
            let factory = Arc::clone(&self.factory);
            async move { factory().await.map_err(|err| LazyError::Failed(Arc::new(err))) }
                .boxed()
                .shared()
        } else {
            // Dispatch onto the worker pool so the first awaiter does not
            // execute the factory inline.
            let task = tokio::spawn((self.factory)());
            async move {
                match task.await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(LazyError::Failed(Arc::new(err))),
                    Err(_) => Err(LazyError::Panicked),
                }
            }
            .boxed()
            .shared()
        };

        state.slot = Some(Slot {
            generation,
            attempt: attempt.clone(),
        });
        (generation, attempt)
    }
}

impl<T> fmt::Debug for AsyncLazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLazy")
            .field("started", &self.state.lock().slot.is_some())
            .finish()
    }
}
