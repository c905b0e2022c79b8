//! Mutation coordination: run a write once, then invalidate its declared
//! key set.
//!
//! Writes are never deduplicated or retried: their side effects must not be
//! replayed blindly. A failed write touches no cache state.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tidemark_core::{KeyMatcher, SyncResult};
use tracing::{debug, error, warn};

use crate::store::CacheStore;

/// One write plus the entries it makes stale on success.
pub struct MutationDescriptor<'a, T> {
    writer: BoxFuture<'a, SyncResult<T>>,
    invalidates: Vec<KeyMatcher>,
}

impl<'a, T> MutationDescriptor<'a, T> {
    pub fn new<Fut>(writer: Fut) -> Self
    where
        Fut: Future<Output = SyncResult<T>> + Send + 'a,
    {
        Self {
            writer: writer.boxed(),
            invalidates: Vec::new(),
        }
    }

    pub fn invalidates(mut self, matcher: KeyMatcher) -> Self {
        self.invalidates.push(matcher);
        self
    }

    pub fn invalidates_all(mut self, matchers: impl IntoIterator<Item = KeyMatcher>) -> Self {
        self.invalidates.extend(matchers);
        self
    }

    pub fn invalidation_set(&self) -> &[KeyMatcher] {
        &self.invalidates
    }
}

/// Executes writes and applies their invalidation sets.
#[derive(Clone)]
pub struct MutationCoordinator {
    store: Arc<CacheStore>,
}

impl MutationCoordinator {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Run the writer once. On success every declared matcher is
    /// invalidated in order; on failure nothing is.
    pub async fn mutate<T>(&self, descriptor: MutationDescriptor<'_, T>) -> SyncResult<T> {
        let MutationDescriptor {
            writer,
            invalidates,
        } = descriptor;
        match writer.await {
            Ok(value) => {
                for matcher in invalidates.iter() {
                    // The write already happened; a cache failure must not
                    // turn it into a reported error.
                    if let Err(err) = self.store.invalidate(matcher) {
                        error!(matcher = %matcher, error = %err, "Failed to invalidate after mutation");
                    }
                }
                debug!(invalidated = invalidates.len(), "Mutation succeeded");
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "Mutation failed; no invalidation applied");
                Err(err)
            }
        }
    }
}

type Writer<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, SyncResult<O>> + Send + Sync>;
type Invalidation<I> = Arc<dyn Fn(&I) -> Vec<KeyMatcher> + Send + Sync>;

/// Reusable write handle for a view: `mutate(input)` plus `is_loading()`.
///
/// The invalidation set is computed from the input before the write runs
/// and applied only if it succeeds.
pub struct Mutation<I, O> {
    coordinator: MutationCoordinator,
    writer: Writer<I, O>,
    invalidation: Invalidation<I>,
    pending: Arc<AtomicUsize>,
}

impl<I, O> Clone for Mutation<I, O> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            writer: Arc::clone(&self.writer),
            invalidation: Arc::clone(&self.invalidation),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<I, O> Mutation<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<W, Fut, V>(coordinator: MutationCoordinator, writer: W, invalidation: V) -> Self
    where
        W: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<O>> + Send + 'static,
        V: Fn(&I) -> Vec<KeyMatcher> + Send + Sync + 'static,
    {
        Self {
            coordinator,
            writer: Arc::new(move |input| writer(input).boxed()),
            invalidation: Arc::new(invalidation),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The matchers a call with `input` would invalidate on success.
    pub fn invalidation_set(&self, input: &I) -> Vec<KeyMatcher> {
        (self.invalidation)(input)
    }

    pub async fn mutate(&self, input: I) -> SyncResult<O> {
        let _pending = PendingGuard::enter(&self.pending);
        let invalidates = (self.invalidation)(&input);
        let descriptor = MutationDescriptor::new((self.writer)(input)).invalidates_all(invalidates);
        self.coordinator.mutate(descriptor).await
    }

    /// True while any call to [`mutate`](Self::mutate) is pending.
    pub fn is_loading(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

struct PendingGuard {
    pending: Arc<AtomicUsize>,
}

impl PendingGuard {
    fn enter(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self {
            pending: Arc::clone(pending),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}
