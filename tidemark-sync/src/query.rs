//! Query coordination: resolve a keyed read to a cache entry, executing at
//! most once per key at a time.
//!
//! A read of a fresh entry is answered from the store. A read of an absent or
//! stale entry starts an execution unless one is already running for that
//! exact key, in which case the read attaches to it (single-flight). The
//! execution runs on its own task, so it completes and populates the store
//! even if every requester has gone away.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tidemark_core::{QueryKey, StorageError, SyncResult, ValidationError};
use tracing::{debug, warn};

use crate::entry::{CachedValue, QuerySnapshot, SharedExecution};
use crate::store::{Admission, CacheStore};

/// Type-erased remote read. Each call performs one execution.
pub type Executor = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<CachedValue>> + Send + Sync>;

/// Wrap a typed async function as an [`Executor`].
pub fn executor<T, F, Fut>(f: F) -> Executor
where
    T: Any + Send + Sync,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
{
    Arc::new(move || {
        let fut = f();
        async move { fut.await.map(|value| Arc::new(value) as CachedValue) }.boxed()
    })
}

/// How many times a failed execution is silently retried.
///
/// Only retryable (transport) failures are retried; validation failures
/// surface immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_retries: 0 }
    }

    pub fn retries(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

/// Per-request options. Unset fields fall back to the session's
/// [`SyncConfig`](tidemark_core::SyncConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub stale_after: Option<Duration>,
    /// A disabled query never executes; used while an id is not known yet.
    pub enabled: bool,
    pub retry: Option<RetryPolicy>,
    /// Re-execute periodically while subscribed.
    pub poll_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_after: None,
            enabled: true,
            retry: None,
            poll_interval: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale_after(mut self, duration: Duration) -> Self {
        self.stale_after = Some(duration);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

/// Resolves keyed reads against the [`CacheStore`].
#[derive(Clone)]
pub struct QueryCoordinator {
    store: Arc<CacheStore>,
}

impl QueryCoordinator {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Request `key`, starting an execution if the entry is absent or stale
    /// and none is in flight. Returns immediately with the entry's state.
    ///
    /// Outside a tokio runtime, an execution runs on the runtime the store
    /// was last used from; if it never saw one, the snapshot carries
    /// [`StorageError::RuntimeUnavailable`].
    pub fn request(&self, key: &QueryKey, executor: &Executor, options: &QueryOptions) -> QuerySnapshot {
        if !options.enabled {
            return self.current(key);
        }
        if let Err(err) = key.validate() {
            return QuerySnapshot::failed(key.clone(), err.into());
        }
        match self.admit(key, executor, options) {
            Ok((_, snapshot)) => snapshot,
            Err(err) => QuerySnapshot::failed(key.clone(), err),
        }
    }

    /// Like [`request`](Self::request), but wait for the data.
    ///
    /// Fresh data is returned directly; otherwise this awaits the (possibly
    /// shared) execution. A disabled query returns whatever is cached.
    pub async fn fetch(
        &self,
        key: &QueryKey,
        executor: &Executor,
        options: &QueryOptions,
    ) -> SyncResult<CachedValue> {
        if !options.enabled {
            return self.current(key).raw_data().cloned().ok_or_else(|| {
                ValidationError::InvalidValue {
                    field: "enabled".to_string(),
                    reason: format!("query {} is disabled", key),
                }
                .into()
            });
        }
        key.validate()?;
        let (admission, snapshot) = self.admit(key, executor, options)?;
        match admission {
            Admission::Fresh => snapshot.raw_data().cloned().ok_or_else(|| {
                StorageError::ExecutionAborted { key: key.clone() }.into()
            }),
            Admission::Attached(execution) | Admission::Started(execution) => execution.await,
        }
    }

    /// Typed [`fetch`](Self::fetch).
    pub async fn fetch_as<T: Any + Send + Sync>(
        &self,
        key: &QueryKey,
        executor: &Executor,
        options: &QueryOptions,
    ) -> SyncResult<Arc<T>> {
        let value = self.fetch(key, executor, options).await?;
        value
            .downcast::<T>()
            .map_err(|_| StorageError::TypeMismatch { key: key.clone() }.into())
    }

    fn current(&self, key: &QueryKey) -> QuerySnapshot {
        match self.store.get(key) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => QuerySnapshot::idle(key.clone()),
            Err(err) => QuerySnapshot::failed(key.clone(), err),
        }
    }

    fn admit(
        &self,
        key: &QueryKey,
        executor: &Executor,
        options: &QueryOptions,
    ) -> SyncResult<(Admission, QuerySnapshot)> {
        let config = self.store.config();
        let stale_after = options.stale_after.unwrap_or(config.default_stale_after);
        let retry = options
            .retry
            .unwrap_or(RetryPolicy::retries(config.default_retries));
        let store = Arc::downgrade(&self.store);

        self.store.admit(key, stale_after, |generation| {
            execution(store, key.clone(), generation, Arc::clone(executor), retry)
        })
    }
}

fn execution(
    store: Weak<CacheStore>,
    key: QueryKey,
    generation: u64,
    executor: Executor,
    retry: RetryPolicy,
) -> SharedExecution {
    async move {
        let result = run_with_retry(&key, &executor, retry).await;
        if let Some(store) = store.upgrade() {
            store.finish_execution(&key, generation, &result);
        }
        result
    }
    .boxed()
    .shared()
}

async fn run_with_retry(
    key: &QueryKey,
    executor: &Executor,
    retry: RetryPolicy,
) -> SyncResult<CachedValue> {
    let mut attempt = 0;
    loop {
        match executor().await {
            Ok(value) => {
                debug!(key = %key, attempt, "Execution succeeded");
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                debug!(key = %key, attempt, error = %err, "Retrying failed execution");
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Execution failed");
                return Err(err);
            }
        }
    }
}
