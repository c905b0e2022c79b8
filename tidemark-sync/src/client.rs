//! Session facade tying the store, coordinators and scheduler together.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tidemark_core::{KeyMatcher, QueryKey, SyncConfig, SyncResult};
use tracing::info;

use crate::entry::{CachedValue, QuerySnapshot};
use crate::mutation::{Mutation, MutationCoordinator, MutationDescriptor};
use crate::query::{Executor, QueryCoordinator, QueryOptions};
use crate::scheduler::RefreshScheduler;
use crate::store::CacheStore;
use crate::subscription::LiveQuery;

/// One application session's sync layer.
///
/// Cloning is cheap and every clone shares the same store. Create one per
/// session and hand it to the views that need it.
#[derive(Clone)]
pub struct SyncClient {
    store: Arc<CacheStore>,
    queries: QueryCoordinator,
    mutations: MutationCoordinator,
    scheduler: Arc<RefreshScheduler>,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let store = CacheStore::new(config);
        let scheduler = Arc::new(RefreshScheduler::new(&store));
        Ok(Self {
            queries: QueryCoordinator::new(Arc::clone(&store)),
            mutations: MutationCoordinator::new(Arc::clone(&store)),
            scheduler,
            store,
        })
    }

    pub fn with_defaults() -> Self {
        let store = CacheStore::with_defaults();
        let scheduler = Arc::new(RefreshScheduler::new(&store));
        Self {
            queries: QueryCoordinator::new(Arc::clone(&store)),
            mutations: MutationCoordinator::new(Arc::clone(&store)),
            scheduler,
            store,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        self.store.config()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    /// See [`QueryCoordinator::request`].
    pub fn query(&self, key: &QueryKey, executor: &Executor, options: &QueryOptions) -> QuerySnapshot {
        self.queries.request(key, executor, options)
    }

    pub async fn fetch(
        &self,
        key: &QueryKey,
        executor: &Executor,
        options: &QueryOptions,
    ) -> SyncResult<CachedValue> {
        self.queries.fetch(key, executor, options).await
    }

    pub async fn fetch_as<T: Any + Send + Sync>(
        &self,
        key: &QueryKey,
        executor: &Executor,
        options: &QueryOptions,
    ) -> SyncResult<Arc<T>> {
        self.queries.fetch_as(key, executor, options).await
    }

    /// Mount a live view of `key`. Dropping the handle unmounts it.
    pub fn use_live_query<T: Any + Send + Sync>(
        &self,
        key: QueryKey,
        executor: Executor,
        options: QueryOptions,
    ) -> SyncResult<LiveQuery<T>> {
        LiveQuery::mount(&self.queries, &self.scheduler, key, executor, options)
    }

    pub async fn mutate<T>(&self, descriptor: MutationDescriptor<'_, T>) -> SyncResult<T> {
        self.mutations.mutate(descriptor).await
    }

    /// Build a reusable write handle bound to this session.
    pub fn mutation<I, O, W, Fut, V>(&self, writer: W, invalidation: V) -> Mutation<I, O>
    where
        I: Send + 'static,
        O: Send + 'static,
        W: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<O>> + Send + 'static,
        V: Fn(&I) -> Vec<KeyMatcher> + Send + Sync + 'static,
    {
        Mutation::new(self.mutations.clone(), writer, invalidation)
    }

    pub fn invalidate(&self, matcher: &KeyMatcher) -> SyncResult<usize> {
        self.store.invalidate(matcher)
    }

    /// Drop all cached state, e.g. on logout. Poll timers stop; views that
    /// stay mounted see their entries evicted and are no longer polled, and
    /// dropping them later leaves polls of views mounted after the reset
    /// running.
    pub fn reset(&self) -> SyncResult<()> {
        let polls = self.scheduler.active_polls().len();
        self.scheduler.shutdown();
        let entries = self.store.clear()?;
        info!(entries, polls, "Sync session reset");
        Ok(())
    }
}
