//! Process-wide keyed table of cached results with freshness metadata.
//!
//! All mutations happen under a single mutex, so no operation ever observes a
//! half-updated entry. Subscriber callbacks are collected while the lock is
//! held and invoked synchronously right after it is released, which lets a
//! callback call back into the store (for example to re-request its key).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tidemark_core::{KeyMatcher, QueryKey, StorageError, SyncConfig, SyncResult};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::entry::{
    CacheEntry, CachedValue, QueryOutcome, QuerySnapshot, QueryStatus, SharedExecution,
};

/// Handle returned by [`CacheStore::subscribe`].
pub type SubscriptionId = u64;

/// Observer registered against one key.
pub type CacheCallback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    /// Data, error or loading state changed.
    Updated,
    /// Marked stale; data is still present.
    Invalidated,
    /// Removed from the store.
    Evicted,
}

/// Notification delivered to the subscribers of one key.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub key: QueryKey,
    pub kind: CacheEventKind,
    /// State after the change. `None` for evictions.
    pub snapshot: Option<QuerySnapshot>,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered by a fresh entry.
    pub hits: u64,
    /// Reads that started an execution.
    pub misses: u64,
    /// Executions started.
    pub executions: u64,
    /// Reads that attached to an execution already in flight.
    pub deduplicated: u64,
    /// Entries marked stale by invalidation.
    pub invalidations: u64,
    /// Entries removed after their last subscriber left.
    pub evictions: u64,
    /// Number of entries currently in the store.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// How the store answered a read that may execute.
pub(crate) enum Admission {
    /// Fresh data, nothing to do.
    Fresh,
    /// Joined the execution already running for the key.
    Attached(SharedExecution),
    /// Started a new execution; the caller must drive it.
    Started(SharedExecution),
}

struct Subscriber {
    key: QueryKey,
    callback: CacheCallback,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<QueryKey, CacheEntry>,
    // Ordered so callbacks fire in registration order.
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    watchers: HashMap<QueryKey, usize>,
    next_subscription: SubscriptionId,
    // Never reset, so a result from before `clear` cannot land in a new entry.
    next_generation: u64,
    // Never reset, so an eviction timer from before `clear` cannot match.
    epochs: u64,
    stats: CacheStats,
}

type Pending = Vec<(CacheCallback, CacheEvent)>;

impl StoreState {
    fn notify(
        &self,
        key: &QueryKey,
        kind: CacheEventKind,
        snapshot: Option<QuerySnapshot>,
        pending: &mut Pending,
    ) {
        for subscriber in self.subscribers.values().filter(|s| &s.key == key) {
            pending.push((
                Arc::clone(&subscriber.callback),
                CacheEvent {
                    key: key.clone(),
                    kind,
                    snapshot: snapshot.clone(),
                },
            ));
        }
    }

    fn watcher_count(&self, key: &QueryKey) -> usize {
        self.watchers.get(key).copied().unwrap_or(0)
    }
}

fn dispatch(pending: Pending) {
    for (callback, event) in pending {
        callback(&event);
    }
}

/// Keyed cache of query results, shared by every coordinator of a session.
///
/// Created once per application session (see
/// [`SyncClient`](crate::SyncClient)) and passed by reference; never a global.
pub struct CacheStore {
    state: Mutex<StoreState>,
    config: SyncConfig,
    // Runtime that background work is spawned on when the caller is not
    // inside one (e.g. an invalidation from a UI thread).
    runtime: OnceLock<Handle>,
    weak_self: Weak<CacheStore>,
}

impl CacheStore {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        let runtime = OnceLock::new();
        if let Ok(handle) = Handle::try_current() {
            let _ = runtime.set(handle);
        }
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(StoreState::default()),
            config,
            runtime,
            weak_self: weak.clone(),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(SyncConfig::default())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The current runtime, else the first one this store was used from.
    pub(crate) fn runtime(&self) -> Option<Handle> {
        match Handle::try_current() {
            Ok(handle) => {
                let _ = self.runtime.set(handle.clone());
                Some(handle)
            }
            Err(_) => self.runtime.get().cloned(),
        }
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    // Teardown paths cannot report errors, so they take the state as-is.
    fn lock_recover(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of `key`, or `None` if absent.
    pub fn get(&self, key: &QueryKey) -> SyncResult<Option<QuerySnapshot>> {
        let now = Instant::now();
        Ok(self.lock()?.entries.get(key).map(|e| e.snapshot(now)))
    }

    /// True if `key` holds fresh data; a read would not execute.
    pub fn is_fresh(&self, key: &QueryKey) -> SyncResult<bool> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .entries
            .get(key)
            .is_some_and(|e| e.is_fresh(now)))
    }

    /// Write an outcome for `key`, creating the entry if needed, and notify
    /// its subscribers.
    ///
    /// An entry nobody subscribes to is evicted after the grace period, like
    /// one whose last subscriber left. Outside a runtime it is kept.
    pub fn put(&self, key: &QueryKey, outcome: QueryOutcome) -> SyncResult<QuerySnapshot> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let (snapshot, eviction) = {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let stale_after = self.config.default_stale_after;
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), stale_after));
            entry.apply(outcome, now);
            state.epochs += 1;
            entry.epoch = state.epochs;
            let snapshot = entry.snapshot(now);
            let eviction = entry.in_flight.is_none().then_some(entry.epoch);
            state.notify(key, CacheEventKind::Updated, Some(snapshot.clone()), &mut pending);
            let eviction = eviction.filter(|_| state.watcher_count(key) == 0);
            (snapshot, eviction)
        };
        dispatch(pending);
        if let (Some(epoch), Some(runtime)) = (eviction, self.runtime()) {
            self.spawn_eviction(&runtime, key.clone(), epoch);
        }
        Ok(snapshot)
    }

    /// Override the freshness window of an existing entry.
    pub fn set_stale_after(&self, key: &QueryKey, stale_after: Duration) -> SyncResult<bool> {
        let mut state = self.lock()?;
        Ok(match state.entries.get_mut(key) {
            Some(entry) => {
                entry.stale_after = stale_after;
                true
            }
            None => false,
        })
    }

    /// Mark every matching entry stale without discarding its data, and
    /// notify subscribers. Returns the number of entries matched.
    pub fn invalidate(&self, matcher: &KeyMatcher) -> SyncResult<usize> {
        let now = Instant::now();
        let mut pending = Vec::new();
        let count = {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let mut touched = Vec::new();
            for (key, entry) in state.entries.iter_mut() {
                if matcher.matches(key) {
                    entry.invalidated = true;
                    if entry.in_flight.is_some() {
                        entry.invalidated_in_flight = true;
                    }
                    touched.push((key.clone(), entry.snapshot(now)));
                }
            }
            state.stats.invalidations += touched.len() as u64;
            for (key, snapshot) in touched.iter() {
                state.notify(key, CacheEventKind::Invalidated, Some(snapshot.clone()), &mut pending);
            }
            touched.len()
        };
        debug!(matcher = %matcher, count, "Invalidated cache entries");
        dispatch(pending);
        Ok(count)
    }

    /// Register `callback` for changes to `key`.
    ///
    /// A subscription cancels any pending eviction of the entry.
    pub fn subscribe<F>(&self, key: QueryKey, callback: F) -> SyncResult<SubscriptionId>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.next_subscription += 1;
        let id = state.next_subscription;
        *state.watchers.entry(key.clone()).or_insert(0) += 1;
        if let Some(entry) = state.entries.get_mut(&key) {
            state.epochs += 1;
            entry.epoch = state.epochs;
        }
        state.subscribers.insert(
            id,
            Subscriber {
                key,
                callback: Arc::new(callback),
            },
        );
        Ok(id)
    }

    /// Remove a subscription. When it was the last one for its key and no
    /// execution is pending, the entry is evicted after the grace period.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let eviction = {
            let mut guard = self.lock_recover();
            let state = &mut *guard;
            let Some(subscriber) = state.subscribers.remove(&id) else {
                return false;
            };
            let remaining = match state.watchers.get_mut(&subscriber.key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                state.watchers.remove(&subscriber.key);
            }
            match state.entries.get(&subscriber.key) {
                Some(entry) if remaining == 0 && entry.in_flight.is_none() => {
                    Some((subscriber.key, entry.epoch))
                }
                _ => None,
            }
        };
        if let Some((key, epoch)) = eviction {
            self.schedule_eviction(key, epoch);
        }
        true
    }

    /// Number of live subscriptions for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.lock_recover().watcher_count(key)
    }

    /// Drop the entry for `key` immediately. Subscribers see an eviction.
    pub fn remove(&self, key: &QueryKey) -> SyncResult<bool> {
        let mut pending = Vec::new();
        let removed = {
            let mut state = self.lock()?;
            let removed = state.entries.remove(key).is_some();
            if removed {
                state.notify(key, CacheEventKind::Evicted, None, &mut pending);
            }
            removed
        };
        dispatch(pending);
        Ok(removed)
    }

    /// Drop every entry (session reset). Results of executions still in
    /// flight are discarded when they arrive.
    pub fn clear(&self) -> SyncResult<usize> {
        let mut pending = Vec::new();
        let count = {
            let mut state = self.lock()?;
            let removed: Vec<QueryKey> = state.entries.drain().map(|(key, _)| key).collect();
            for key in removed.iter() {
                state.notify(key, CacheEventKind::Evicted, None, &mut pending);
            }
            removed.len()
        };
        dispatch(pending);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.lock_recover().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.lock_recover().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock_recover();
        CacheStats {
            entry_count: state.entries.len() as u64,
            ..state.stats.clone()
        }
    }

    /// Decide whether a read of `key` executes.
    ///
    /// `start` is called with the new generation only when an execution must
    /// begin; it builds (but does not poll) the shared execution, which is
    /// then driven on its own task so it completes without any requester.
    pub(crate) fn admit<F>(
        &self,
        key: &QueryKey,
        stale_after: Duration,
        start: F,
    ) -> SyncResult<(Admission, QuerySnapshot)>
    where
        F: FnOnce(u64) -> SharedExecution,
    {
        let now = Instant::now();
        let runtime = self.runtime();
        let mut pending = Vec::new();
        let mut driver = None;
        let admitted = {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), stale_after));
            // The most recent requester's tolerance applies.
            entry.stale_after = stale_after;

            if let Some(execution) = entry.in_flight.clone() {
                let snapshot = entry.snapshot(now);
                state.stats.deduplicated += 1;
                debug!(key = %key, "Attached to in-flight execution");
                (Admission::Attached(execution), snapshot)
            } else if entry.is_fresh(now) {
                let snapshot = entry.snapshot(now);
                state.stats.hits += 1;
                (Admission::Fresh, snapshot)
            } else if let Some(runtime) = runtime {
                state.next_generation += 1;
                let generation = state.next_generation;
                let execution = start(generation);
                entry.begin(generation, execution.clone());
                state.epochs += 1;
                entry.epoch = state.epochs;
                let snapshot = entry.snapshot(now);
                state.stats.misses += 1;
                state.stats.executions += 1;
                state.notify(key, CacheEventKind::Updated, Some(snapshot.clone()), &mut pending);
                debug!(key = %key, "Started execution");
                driver = Some((runtime, execution.clone()));
                (Admission::Started(execution), snapshot)
            } else {
                // Nothing can drive an execution; leave no placeholder behind.
                if entry.status == QueryStatus::Idle && entry.fetched_at.is_none() {
                    state.entries.remove(key);
                }
                warn!(key = %key, "No runtime to execute query");
                return Err(StorageError::RuntimeUnavailable { key: key.clone() }.into());
            }
        };
        dispatch(pending);
        if let Some((runtime, execution)) = driver {
            runtime.spawn(async move {
                let _ = execution.await;
            });
        }
        Ok(admitted)
    }

    /// Write the result of execution `generation` for `key`.
    ///
    /// Results of superseded executions, or for entries removed meanwhile,
    /// are dropped.
    pub(crate) fn finish_execution(
        &self,
        key: &QueryKey,
        generation: u64,
        result: &SyncResult<CachedValue>,
    ) {
        let now = Instant::now();
        let mut pending = Vec::new();
        let eviction = {
            let mut guard = self.lock_recover();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(key) else {
                debug!(key = %key, "Dropping result for removed entry");
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.in_flight = None;
            entry.apply(result.clone().into(), now);
            let reinvalidate = std::mem::take(&mut entry.invalidated_in_flight);
            if reinvalidate {
                entry.invalidated = true;
            }
            let snapshot = entry.snapshot(now);
            let epoch = entry.epoch;
            state.notify(key, CacheEventKind::Updated, Some(snapshot.clone()), &mut pending);
            if reinvalidate {
                state.notify(key, CacheEventKind::Invalidated, Some(snapshot), &mut pending);
            }
            (state.watcher_count(key) == 0).then_some(epoch)
        };
        dispatch(pending);
        if let Some(epoch) = eviction {
            self.schedule_eviction(key.clone(), epoch);
        }
    }

    fn schedule_eviction(&self, key: QueryKey, epoch: u64) {
        if self.config.gc_grace.is_zero() {
            self.evict_if_unused(&key, epoch);
            return;
        }
        match self.runtime() {
            Some(runtime) => self.spawn_eviction(&runtime, key, epoch),
            None => {
                self.evict_if_unused(&key, epoch);
            }
        }
    }

    fn spawn_eviction(&self, runtime: &Handle, key: QueryKey, epoch: u64) {
        let grace = self.config.gc_grace;
        let weak = self.weak_self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(store) = weak.upgrade() {
                store.evict_if_unused(&key, epoch);
            }
        });
    }

    fn evict_if_unused(&self, key: &QueryKey, epoch: u64) -> bool {
        let mut state = self.lock_recover();
        let unused = state.watcher_count(key) == 0
            && state
                .entries
                .get(key)
                .is_some_and(|e| e.epoch == epoch && e.in_flight.is_none());
        if unused {
            state.entries.remove(key);
            state.stats.evictions += 1;
            debug!(key = %key, "Evicted unused cache entry");
        }
        unused
    }
}
