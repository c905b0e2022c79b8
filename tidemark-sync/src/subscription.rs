//! Live views over cache entries.
//!
//! A [`LiveQuery`] is the disposable handle a view holds while it is on
//! screen. While alive it is subscribed to its key, re-requests the key
//! whenever it is invalidated, and holds a poll if the options ask for one.
//! Dropping it releases all three.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tidemark_core::{KeyMatcher, QueryKey, StorageError, SyncError, SyncResult};
use tokio::sync::watch;
use tracing::debug;

use crate::entry::{QuerySnapshot, QueryStatus};
use crate::query::{Executor, QueryCoordinator, QueryOptions};
use crate::scheduler::{PollHold, RefreshScheduler};
use crate::store::{CacheEvent, CacheEventKind, CacheStore, SubscriptionId};

/// Shared between the handle and its store callback.
struct Delivery {
    sender: watch::Sender<QuerySnapshot>,
    /// Set once the store has pushed a state; the mount snapshot must not
    /// overwrite a newer one.
    observed: AtomicBool,
    active: AtomicBool,
}

impl Delivery {
    fn push(&self, snapshot: QuerySnapshot) {
        self.sender.send_modify(|current| {
            *current = snapshot;
            self.observed.store(true, Ordering::SeqCst);
        });
    }

    fn push_initial(&self, snapshot: QuerySnapshot) {
        self.sender.send_if_modified(|current| {
            if self.observed.load(Ordering::SeqCst) {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

/// A mounted, typed view of one query key.
pub struct LiveQuery<T> {
    key: QueryKey,
    store: Arc<CacheStore>,
    scheduler: Arc<RefreshScheduler>,
    delivery: Weak<Delivery>,
    subscription: Option<SubscriptionId>,
    poll: Option<PollHold>,
    receiver: watch::Receiver<QuerySnapshot>,
    // Keeps the channel open for a handle rejected at mount.
    rejected: Option<Arc<Delivery>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("key", &self.key)
            .field("subscription", &self.subscription)
            .field("polling", &self.poll.is_some())
            .finish()
    }
}

impl<T: Any + Send + Sync> LiveQuery<T> {
    pub(crate) fn mount(
        queries: &QueryCoordinator,
        scheduler: &Arc<RefreshScheduler>,
        key: QueryKey,
        executor: Executor,
        options: QueryOptions,
    ) -> SyncResult<Self> {
        let store = Arc::clone(queries.store());
        let (sender, receiver) = watch::channel(QuerySnapshot::idle(key.clone()));
        let delivery = Arc::new(Delivery {
            sender,
            observed: AtomicBool::new(false),
            active: AtomicBool::new(true),
        });

        let mut live = Self {
            key: key.clone(),
            store: Arc::clone(&store),
            scheduler: Arc::clone(scheduler),
            delivery: Arc::downgrade(&delivery),
            subscription: None,
            poll: None,
            receiver,
            rejected: None,
            _marker: PhantomData,
        };

        if options.enabled {
            if let Err(err) = key.validate() {
                // Nothing to observe for a key that can never execute.
                delivery.push(QuerySnapshot::failed(key, err.into()));
                live.receiver.borrow_and_update();
                live.rejected = Some(delivery);
                return Ok(live);
            }
        }

        let observer = observer(
            Arc::downgrade(&store),
            executor.clone(),
            options.clone(),
            Arc::clone(&delivery),
        );
        live.subscription = Some(store.subscribe(key.clone(), observer)?);

        if let (Some(interval), true) = (options.poll_interval, options.enabled) {
            live.poll = Some(scheduler.schedule_poll(&key, interval)?);
        }

        let snapshot = queries.request(&key, &executor, &options);
        delivery.push_initial(snapshot);
        live.receiver.borrow_and_update();
        debug!(key = %key, polling = live.poll.is_some(), "Mounted live query");
        Ok(live)
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The most recent state delivered to this view.
    pub fn snapshot(&self) -> QuerySnapshot {
        self.receiver.borrow().clone()
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.receiver.borrow().data::<T>()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.receiver.borrow().error().cloned()
    }

    pub fn status(&self) -> QueryStatus {
        self.receiver.borrow().status()
    }

    /// Loading with nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.receiver.borrow().is_loading()
    }

    pub fn is_fetching(&self) -> bool {
        self.receiver.borrow().is_fetching()
    }

    /// Wait for the next delivered state and return it.
    pub async fn changed(&mut self) -> SyncResult<QuerySnapshot> {
        self.receiver
            .changed()
            .await
            .map_err(|_| StorageError::SubscriptionClosed {
                key: self.key.clone(),
            })?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// A receiver for use in `select!` loops.
    pub fn watch(&self) -> watch::Receiver<QuerySnapshot> {
        self.receiver.clone()
    }

    /// Invalidate this key. Every live view of it re-requests.
    pub fn refetch(&self) -> SyncResult<usize> {
        self.store.invalidate(&KeyMatcher::exact(self.key.clone()))
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.upgrade() {
            delivery.active.store(false, Ordering::SeqCst);
        }
        if let Some(id) = self.subscription.take() {
            self.store.unsubscribe(id);
        }
        if let Some(hold) = self.poll.take() {
            self.scheduler.cancel_poll(&hold);
        }
        debug!(key = %self.key, "Unmounted live query");
    }
}

fn observer(
    store: Weak<CacheStore>,
    executor: Executor,
    options: QueryOptions,
    delivery: Arc<Delivery>,
) -> impl Fn(&CacheEvent) + Send + Sync + 'static {
    move |event: &CacheEvent| {
        if !delivery.active.load(Ordering::SeqCst) {
            return;
        }
        match event.kind {
            CacheEventKind::Updated => {
                if let Some(snapshot) = event.snapshot.clone() {
                    delivery.push(snapshot);
                }
            }
            CacheEventKind::Invalidated => {
                if let Some(snapshot) = event.snapshot.clone() {
                    delivery.push(snapshot);
                }
                if !options.enabled {
                    return;
                }
                let Some(store) = store.upgrade() else {
                    return;
                };
                let snapshot = QueryCoordinator::new(store).request(&event.key, &executor, &options);
                if snapshot.is_error() && !snapshot.is_fetching() {
                    delivery.push(snapshot);
                }
            }
            CacheEventKind::Evicted => {
                delivery.push(QuerySnapshot::idle(event.key.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::QueryOutcome;
    use crate::query::executor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tidemark_core::{query_key, SyncConfig};

    struct Harness {
        queries: QueryCoordinator,
        scheduler: Arc<RefreshScheduler>,
        calls: Arc<AtomicUsize>,
        exec: Executor,
    }

    fn harness(delay: Duration) -> Harness {
        let store = CacheStore::new(SyncConfig::default().with_gc_grace(Duration::from_secs(5)));
        let scheduler = Arc::new(RefreshScheduler::new(&store));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let exec = executor(move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok::<_, SyncError>(n)
            }
        });
        Harness {
            queries: QueryCoordinator::new(store),
            scheduler,
            calls,
            exec,
        }
    }

    impl Harness {
        fn mount(&self, key: QueryKey, options: QueryOptions) -> LiveQuery<usize> {
            LiveQuery::mount(&self.queries, &self.scheduler, key, self.exec.clone(), options)
                .unwrap()
        }

        fn store(&self) -> &Arc<CacheStore> {
            self.queries.store()
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_executes_and_delivers() {
        let h = harness(Duration::from_millis(50));
        let mut live = h.mount(query_key!["campaigns"], QueryOptions::new());
        assert!(live.is_loading());
        assert!(live.data().is_none());

        let snapshot = live.changed().await.unwrap();
        assert!(snapshot.is_success());
        assert_eq!(*live.data().unwrap(), 1);
        assert_eq!(h.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_with_fresh_entry_does_not_execute() {
        let h = harness(Duration::ZERO);
        let key = query_key!["campaigns"];
        h.store().put(&key, QueryOutcome::success(41usize)).unwrap();
        h.store().set_stale_after(&key, Duration::from_secs(30)).unwrap();

        let options = QueryOptions::new().stale_after(Duration::from_secs(30));
        let live = h.mount(key, options);
        assert_eq!(*live.data().unwrap(), 41);
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_triggers_refetch() {
        let h = harness(Duration::from_millis(10));
        let key = query_key!["campaigns"];
        let options = QueryOptions::new().stale_after(Duration::from_secs(300));
        let mut live = h.mount(key.clone(), options);
        live.changed().await.unwrap();
        assert_eq!(h.calls(), 1);

        live.refetch().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.calls(), 2);
        assert_eq!(*live.data().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_views_share_one_execution() {
        let h = harness(Duration::from_millis(10));
        let key = query_key!["campaigns", "7"];
        let options = QueryOptions::new().stale_after(Duration::from_secs(300));
        let first = h.mount(key.clone(), options.clone());
        let second = h.mount(key.clone(), options);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.calls(), 1);

        h.store().invalidate(&KeyMatcher::exact(key.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.calls(), 2);
        assert_eq!(*first.data().unwrap(), 2);
        assert_eq!(*second.data().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_view_stays_idle() {
        let h = harness(Duration::ZERO);
        let key = query_key!["campaigns", "7"];
        let live = h.mount(key.clone(), QueryOptions::new().enabled(false));
        h.store().invalidate(&KeyMatcher::prefix(query_key!["campaigns"])).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(live.status(), QueryStatus::Idle);
        assert_eq!(h.calls(), 0);
        assert!(h.store().get(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_key_surfaces_validation_error() {
        let h = harness(Duration::ZERO);
        let live = h.mount(query_key!["loyalty", "balance", ""], QueryOptions::new());
        assert!(live.error().unwrap().is_validation());
        assert_eq!(h.store().subscriber_count(live.key()), 0);
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_unsubscribes_and_cancels_poll() {
        let h = harness(Duration::ZERO);
        let key = query_key!["monitoring", "overview"];
        let options = QueryOptions::new()
            .stale_after(Duration::from_secs(10))
            .poll_every(Duration::from_secs(15));
        let live = h.mount(key.clone(), options);
        assert_eq!(h.scheduler.active_polls(), vec![key.clone()]);
        assert_eq!(h.store().subscriber_count(&key), 1);

        drop(live);
        assert!(h.scheduler.active_polls().is_empty());
        assert_eq!(h.store().subscriber_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_view_receives_nothing_but_cache_fills() {
        let h = harness(Duration::from_millis(100));
        let key = query_key!["cdp-platforms"];
        let live = h.mount(key.clone(), QueryOptions::new());
        let receiver = live.watch();
        drop(live);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(receiver.borrow().is_loading());
        assert!(h.store().get(&key).unwrap().unwrap().is_success());
        assert_eq!(h.calls(), 1);
    }
}
