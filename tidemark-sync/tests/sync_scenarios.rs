use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidemark_sync::{
    executor, query_key, CacheStore, Executor, KeyMatcher, MutationDescriptor, QueryKey,
    QueryOptions, QueryOutcome, SyncClient, SyncConfig, SyncError,
};

fn counting_executor(calls: &Arc<AtomicUsize>, delay: Duration) -> Executor {
    let calls = Arc::clone(calls);
    executor(move || {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, SyncError>(n)
        }
    })
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn polled_overview_executes_once_per_interval() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::new()
        .stale_after(Duration::from_secs(10))
        .poll_every(Duration::from_secs(15));

    let live = client
        .use_live_query::<usize>(
            query_key!["monitoring", "overview"],
            counting_executor(&calls, Duration::ZERO),
            options,
        )
        .unwrap();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Going stale at 10 s alone does not execute; the 15 s tick does.
    tokio::time::sleep(Duration::from_secs(12)).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*live.data().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn remaining_view_unaffected_when_another_unmounts() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let exec = counting_executor(&calls, Duration::from_millis(20));
    let key = query_key!["campaigns", "7"];
    let options = QueryOptions::new().stale_after(Duration::from_secs(30));

    let first = client
        .use_live_query::<usize>(key.clone(), exec.clone(), options.clone())
        .unwrap();
    let mut second = client
        .use_live_query::<usize>(key.clone(), exec.clone(), options.clone())
        .unwrap();
    second.changed().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(first);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(client.store().subscriber_count(&key), 1);
    assert_eq!(*second.data().unwrap(), 1);
    assert!(!second.snapshot().is_stale());
    let snapshot = client.query(&key, &exec, &options);
    assert!(snapshot.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unmounted_view_gets_nothing_while_cache_still_fills() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["cdp-sync-history"];

    let live = client
        .use_live_query::<usize>(
            key.clone(),
            counting_executor(&calls, Duration::from_millis(100)),
            QueryOptions::new(),
        )
        .unwrap();
    let receiver = live.watch();
    drop(live);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(receiver.has_changed().is_err());
    assert!(receiver.borrow().is_loading());

    let cached = client.store().get(&key).unwrap().unwrap();
    assert_eq!(*cached.data::<usize>().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn mutation_refreshes_subscribed_list() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let server = Arc::new(Mutex::new(vec!["spring".to_string()]));

    let list = {
        let server = Arc::clone(&server);
        executor(move || {
            let server = Arc::clone(&server);
            async move { Ok::<_, SyncError>(server.lock().unwrap().len()) }
        })
    };
    let mut view = client
        .use_live_query::<usize>(
            query_key!["campaigns"],
            list,
            QueryOptions::new().stale_after(Duration::from_secs(30)),
        )
        .unwrap();
    view.changed().await.unwrap();
    assert_eq!(*view.data().unwrap(), 1);

    let writer = Arc::clone(&server);
    client
        .mutate(
            MutationDescriptor::new(async move {
                writer.lock().unwrap().push("summer".to_string());
                Ok::<_, SyncError>(())
            })
            .invalidates(KeyMatcher::prefix(query_key!["campaigns"])),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(*view.data().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_mutation_leaves_view_alone() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let view = client
        .use_live_query::<usize>(
            query_key!["campaigns"],
            counting_executor(&calls, Duration::ZERO),
            QueryOptions::new().stale_after(Duration::from_secs(30)),
        )
        .unwrap();
    settle().await;

    let result = client
        .mutate(
            MutationDescriptor::new(async {
                Err::<(), _>(SyncError::transport(Some(500), "insert failed"))
            })
            .invalidates(KeyMatcher::prefix(query_key!["campaigns"])),
        )
        .await;
    settle().await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!view.snapshot().is_stale());
}

#[tokio::test(start_paused = true)]
async fn invalidation_during_execution_triggers_follow_up() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["loyalty", "balance", "u1"];
    let view = client
        .use_live_query::<usize>(
            key.clone(),
            counting_executor(&calls, Duration::from_millis(100)),
            QueryOptions::new().stale_after(Duration::from_secs(60)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.invalidate(&KeyMatcher::exact(key.clone())).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*view.data().unwrap(), 2);
    assert!(!view.snapshot().is_stale());
}

#[tokio::test(start_paused = true)]
async fn entry_evicted_after_grace_once_unmounted() {
    let client =
        SyncClient::new(SyncConfig::default().with_gc_grace(Duration::from_secs(5))).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["cdp-platforms"];
    let view = client
        .use_live_query::<usize>(
            key.clone(),
            counting_executor(&calls, Duration::ZERO),
            QueryOptions::new(),
        )
        .unwrap();
    settle().await;
    drop(view);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(client.store().get(&key).unwrap().is_none());
    assert_eq!(client.store().stats().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_mutations_each_refresh_the_view() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let server = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let list = {
        let server = Arc::clone(&server);
        let calls = Arc::clone(&calls);
        executor(move || {
            let server = Arc::clone(&server);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let seen = server.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, SyncError>(seen)
            }
        })
    };
    let view = client
        .use_live_query::<usize>(
            query_key!["campaigns"],
            list,
            QueryOptions::new().stale_after(Duration::from_secs(300)),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*view.data().unwrap(), 0);

    let bump = |delay: u64| {
        let server = Arc::clone(&server);
        MutationDescriptor::new(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            server.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SyncError>(())
        })
        .invalidates(KeyMatcher::prefix(query_key!["campaigns"]))
    };
    // The second write lands while the refresh started by the first is
    // still running.
    let (first, second) = tokio::join!(client.mutate(bump(10)), client.mutate(bump(20)));
    first.unwrap();
    second.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*view.data().unwrap(), 2);
    assert!(!view.snapshot().is_stale());
    assert_eq!(client.store().stats().invalidations, 2);
}

#[tokio::test(start_paused = true)]
async fn views_mounted_after_reset_keep_polling() {
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["monitoring", "overview"];
    let exec = counting_executor(&calls, Duration::ZERO);
    let options = QueryOptions::new()
        .stale_after(Duration::from_secs(10))
        .poll_every(Duration::from_secs(15));

    let before = client
        .use_live_query::<usize>(key.clone(), exec.clone(), options.clone())
        .unwrap();
    settle().await;
    client.reset().unwrap();

    let after = client
        .use_live_query::<usize>(key.clone(), exec.clone(), options.clone())
        .unwrap();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    drop(before);
    assert_eq!(client.scheduler().active_polls(), vec![key.clone()]);

    tokio::time::sleep(Duration::from_secs(16)).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*after.data().unwrap(), 3);
}

#[test]
fn invalidation_outside_runtime_refreshes_on_session_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let client = SyncClient::new(SyncConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["campaigns"];

    let mut view = runtime.block_on(async {
        let mut view = client
            .use_live_query::<usize>(
                key.clone(),
                counting_executor(&calls, Duration::ZERO),
                QueryOptions::new().stale_after(Duration::from_secs(30)),
            )
            .unwrap();
        view.changed().await.unwrap();
        view
    });
    assert_eq!(*view.data().unwrap(), 1);

    // A UI thread invalidating the key; the refresh runs on the session's
    // runtime once it is driven again.
    client.invalidate(&KeyMatcher::exact(key.clone())).unwrap();

    runtime.block_on(async {
        tokio::time::timeout(Duration::from_secs(5), async {
            while view.data().map(|v| *v) != Some(2) {
                view.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn arb_key() -> impl Strategy<Value = QueryKey> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 1..4)
        .prop_map(|segments| QueryKey::new(segments.into_iter().map(Into::into).collect()))
}

proptest! {
    #[test]
    fn prefix_invalidation_marks_exactly_matching_keys(
        keys in prop::collection::vec(arb_key(), 1..12),
        prefix in arb_key(),
    ) {
        let store = CacheStore::new(
            SyncConfig::default().with_default_stale_after(Duration::from_secs(3600)),
        );
        for key in keys.iter() {
            store.put(key, QueryOutcome::success(0u8)).unwrap();
        }

        store.invalidate(&KeyMatcher::prefix(prefix.clone())).unwrap();

        for key in store.keys() {
            prop_assert_eq!(store.is_fresh(&key).unwrap(), !key.starts_with(&prefix));
        }
    }
}
