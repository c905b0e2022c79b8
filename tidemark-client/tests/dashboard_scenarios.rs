use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tidemark_client::types::{Campaign, CreateCampaignRequest, EarnStarsRequest, LoginRequest};
use tidemark_client::{keys, Dashboard, DashboardApi};
use tidemark_core::{KeyMatcher, SyncConfig, SyncError};
use tidemark_sync::{QueryStatus, SyncClient};
use tidemark_test_utils::{ApiCall, MockDashboardApi};

fn setup_with(api: MockDashboardApi) -> (Arc<MockDashboardApi>, Dashboard) {
    let api = Arc::new(api);
    let sync = SyncClient::new(SyncConfig::default()).unwrap();
    let dashboard = Dashboard::new(Arc::clone(&api) as Arc<dyn DashboardApi>, sync);
    (api, dashboard)
}

fn setup() -> (Arc<MockDashboardApi>, Dashboard) {
    setup_with(MockDashboardApi::seeded())
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn create_campaign_refreshes_subscribed_list() {
    let (api, dashboard) = setup();
    let mut list = dashboard.campaigns().live(dashboard.sync()).unwrap();
    list.changed().await.unwrap();
    assert_eq!(list.data().unwrap().len(), 3);

    let created = dashboard
        .create_campaign()
        .mutate(CreateCampaignRequest::named("Summer sale"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(created.name, "Summer sale");
    assert_eq!(list.data().unwrap().len(), 4);
    assert_eq!(api.calls(ApiCall::ListCampaigns), 2);
}

#[tokio::test(start_paused = true)]
async fn earn_stars_invalidates_only_that_users_balance() {
    let (api, dashboard) = setup();
    let sync = dashboard.sync();
    let u1 = dashboard.loyalty_balance("u1");
    let u2 = dashboard.loyalty_balance("u2");
    assert_eq!(u1.fetch(sync).await.unwrap().stars, 100);
    assert_eq!(u2.fetch(sync).await.unwrap().stars, 250);

    dashboard
        .earn_stars()
        .mutate(EarnStarsRequest {
            user_id: "u1".to_string(),
            amount: 50,
            reason: Some("purchase".to_string()),
        })
        .await
        .unwrap();

    assert!(!sync.store().is_fresh(&keys::loyalty_balance("u1")).unwrap());
    assert!(sync.store().is_fresh(&keys::loyalty_balance("u2")).unwrap());

    assert_eq!(u1.fetch(sync).await.unwrap().stars, 150);
    assert_eq!(u2.fetch(sync).await.unwrap().stars, 250);
    assert_eq!(api.calls(ApiCall::GetLoyaltyBalance), 3);
}

#[tokio::test]
async fn earn_stars_without_user_is_rejected_before_network() {
    let (api, dashboard) = setup();
    let err = dashboard
        .earn_stars()
        .mutate(EarnStarsRequest {
            user_id: String::new(),
            amount: 10,
            reason: None,
        })
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(api.calls(ApiCall::EarnStars), 0);
    assert_eq!(dashboard.sync().store().stats().invalidations, 0);
}

#[tokio::test]
async fn campaign_query_waits_for_id() {
    let (api, dashboard) = setup();
    let pending = dashboard.campaign("");
    let snapshot = pending.request(dashboard.sync());

    assert_eq!(snapshot.status(), QueryStatus::Idle);
    assert!(pending.fetch(dashboard.sync()).await.is_err());
    assert_eq!(api.calls(ApiCall::GetCampaign), 0);

    let campaign = dashboard.campaign("7").fetch(dashboard.sync()).await.unwrap();
    assert_eq!(campaign.name, "Holiday retargeting");
}

#[tokio::test(start_paused = true)]
async fn monitoring_overview_polls_every_fifteen_seconds() {
    let (api, dashboard) = setup();
    let overview = dashboard.monitoring_overview().live(dashboard.sync()).unwrap();
    settle().await;
    assert_eq!(api.calls(ApiCall::GetMonitoringOverview), 1);

    tokio::time::sleep(Duration::from_secs(14)).await;
    settle().await;
    assert_eq!(api.calls(ApiCall::GetMonitoringOverview), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(api.calls(ApiCall::GetMonitoringOverview), 2);
    assert_eq!(overview.data().unwrap().platforms_total, 2);

    drop(overview);
    assert!(dashboard.sync().scheduler().active_polls().is_empty());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.calls(ApiCall::GetMonitoringOverview), 2);
}

#[tokio::test(start_paused = true)]
async fn second_view_survives_first_unmount() {
    let (api, dashboard) = setup();
    let sync = dashboard.sync();
    let first = dashboard.campaign("7").live(sync).unwrap();
    let mut second = dashboard.campaign("7").live(sync).unwrap();
    if second.data().is_none() {
        second.changed().await.unwrap();
    }
    assert_eq!(api.calls(ApiCall::GetCampaign), 1);

    drop(first);
    settle().await;

    assert_eq!(second.data().unwrap().id, "7");
    assert_eq!(sync.store().subscriber_count(&keys::campaign("7")), 1);
    assert_eq!(api.calls(ApiCall::GetCampaign), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_reads_share_one_request() {
    let (api, dashboard) =
        setup_with(MockDashboardApi::seeded().with_latency(Duration::from_millis(200)));
    let query = dashboard.cdp_platforms();
    let sync = dashboard.sync();

    let results = join_all((0..6).map(|_| query.fetch(sync))).await;

    assert!(results.iter().all(|r| matches!(r, Ok(p) if p.len() == 2)));
    assert_eq!(api.calls(ApiCall::ListCdpPlatforms), 1);
}

#[tokio::test]
async fn transport_failure_keeps_previous_data() {
    let (api, dashboard) = setup();
    let sync = dashboard.sync();
    let list = dashboard.campaigns();
    list.fetch(sync).await.unwrap();

    api.fail_always(ApiCall::ListCampaigns, 503, "maintenance");
    sync.invalidate(&KeyMatcher::exact(keys::campaigns())).unwrap();
    let err = list.fetch(sync).await.unwrap_err();

    match &err {
        SyncError::Transport(t) => assert_eq!(t.status(), Some(503)),
        other => panic!("unexpected {other:?}"),
    }
    // First read plus one attempt and one silent retry.
    assert_eq!(api.calls(ApiCall::ListCampaigns), 3);
    let cached = sync.store().get(&keys::campaigns()).unwrap().unwrap();
    assert!(cached.is_error());
    assert_eq!(cached.data::<Vec<Campaign>>().unwrap().len(), 3);
}

#[tokio::test]
async fn pause_invalidates_list_and_item() {
    let (api, dashboard) = setup();
    let sync = dashboard.sync();
    dashboard.campaigns().fetch(sync).await.unwrap();
    dashboard.campaign("7").fetch(sync).await.unwrap();
    dashboard.loyalty_balance("u1").fetch(sync).await.unwrap();

    dashboard.pause_campaign().mutate("7".to_string()).await.unwrap();

    assert!(!sync.store().is_fresh(&keys::campaigns()).unwrap());
    assert!(!sync.store().is_fresh(&keys::campaign("7")).unwrap());
    assert!(sync.store().is_fresh(&keys::loyalty_balance("u1")).unwrap());
    assert_eq!(api.calls(ApiCall::PauseCampaign), 1);
}

#[tokio::test]
async fn failed_delete_invalidates_nothing() {
    let (_api, dashboard) = setup();
    let sync = dashboard.sync();
    dashboard.campaigns().fetch(sync).await.unwrap();

    let result = dashboard.delete_campaign().mutate("404".to_string()).await;

    assert!(result.is_err());
    assert!(sync.store().is_fresh(&keys::campaigns()).unwrap());
}

#[tokio::test]
async fn login_touches_no_cache_state() {
    let (_api, dashboard) = setup();
    let sync = dashboard.sync();
    dashboard.campaigns().fetch(sync).await.unwrap();

    let login = dashboard.login();
    assert!(login
        .invalidation_set(&LoginRequest {
            email: "ops@example.com".to_string(),
            password: "pw".to_string(),
        })
        .is_empty());
    let response = login
        .mutate(LoginRequest {
            email: "ops@example.com".to_string(),
            password: "pw".to_string(),
        })
        .await
        .unwrap();

    assert!(response.token.starts_with("token-"));
    assert_eq!(sync.store().stats().invalidations, 0);
}
