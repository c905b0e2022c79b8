//! The dashboard's declared queries and mutations.
//!
//! Each surface's key, freshness window and polling policy live here, next
//! to the invalidation set of every write that can change it. Views ask a
//! [`Dashboard`] for a query or mutation instead of building keys by hand.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tidemark_core::{query_key, KeyMatcher, QueryKey, SyncError, SyncResult, ValidationError};
use tidemark_sync::{
    executor, Executor, LiveQuery, Mutation, QueryOptions, QuerySnapshot, SyncClient,
};

use crate::api_client::DashboardApi;
use crate::types::{
    Campaign, CdpPlatform, CreateCampaignRequest, EarnStarsRequest, LoginRequest, LoginResponse,
    LoyaltyBalance, MonitoringOverview, RedeemStarsRequest, SyncHistoryEntry,
};

pub const CAMPAIGNS_STALE_AFTER: Duration = Duration::from_secs(30);
pub const LOYALTY_BALANCE_STALE_AFTER: Duration = Duration::from_secs(60);
pub const MONITORING_STALE_AFTER: Duration = Duration::from_secs(10);
pub const MONITORING_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Query key conventions.
pub mod keys {
    use super::*;

    pub fn campaigns() -> QueryKey {
        query_key!["campaigns"]
    }

    pub fn campaign(id: &str) -> QueryKey {
        query_key!["campaigns", id]
    }

    pub fn loyalty_balance(user_id: &str) -> QueryKey {
        query_key!["loyalty", "balance", user_id]
    }

    pub fn monitoring_overview() -> QueryKey {
        query_key!["monitoring", "overview"]
    }

    pub fn cdp_platforms() -> QueryKey {
        query_key!["cdp-platforms"]
    }

    pub fn cdp_sync_history() -> QueryKey {
        query_key!["cdp-sync-history"]
    }
}

/// A key, its executor and its policy, ready to be requested or mounted.
pub struct DeclaredQuery<T> {
    key: QueryKey,
    executor: Executor,
    options: QueryOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DeclaredQuery<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            executor: Arc::clone(&self.executor),
            options: self.options.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Any + Send + Sync> DeclaredQuery<T> {
    fn new(key: QueryKey, executor: Executor, options: QueryOptions) -> Self {
        Self {
            key,
            executor,
            options,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn request(&self, sync: &SyncClient) -> QuerySnapshot {
        sync.query(&self.key, &self.executor, &self.options)
    }

    pub async fn fetch(&self, sync: &SyncClient) -> SyncResult<Arc<T>> {
        sync.fetch_as::<T>(&self.key, &self.executor, &self.options)
            .await
    }

    pub fn live(&self, sync: &SyncClient) -> SyncResult<LiveQuery<T>> {
        sync.use_live_query(self.key.clone(), Arc::clone(&self.executor), self.options.clone())
    }
}

/// Dashboard data access bound to one API client and one sync session.
#[derive(Clone)]
pub struct Dashboard {
    api: Arc<dyn DashboardApi>,
    sync: SyncClient,
}

impl Dashboard {
    pub fn new(api: Arc<dyn DashboardApi>, sync: SyncClient) -> Self {
        Self { api, sync }
    }

    pub fn sync(&self) -> &SyncClient {
        &self.sync
    }

    pub fn api(&self) -> &Arc<dyn DashboardApi> {
        &self.api
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn campaigns(&self) -> DeclaredQuery<Vec<Campaign>> {
        let api = Arc::clone(&self.api);
        DeclaredQuery::new(
            keys::campaigns(),
            executor(move || {
                let api = Arc::clone(&api);
                async move { Ok::<_, SyncError>(api.list_campaigns().await?) }
            }),
            QueryOptions::new().stale_after(CAMPAIGNS_STALE_AFTER),
        )
    }

    /// Disabled until `id` is known.
    pub fn campaign(&self, id: &str) -> DeclaredQuery<Campaign> {
        let api = Arc::clone(&self.api);
        let campaign_id = id.to_string();
        DeclaredQuery::new(
            keys::campaign(id),
            executor(move || {
                let api = Arc::clone(&api);
                let id = campaign_id.clone();
                async move { Ok::<_, SyncError>(api.get_campaign(&id).await?) }
            }),
            QueryOptions::new().enabled(!id.is_empty()),
        )
    }

    /// Disabled until `user_id` is known.
    pub fn loyalty_balance(&self, user_id: &str) -> DeclaredQuery<LoyaltyBalance> {
        let api = Arc::clone(&self.api);
        let owner = user_id.to_string();
        DeclaredQuery::new(
            keys::loyalty_balance(user_id),
            executor(move || {
                let api = Arc::clone(&api);
                let user_id = owner.clone();
                async move { Ok::<_, SyncError>(api.get_loyalty_balance(&user_id).await?) }
            }),
            QueryOptions::new()
                .stale_after(LOYALTY_BALANCE_STALE_AFTER)
                .enabled(!user_id.is_empty()),
        )
    }

    pub fn monitoring_overview(&self) -> DeclaredQuery<MonitoringOverview> {
        let api = Arc::clone(&self.api);
        DeclaredQuery::new(
            keys::monitoring_overview(),
            executor(move || {
                let api = Arc::clone(&api);
                async move { Ok::<_, SyncError>(api.get_monitoring_overview().await?) }
            }),
            QueryOptions::new()
                .stale_after(MONITORING_STALE_AFTER)
                .poll_every(MONITORING_POLL_INTERVAL),
        )
    }

    pub fn cdp_platforms(&self) -> DeclaredQuery<Vec<CdpPlatform>> {
        let api = Arc::clone(&self.api);
        DeclaredQuery::new(
            keys::cdp_platforms(),
            executor(move || {
                let api = Arc::clone(&api);
                async move { Ok::<_, SyncError>(api.list_cdp_platforms().await?) }
            }),
            QueryOptions::new(),
        )
    }

    pub fn sync_history(&self) -> DeclaredQuery<Vec<SyncHistoryEntry>> {
        let api = Arc::clone(&self.api);
        DeclaredQuery::new(
            keys::cdp_sync_history(),
            executor(move || {
                let api = Arc::clone(&api);
                async move { Ok::<_, SyncError>(api.get_sync_history().await?) }
            }),
            QueryOptions::new(),
        )
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn create_campaign(&self) -> Mutation<CreateCampaignRequest, Campaign> {
        let api = Arc::clone(&self.api);
        self.sync.mutation(
            move |req: CreateCampaignRequest| {
                let api = Arc::clone(&api);
                async move {
                    require("name", &req.name)?;
                    Ok::<_, SyncError>(api.create_campaign(&req).await?)
                }
            },
            |_: &CreateCampaignRequest| campaign_family(),
        )
    }

    /// Input is the campaign id.
    pub fn pause_campaign(&self) -> Mutation<String, Campaign> {
        let api = Arc::clone(&self.api);
        self.sync.mutation(
            move |id: String| {
                let api = Arc::clone(&api);
                async move {
                    require("id", &id)?;
                    Ok::<_, SyncError>(api.pause_campaign(&id).await?)
                }
            },
            |_: &String| campaign_family(),
        )
    }

    pub fn resume_campaign(&self) -> Mutation<String, Campaign> {
        let api = Arc::clone(&self.api);
        self.sync.mutation(
            move |id: String| {
                let api = Arc::clone(&api);
                async move {
                    require("id", &id)?;
                    Ok::<_, SyncError>(api.resume_campaign(&id).await?)
                }
            },
            |_: &String| campaign_family(),
        )
    }

    pub fn delete_campaign(&self) -> Mutation<String, ()> {
        let api = Arc::clone(&self.api);
        self.sync.mutation(
            move |id: String| {
                let api = Arc::clone(&api);
                async move {
                    require("id", &id)?;
                    Ok::<_, SyncError>(api.delete_campaign(&id).await?)
                }
            },
            |_: &String| campaign_family(),
        )
    }

    pub fn earn_stars(&self) -> Mutation<EarnStarsRequest, LoyaltyBalance> {
        let api = Arc::clone(&self.api);
        self.sync.mutation(
            move |req: EarnStarsRequest| {
                let api = Arc::clone(&api);
                async move {
                    require("user_id", &req.user_id)?;
                    Ok::<_, SyncError>(api.earn_stars(&req).await?)
                }
            },
            |req: &EarnStarsRequest| balance_of(&req.user_id),
        )
    }

    pub fn redeem_stars(&self) -> Mutation<RedeemStarsRequest, LoyaltyBalance> {
        let api = Arc::clone(&self.api);
        self.sync.mutation(
            move |req: RedeemStarsRequest| {
                let api = Arc::clone(&api);
                async move {
                    require("user_id", &req.user_id)?;
                    Ok::<_, SyncError>(api.redeem_stars(&req).await?)
                }
            },
            |req: &RedeemStarsRequest| balance_of(&req.user_id),
        )
    }

    /// Returns the session token; touches no cached data.
    pub fn login(&self) -> Mutation<LoginRequest, LoginResponse> {
        let api = Arc::clone(&self.api);
        self.sync.mutation(
            move |req: LoginRequest| {
                let api = Arc::clone(&api);
                async move {
                    require("email", &req.email)?;
                    Ok::<_, SyncError>(api.login(&req).await?)
                }
            },
            |_: &LoginRequest| Vec::new(),
        )
    }
}

fn campaign_family() -> Vec<KeyMatcher> {
    vec![KeyMatcher::prefix(keys::campaigns())]
}

fn balance_of(user_id: &str) -> Vec<KeyMatcher> {
    vec![KeyMatcher::exact(keys::loyalty_balance(user_id))]
}

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        });
    }
    Ok(())
}
