//! Tidemark Test Utilities
//!
//! Shared test infrastructure for the Tidemark workspace:
//! - An in-memory [`MockDashboardApi`] with call counters, injectable
//!   failures and latency
//! - Proptest generators for keys and dashboard payloads
//! - Fixtures for common scenarios

pub use tidemark_client::types::{
    Campaign, CampaignStatus, CdpPlatform, CreateCampaignRequest, EarnStarsRequest, LoginRequest,
    LoginResponse, LoyaltyBalance, MonitoringOverview, RedeemStarsRequest, SyncHistoryEntry,
    SyncRunStatus,
};
pub use tidemark_client::{ApiClientError, DashboardApi};
pub use tidemark_core::{KeyMatcher, KeySegment, QueryKey, SyncConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK DASHBOARD API
// ============================================================================

/// Identifies one [`DashboardApi`] operation for counters and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    ListCampaigns,
    GetCampaign,
    CreateCampaign,
    PauseCampaign,
    ResumeCampaign,
    DeleteCampaign,
    GetLoyaltyBalance,
    EarnStars,
    RedeemStars,
    GetMonitoringOverview,
    ListCdpPlatforms,
    GetSyncHistory,
    Login,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    status: u16,
    message: String,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MockState {
    campaigns: Vec<Campaign>,
    balances: HashMap<String, i64>,
    platforms: Vec<CdpPlatform>,
    history: Vec<SyncHistoryEntry>,
    next_campaign_id: u64,
    calls: HashMap<ApiCall, usize>,
    failures: HashMap<ApiCall, InjectedFailure>,
    latency: Duration,
}

/// In-memory dashboard server.
///
/// Writes change what later reads return, so cache invalidation can be
/// observed end to end.
#[derive(Debug, Default)]
pub struct MockDashboardApi {
    state: Mutex<MockState>,
}

impl MockDashboardApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server seeded with [`fixtures::sample_campaigns`], two CDP
    /// platforms and balances for `u1` and `u2`.
    pub fn seeded() -> Self {
        let api = Self::new();
        {
            let mut state = api.lock();
            state.campaigns = fixtures::sample_campaigns();
            state.next_campaign_id = state
                .campaigns
                .iter()
                .filter_map(|c| c.id.parse::<u64>().ok())
                .max()
                .unwrap_or(0);
            state.platforms = fixtures::sample_platforms();
            state.history = fixtures::sample_history();
            state.balances.insert("u1".to_string(), 100);
            state.balances.insert("u2".to_string(), 250);
        }
        api
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Fail the next `times` calls of `call` with `status`.
    pub fn fail_times(&self, call: ApiCall, times: usize, status: u16, message: impl Into<String>) {
        if times == 0 {
            return;
        }
        self.lock().failures.insert(
            call,
            InjectedFailure {
                status,
                message: message.into(),
                remaining: Some(times),
            },
        );
    }

    /// Fail every call of `call` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, call: ApiCall, status: u16, message: impl Into<String>) {
        self.lock().failures.insert(
            call,
            InjectedFailure {
                status,
                message: message.into(),
                remaining: None,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self, call: ApiCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn campaign_count(&self) -> usize {
        self.lock().campaigns.len()
    }

    pub fn set_balance(&self, user_id: &str, stars: i64) {
        self.lock().balances.insert(user_id.to_string(), stars);
    }

    /// Count the call, apply latency, then consume an injected failure.
    async fn enter(&self, call: ApiCall) -> Result<(), ApiClientError> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry(call).or_insert(0) += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        let Some(failure) = state.failures.get_mut(&call) else {
            return Ok(());
        };
        let err = ApiClientError::status(failure.status, failure.message.clone());
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.failures.remove(&call);
            }
        }
        Err(err)
    }

    fn set_status(&self, id: &str, status: CampaignStatus) -> Result<Campaign, ApiClientError> {
        let mut state = self.lock();
        let campaign = state
            .campaigns
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("campaign", id))?;
        campaign.status = status;
        Ok(campaign.clone())
    }

    fn balance(&self, user_id: &str) -> LoyaltyBalance {
        let stars = self.lock().balances.get(user_id).copied().unwrap_or(0);
        LoyaltyBalance {
            user_id: user_id.to_string(),
            stars,
            tier: Some(tier_for(stars).to_string()),
        }
    }
}

fn not_found(kind: &str, id: &str) -> ApiClientError {
    ApiClientError::status(404, format!("{} {} not found", kind, id))
}

fn tier_for(stars: i64) -> &'static str {
    match stars {
        s if s >= 1_000 => "gold",
        s if s >= 200 => "silver",
        _ => "green",
    }
}

#[async_trait]
impl DashboardApi for MockDashboardApi {
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, ApiClientError> {
        self.enter(ApiCall::ListCampaigns).await?;
        Ok(self.lock().campaigns.clone())
    }

    async fn get_campaign(&self, id: &str) -> Result<Campaign, ApiClientError> {
        self.enter(ApiCall::GetCampaign).await?;
        self.lock()
            .campaigns
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found("campaign", id))
    }

    async fn create_campaign(&self, req: &CreateCampaignRequest) -> Result<Campaign, ApiClientError> {
        self.enter(ApiCall::CreateCampaign).await?;
        let mut state = self.lock();
        state.next_campaign_id += 1;
        let campaign = Campaign {
            id: state.next_campaign_id.to_string(),
            name: req.name.clone(),
            status: CampaignStatus::Draft,
            budget_cents: req.budget_cents,
            starts_at: req.starts_at,
            ends_at: req.ends_at,
            created_at: Utc::now(),
        };
        state.campaigns.push(campaign.clone());
        Ok(campaign)
    }

    async fn pause_campaign(&self, id: &str) -> Result<Campaign, ApiClientError> {
        self.enter(ApiCall::PauseCampaign).await?;
        self.set_status(id, CampaignStatus::Paused)
    }

    async fn resume_campaign(&self, id: &str) -> Result<Campaign, ApiClientError> {
        self.enter(ApiCall::ResumeCampaign).await?;
        self.set_status(id, CampaignStatus::Active)
    }

    async fn delete_campaign(&self, id: &str) -> Result<(), ApiClientError> {
        self.enter(ApiCall::DeleteCampaign).await?;
        let mut state = self.lock();
        let before = state.campaigns.len();
        state.campaigns.retain(|c| c.id != id);
        if state.campaigns.len() == before {
            return Err(not_found("campaign", id));
        }
        Ok(())
    }

    async fn get_loyalty_balance(&self, user_id: &str) -> Result<LoyaltyBalance, ApiClientError> {
        self.enter(ApiCall::GetLoyaltyBalance).await?;
        Ok(self.balance(user_id))
    }

    async fn earn_stars(&self, req: &EarnStarsRequest) -> Result<LoyaltyBalance, ApiClientError> {
        self.enter(ApiCall::EarnStars).await?;
        if req.amount <= 0 {
            return Err(ApiClientError::status(422, "amount must be positive"));
        }
        *self.lock().balances.entry(req.user_id.clone()).or_insert(0) += req.amount;
        Ok(self.balance(&req.user_id))
    }

    async fn redeem_stars(&self, req: &RedeemStarsRequest) -> Result<LoyaltyBalance, ApiClientError> {
        self.enter(ApiCall::RedeemStars).await?;
        {
            let mut state = self.lock();
            let stars = state.balances.entry(req.user_id.clone()).or_insert(0);
            if req.amount <= 0 || *stars < req.amount {
                return Err(ApiClientError::status(422, "insufficient stars"));
            }
            *stars -= req.amount;
        }
        Ok(self.balance(&req.user_id))
    }

    async fn get_monitoring_overview(&self) -> Result<MonitoringOverview, ApiClientError> {
        self.enter(ApiCall::GetMonitoringOverview).await?;
        let state = self.lock();
        let active = state
            .campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Active)
            .count() as u64;
        let polls = state.calls.get(&ApiCall::GetMonitoringOverview).copied().unwrap_or(0);
        Ok(MonitoringOverview {
            active_campaigns: active,
            events_per_minute: 120.0 + polls as f64,
            error_rate: 0.01,
            platforms_connected: state.platforms.iter().filter(|p| p.connected).count() as u32,
            platforms_total: state.platforms.len() as u32,
            generated_at: Utc::now(),
        })
    }

    async fn list_cdp_platforms(&self) -> Result<Vec<CdpPlatform>, ApiClientError> {
        self.enter(ApiCall::ListCdpPlatforms).await?;
        Ok(self.lock().platforms.clone())
    }

    async fn get_sync_history(&self) -> Result<Vec<SyncHistoryEntry>, ApiClientError> {
        self.enter(ApiCall::GetSyncHistory).await?;
        Ok(self.lock().history.clone())
    }

    async fn login(&self, req: &LoginRequest) -> Result<LoginResponse, ApiClientError> {
        self.enter(ApiCall::Login).await?;
        if req.password.is_empty() {
            return Err(ApiClientError::status(401, "invalid credentials"));
        }
        Ok(LoginResponse {
            token: format!("token-{}", req.email),
            user_id: "u1".to_string(),
            expires_at: None,
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and dashboard payloads.

    use super::*;
    use proptest::prelude::*;

    /// Generate a non-empty key segment.
    pub fn arb_key_segment() -> impl Strategy<Value = KeySegment> {
        prop_oneof![
            "[a-z][a-z0-9-]{0,8}".prop_map(KeySegment::from),
            any::<i64>().prop_map(KeySegment::Int),
            any::<bool>().prop_map(KeySegment::Bool),
        ]
    }

    /// Generate a valid key of 1 to 4 segments.
    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(arb_key_segment(), 1..=4).prop_map(QueryKey::new)
    }

    /// Generate keys from a tiny alphabet so prefixes collide often.
    pub fn arb_dense_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(prop::sample::select(vec!["campaigns", "7", "loyalty"]), 1..=3)
            .prop_map(|segments| QueryKey::new(segments.into_iter().map(KeySegment::from).collect()))
    }

    /// Generate a timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (1577836800i64..1893456000i64)
            .prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now))
    }

    pub fn arb_campaign_status() -> impl Strategy<Value = CampaignStatus> {
        prop_oneof![
            Just(CampaignStatus::Draft),
            Just(CampaignStatus::Active),
            Just(CampaignStatus::Paused),
            Just(CampaignStatus::Completed),
        ]
    }

    pub fn arb_campaign() -> impl Strategy<Value = Campaign> {
        (
            "[0-9]{1,4}",
            "[A-Za-z ]{1,24}",
            arb_campaign_status(),
            proptest::option::of(0i64..10_000_000),
            arb_timestamp(),
        )
            .prop_map(|(id, name, status, budget_cents, created_at)| Campaign {
                id,
                name,
                status,
                budget_cents,
                starts_at: None,
                ends_at: None,
                created_at,
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
    }

    pub fn campaign(id: &str, name: &str, status: CampaignStatus) -> Campaign {
        Campaign {
            id: id.to_string(),
            name: name.to_string(),
            status,
            budget_cents: Some(50_000),
            starts_at: None,
            ends_at: None,
            created_at: at(1_767_225_600),
        }
    }

    /// Three campaigns with ids "1", "2" and "7".
    pub fn sample_campaigns() -> Vec<Campaign> {
        vec![
            campaign("1", "Spring launch", CampaignStatus::Active),
            campaign("2", "Loyalty double stars", CampaignStatus::Paused),
            campaign("7", "Holiday retargeting", CampaignStatus::Active),
        ]
    }

    pub fn sample_platforms() -> Vec<CdpPlatform> {
        vec![
            CdpPlatform {
                id: "segment".to_string(),
                name: "Segment".to_string(),
                connected: true,
                last_sync_at: Some(at(1_767_229_200)),
            },
            CdpPlatform {
                id: "braze".to_string(),
                name: "Braze".to_string(),
                connected: false,
                last_sync_at: None,
            },
        ]
    }

    pub fn sample_history() -> Vec<SyncHistoryEntry> {
        vec![SyncHistoryEntry {
            id: "run-1".to_string(),
            platform_id: "segment".to_string(),
            status: SyncRunStatus::Succeeded,
            records_synced: 1_204,
            started_at: at(1_767_229_000),
            finished_at: Some(at(1_767_229_200)),
        }]
    }

    /// Sync config with a long freshness window and no eviction grace.
    pub fn eager_sync_config() -> SyncConfig {
        SyncConfig::default()
            .with_default_stale_after(Duration::from_secs(300))
            .with_gc_grace(Duration::ZERO)
    }

    /// A complete client config document.
    pub const CLIENT_CONFIG_TOML: &str = r#"
api_base_url = "http://localhost:8080"
request_timeout_ms = 5000
log_format = "json"

[auth]
api_key = "test-key"

[sync]
default_stale_after_ms = 1000
gc_grace_ms = 5000
default_retries = 1
"#;
}
