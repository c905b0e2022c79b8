//! Dashboard Request and Response Types
//!
//! Wire shapes exchanged with the dashboard REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CAMPAIGNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub budget_cents: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub budget_cents: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl CreateCampaignRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            budget_cents: None,
            starts_at: None,
            ends_at: None,
        }
    }
}

// ============================================================================
// LOYALTY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoyaltyBalance {
    pub user_id: String,
    pub stars: i64,
    pub tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarnStarsRequest {
    pub user_id: String,
    pub amount: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemStarsRequest {
    pub user_id: String,
    pub amount: i64,
    pub reward_id: Option<String>,
}

// ============================================================================
// MONITORING
// ============================================================================

/// Aggregate health numbers shown on the real-time monitoring surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringOverview {
    pub active_campaigns: u64,
    pub events_per_minute: f64,
    pub error_rate: f64,
    pub platforms_connected: u32,
    pub platforms_total: u32,
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// CDP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdpPlatform {
    pub id: String,
    pub name: String,
    pub connected: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub id: String,
    pub platform_id: String,
    pub status: SyncRunStatus,
    pub records_synced: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// AUTH
// ============================================================================

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(alias = "error")]
    pub message: String,
}
