//! REST client for the dashboard API.

use crate::config::{AuthConfig, ClientConfig};
use crate::types::{
    Campaign, CdpPlatform, CreateCampaignRequest, EarnStarsRequest, ErrorBody, LoginRequest,
    LoginResponse, LoyaltyBalance, MonitoringOverview, RedeemStarsRequest, SyncHistoryEntry,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tidemark_core::{ConfigError, SyncError, TransportError};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Config error: {0}")]
    Config(String),
}

impl ApiClientError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

impl From<ApiClientError> for SyncError {
    fn from(err: ApiClientError) -> Self {
        match err {
            ApiClientError::Http(e) => {
                if e.is_decode() {
                    TransportError::Decode {
                        reason: e.to_string(),
                    }
                    .into()
                } else {
                    SyncError::transport(e.status().map(|s| s.as_u16()), e.to_string())
                }
            }
            ApiClientError::Serde(e) => TransportError::Decode {
                reason: e.to_string(),
            }
            .into(),
            ApiClientError::Status { status, message } => {
                SyncError::transport(Some(status), message)
            }
            ApiClientError::Config(reason) => ConfigError::InvalidValue {
                field: "auth".to_string(),
                value: "<redacted>".to_string(),
                reason,
            }
            .into(),
        }
    }
}

/// One async operation per server resource.
#[async_trait]
pub trait DashboardApi: Send + Sync {
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, ApiClientError>;
    async fn get_campaign(&self, id: &str) -> Result<Campaign, ApiClientError>;
    async fn create_campaign(&self, req: &CreateCampaignRequest) -> Result<Campaign, ApiClientError>;
    async fn pause_campaign(&self, id: &str) -> Result<Campaign, ApiClientError>;
    async fn resume_campaign(&self, id: &str) -> Result<Campaign, ApiClientError>;
    async fn delete_campaign(&self, id: &str) -> Result<(), ApiClientError>;

    async fn get_loyalty_balance(&self, user_id: &str) -> Result<LoyaltyBalance, ApiClientError>;
    async fn earn_stars(&self, req: &EarnStarsRequest) -> Result<LoyaltyBalance, ApiClientError>;
    async fn redeem_stars(&self, req: &RedeemStarsRequest) -> Result<LoyaltyBalance, ApiClientError>;

    async fn get_monitoring_overview(&self) -> Result<MonitoringOverview, ApiClientError>;
    async fn list_cdp_platforms(&self) -> Result<Vec<CdpPlatform>, ApiClientError>;
    async fn get_sync_history(&self) -> Result<Vec<SyncHistoryEntry>, ApiClientError>;

    async fn login(&self, req: &LoginRequest) -> Result<LoginResponse, ApiClientError>;
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiClientError> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, ApiClientError>
    where
        T: serde::de::DeserializeOwned,
    {
        debug!(method = "GET", path, "Sending request");
        let response = self
            .client
            .get(self.url(path))
            .headers(self.auth_header.clone())
            .send()
            .await?;
        parse_response(response).await
    }

    async fn post_json<T, B>(&self, path: &str, body: Option<&B>) -> Result<T, ApiClientError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        debug!(method = "POST", path, "Sending request");
        let mut request = self
            .client
            .post(self.url(path))
            .headers(self.auth_header.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        parse_response(response).await
    }

    async fn delete(&self, path: &str) -> Result<(), ApiClientError> {
        debug!(method = "DELETE", path, "Sending request");
        let response = self
            .client
            .delete(self.url(path))
            .headers(self.auth_header.clone())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(error_from_body(status.as_u16(), &response.text().await?))
        }
    }
}

#[async_trait]
impl DashboardApi for RestClient {
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, ApiClientError> {
        self.get_json("/api/campaigns").await
    }

    async fn get_campaign(&self, id: &str) -> Result<Campaign, ApiClientError> {
        self.get_json(&format!("/api/campaigns/{}", id)).await
    }

    async fn create_campaign(&self, req: &CreateCampaignRequest) -> Result<Campaign, ApiClientError> {
        self.post_json("/api/campaigns", Some(req)).await
    }

    async fn pause_campaign(&self, id: &str) -> Result<Campaign, ApiClientError> {
        self.post_json::<_, ()>(&format!("/api/campaigns/{}/pause", id), None)
            .await
    }

    async fn resume_campaign(&self, id: &str) -> Result<Campaign, ApiClientError> {
        self.post_json::<_, ()>(&format!("/api/campaigns/{}/resume", id), None)
            .await
    }

    async fn delete_campaign(&self, id: &str) -> Result<(), ApiClientError> {
        self.delete(&format!("/api/campaigns/{}", id)).await
    }

    async fn get_loyalty_balance(&self, user_id: &str) -> Result<LoyaltyBalance, ApiClientError> {
        self.get_json(&format!("/api/loyalty/{}/balance", user_id))
            .await
    }

    async fn earn_stars(&self, req: &EarnStarsRequest) -> Result<LoyaltyBalance, ApiClientError> {
        self.post_json("/api/loyalty/earn", Some(req)).await
    }

    async fn redeem_stars(&self, req: &RedeemStarsRequest) -> Result<LoyaltyBalance, ApiClientError> {
        self.post_json("/api/loyalty/redeem", Some(req)).await
    }

    async fn get_monitoring_overview(&self) -> Result<MonitoringOverview, ApiClientError> {
        self.get_json("/api/monitoring/overview").await
    }

    async fn list_cdp_platforms(&self) -> Result<Vec<CdpPlatform>, ApiClientError> {
        self.get_json("/api/cdp/platforms").await
    }

    async fn get_sync_history(&self) -> Result<Vec<SyncHistoryEntry>, ApiClientError> {
        self.get_json("/api/cdp/sync-history").await
    }

    async fn login(&self, req: &LoginRequest) -> Result<LoginResponse, ApiClientError> {
        self.post_json("/api/auth/login", Some(req)).await
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiClientError> {
    let status = response.status();
    if status.is_success() {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    } else {
        let text = response.text().await?;
        Err(error_from_body(status.as_u16(), &text))
    }
}

fn error_from_body(status: u16, text: &str) -> ApiClientError {
    let message = match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => body.message,
        Err(_) if text.trim().is_empty() => "empty response body".to_string(),
        Err(_) => text.to_string(),
    };
    ApiClientError::Status { status, message }
}

fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ApiClientError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| ApiClientError::Config(e.to_string()))?,
        );
    }
    if let Some(token) = &auth.bearer_token {
        let value = format!("Bearer {}", token);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| ApiClientError::Config(e.to_string()))?,
        );
    }
    Ok(headers)
}
