//! REST client for the farm backend.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{ApiError, FarmApi};
use crate::models::{
    Cattle, CattleWithFarmInfo, Farm, FarmCattleCount, MedicalRecord, NewFarm, NewMedicalRecord,
    ReportSummary, UserProfile,
};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// The cache layer imposes no timeout of its own, so this is the only one.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the farm backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send a request, backing off exponentially while rate limited.
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(self.auth_headers()?);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("Failed to send {} request to {}", method, url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    debug!(%method, url = %url, "Request succeeded");
                    return Ok(response);
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = %url, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    async fn send_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.send(method, path, Some(body)).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }
}

#[async_trait]
impl FarmApi for ApiClient {
    async fn list_farms(&self, user_id: &str) -> Result<Vec<Farm>> {
        self.get(&format!("users/{}/farms", user_id))
            .await
            .context("Failed to fetch farms")
    }

    async fn fetch_farm(&self, farm_id: i64) -> Result<Farm> {
        self.get(&format!("farms/{}", farm_id))
            .await
            .with_context(|| format!("Failed to fetch farm {}", farm_id))
    }

    async fn list_cattle_with_farm_info(&self, user_id: &str) -> Result<Vec<CattleWithFarmInfo>> {
        self.get(&format!("users/{}/cattle?include=farm", user_id))
            .await
            .context("Failed to fetch cattle")
    }

    async fn list_cattle_by_farm(&self, farm_id: i64) -> Result<Vec<Cattle>> {
        self.get(&format!("farms/{}/cattle", farm_id))
            .await
            .with_context(|| format!("Failed to fetch cattle for farm {}", farm_id))
    }

    async fn cattle_count_by_farm(&self, user_id: &str) -> Result<Vec<FarmCattleCount>> {
        self.get(&format!("users/{}/cattle/counts", user_id))
            .await
            .context("Failed to fetch cattle counts")
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile> {
        self.get(&format!("users/{}/profile", user_id))
            .await
            .context("Failed to fetch user profile")
    }

    async fn list_medical_records(&self, cattle_id: i64) -> Result<Vec<MedicalRecord>> {
        self.get(&format!("cattle/{}/medical", cattle_id))
            .await
            .with_context(|| format!("Failed to fetch medical records for {}", cattle_id))
    }

    async fn fetch_report_summary(&self, user_id: &str) -> Result<ReportSummary> {
        self.get(&format!("users/{}/reports/summary", user_id))
            .await
            .context("Failed to fetch report summary")
    }

    async fn create_farm(&self, user_id: &str, farm: &NewFarm) -> Result<Farm> {
        self.send_json(Method::POST, &format!("users/{}/farms", user_id), farm)
            .await
            .context("Failed to create farm")
    }

    async fn update_farm(&self, farm: &Farm) -> Result<Farm> {
        self.send_json(Method::PUT, &format!("farms/{}", farm.id), farm)
            .await
            .with_context(|| format!("Failed to update farm {}", farm.id))
    }

    async fn delete_farm(&self, farm_id: i64) -> Result<()> {
        self.send::<()>(Method::DELETE, &format!("farms/{}", farm_id), None)
            .await
            .with_context(|| format!("Failed to delete farm {}", farm_id))?;
        Ok(())
    }

    async fn move_cattle(&self, cattle_id: i64, farm_id: i64) -> Result<Cattle> {
        self.send_json(
            Method::PATCH,
            &format!("cattle/{}", cattle_id),
            &json!({ "farmId": farm_id }),
        )
        .await
        .with_context(|| format!("Failed to move cattle {} to farm {}", cattle_id, farm_id))
    }

    async fn update_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        self.send_json(Method::PUT, &format!("users/{}/profile", profile.id), profile)
            .await
            .context("Failed to update profile")
    }

    async fn add_medical_record(&self, record: &NewMedicalRecord) -> Result<MedicalRecord> {
        self.send_json(
            Method::POST,
            &format!("cattle/{}/medical", record.cattle_id),
            record,
        )
        .await
        .context("Failed to add medical record")
    }
}
