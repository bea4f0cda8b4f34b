use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use courier_backend::server::{
    BroadcastSettingsView, HealthResponse, InstructionsBody, UpdateBroadcastRequest,
    UpdateBroadcastResponse,
};
use courier_backend::settings::SettingsStatus;
use courier_backend::types::{BroadcastAttempt, BroadcastSummary, ConversationInfo};

const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:8788";

/// HTTP client for the courier backend's admin API.
pub struct AdminClient {
    http: reqwest::Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.request(reqwest::Method::GET, "/v1/health").send().await;
        decode(response, "GET /v1/health").await
    }

    pub async fn status(&self) -> Result<SettingsStatus> {
        let response = self.request(reqwest::Method::GET, "/v1/status").send().await;
        decode(response, "GET /v1/status").await
    }

    pub async fn get_instructions(&self) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, "/v1/settings/instructions")
            .send()
            .await;
        let body: InstructionsBody = decode(response, "GET /v1/settings/instructions").await?;
        Ok(body.text)
    }

    pub async fn set_instructions(&self, text: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::PUT, "/v1/settings/instructions")
            .json(&InstructionsBody {
                text: text.to_string(),
            })
            .send()
            .await;
        let body: InstructionsBody = decode(response, "PUT /v1/settings/instructions").await?;
        Ok(body.text)
    }

    pub async fn get_broadcast_settings(&self) -> Result<BroadcastSettingsView> {
        let response = self
            .request(reqwest::Method::GET, "/v1/settings/broadcast")
            .send()
            .await;
        decode(response, "GET /v1/settings/broadcast").await
    }

    pub async fn set_broadcast_settings(
        &self,
        targets: &str,
        start_message: &str,
    ) -> Result<UpdateBroadcastResponse> {
        let response = self
            .request(reqwest::Method::PUT, "/v1/settings/broadcast")
            .json(&UpdateBroadcastRequest {
                targets: targets.to_string(),
                start_message: start_message.to_string(),
            })
            .send()
            .await;
        decode(response, "PUT /v1/settings/broadcast").await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationInfo>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/conversations")
            .send()
            .await;
        decode(response, "GET /v1/conversations").await
    }

    pub async fn run_broadcast(&self) -> Result<BroadcastSummary> {
        let response = self.request(reqwest::Method::POST, "/v1/broadcast").send().await;
        decode(response, "POST /v1/broadcast").await
    }

    pub async fn recent_attempts(&self, limit: usize) -> Result<Vec<BroadcastAttempt>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/broadcast/attempts")
            .query(&[("limit", limit)])
            .send()
            .await;
        decode(response, "GET /v1/broadcast/attempts").await
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http.request(method, url)
    }
}

/// Decode a JSON body, turning non-2xx responses into errors that carry the
/// server's message.
async fn decode<T: DeserializeOwned>(
    response: reqwest::Result<reqwest::Response>,
    what: &str,
) -> Result<T> {
    let response = response.with_context(|| format!("{} request failed", what))?;
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read body".to_string());
        anyhow::bail!("{} failed ({}): {}", what, status, body.trim());
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("Failed to decode {} response", what))
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_ADMIN_URL.to_string()
    } else {
        trimmed.to_string()
    }
}
