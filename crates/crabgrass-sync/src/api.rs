use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

pub const DEV_USER_COOKIE: &str = "crabgrass_dev_user";

fn default_headers(dev_user: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(user) = dev_user {
        if let Ok(value) = HeaderValue::from_str(&format!("{}={}", DEV_USER_COOKIE, user)) {
            headers.insert(COOKIE, value);
        }
    }
    headers
}

pub(crate) fn build_http_client(timeout: Duration, dev_user: Option<&str>) -> Result<Client> {
    Client::builder()
        .default_headers(default_headers(dev_user))
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::InvalidConfig(format!("failed to create HTTP client: {}", e)))
}

/// Long-lived push connections must not inherit the request timeout.
pub(crate) fn build_stream_client(dev_user: Option<&str>) -> Result<Client> {
    let mut headers = default_headers(dev_user);
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    Client::builder()
        .default_headers(headers)
        .http1_only()
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| SyncError::InvalidConfig(format!("failed to create stream client: {}", e)))
}

/// Thin typed JSON wrapper over the Crabgrass REST API.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(config.request_timeout(), config.dev_user.as_deref())?,
            base_url: config.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<(), T>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn request<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("{} {}", method, url);

        let mut req = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            SyncError::Transport(format!("{} {} failed: {}", method, path, e))
        })?;

        handle_response(response).await
    }
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let url = response.url().to_string();

    let body = response
        .text()
        .await
        .map_err(|e| SyncError::Transport(format!("Failed to read response body: {}", e)))?;

    if !status.is_success() {
        let detail = error_detail(status.as_u16(), &body);
        tracing::warn!("Request to {} failed ({}): {}", url, status, detail);
        return Err(SyncError::Http {
            status: status.as_u16(),
            detail,
        });
    }

    tracing::debug!("Response from {}: {}", url, &body[..floor_char_boundary(&body, 500)]);

    serde_json::from_str(&body).map_err(|e| {
        tracing::error!("Failed to parse response from {}: {}", url, e);
        SyncError::Serialization(e)
    })
}

/// `detail` from a FastAPI-style error body, else `HTTP {status}`.
pub(crate) fn error_detail(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(|d| d.as_str())
                .map(str::to_string)
        })
        .filter(|detail| !detail.trim().is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status))
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    let mut idx = max;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
