//! HTTP-backed collaborators for the financial API service

use crate::error::EngineError;
use crate::services::{
    Notification, NotificationChannel, TransferReceipt, TransferRequest, TransferService,
};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

#[derive(Clone)]
pub struct FinancialApiClient {
    client: Client,
    base_url: String,
}

impl FinancialApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST a JSON body. Network failures and 5xx answers are transient;
    /// 4xx answers are rejections and are not retried.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(format!("{} timed out", path))
                } else {
                    EngineError::ServiceUnavailable(format!(
                        "Financial API request failed for {}: {}",
                        path, e
                    ))
                }
            })?;

        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        if status.is_server_error() {
            warn!(%status, path, "Financial API server error");
            return Err(EngineError::ServiceUnavailable(format!(
                "Financial API returned {} for {}: {}",
                status, path, body
            )));
        }

        if !status.is_success() {
            return Err(EngineError::InvalidAction(format!(
                "Financial API rejected {} with {}: {}",
                path, status, body
            )));
        }

        Ok(body)
    }
}

pub struct HttpTransferService {
    api: FinancialApiClient,
}

impl HttpTransferService {
    pub fn new(api: FinancialApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl TransferService for HttpTransferService {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        let response = self
            .api
            .post_json("/api/v1/transfers", &serde_json::to_value(request)?)
            .await?;

        let data = response.get("data").cloned().unwrap_or(response);
        serde_json::from_value::<TransferReceipt>(data).map_err(|e| {
            EngineError::ServiceUnavailable(format!("Unexpected transfer response: {}", e))
        })
    }
}

pub struct HttpNotificationChannel {
    api: FinancialApiClient,
}

impl HttpNotificationChannel {
    pub fn new(api: FinancialApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl NotificationChannel for HttpNotificationChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.api
            .post_json("/api/v1/notifications", &serde_json::to_value(notification)?)
            .await?;
        Ok(())
    }
}
