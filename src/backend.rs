// ABOUTME: HTTP client for the optional appointments backend
// ABOUTME: Posts the full current record set and error reports; failures never fail a run

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::record::Record;
use crate::utils::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Serialize)]
struct AppointmentsPayload<'a> {
    appointments: &'a [Record],
}

#[derive(Debug, Serialize)]
struct ErrorPayload<'a> {
    error: &'a str,
    timestamp: String,
}

pub struct BackendClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl BackendClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);

        // Add API key header if provided
        if let Some(ref key) = self.api_key {
            request = request.header("x-api-key", key);
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> SyncResult<()> {
        let response = request.send().await.map_err(|e| {
            // Only failures before a response arrived are safe to resend
            if e.is_connect() || e.is_timeout() {
                SyncError::Backend(format!("{}: {}", what, e))
            } else {
                SyncError::BackendRejected(format!("{}: {}", what, e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::BackendRejected(format!(
                "{} returned {}: {}",
                what, status, body
            )));
        }
        Ok(())
    }

    /// Whether the backend answers its health endpoint.
    pub async fn health_check(&self) -> bool {
        match self
            .send(self.request(reqwest::Method::GET, "/api/health"), "health check")
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Backend health check failed: {}", e);
                false
            }
        }
    }

    /// Post the full current record set.
    pub async fn post_appointments(&self, records: &[Record]) -> SyncResult<()> {
        let payload = AppointmentsPayload {
            appointments: records,
        };
        retry_with_backoff(
            || {
                self.send(
                    self.request(reqwest::Method::POST, "/api/sync-data")
                        .json(&payload),
                    "sync-data",
                )
            },
            self.retry,
            "Backend sync-data",
        )
        .await?;
        tracing::info!("Posted {} appointments to backend", records.len());
        Ok(())
    }

    /// Report a failed run. Never retried.
    pub async fn post_error(&self, message: &str) -> SyncResult<()> {
        let payload = ErrorPayload {
            error: message,
            timestamp: chrono::Local::now().to_rfc3339(),
        };
        self.send(
            self.request(reqwest::Method::POST, "/api/sync-error")
                .json(&payload),
            "sync-error",
        )
        .await
    }
}
