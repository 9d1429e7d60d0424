//! HTTP client for the remote tracking service.
//!
//! Thin typed wrapper over the endpoints the pipeline consumes: position,
//! alert, pin and batch submission, reference-data fetch, and authority
//! lookup/end. Transport failures are retried with exponential backoff (and
//! honored for 429) up to a small cap; beyond that the error surfaces to the
//! caller, which re-queues rather than blocking the pipeline.

use base64::Engine;
use log::{debug, warn};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RailguardError, Result};
use crate::types::{Authority, EntityKind, SyncOperation, TrackReferencePoint};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 200;

/// Position submission payload (submit-position endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSubmission {
    pub authority_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_mps: f64,
    pub heading_degrees: f64,
    pub accuracy_meters: f64,
    pub milepost: Option<f64>,
    pub recorded_at: i64,
}

/// Alert log submission payload (submit-alert-log endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSubmission {
    pub alert_key: String,
    pub alert_type: String,
    pub level: String,
    pub milepost: f64,
    pub distance_miles: f64,
    pub related_worker_id: Option<String>,
    pub created_at: i64,
}

/// Pin submission payload (submit-pin endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinSubmission {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
    pub created_at: i64,
}

/// One entry of a submit-sync-batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatchEntry {
    pub entity_kind: EntityKind,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
}

/// Typed client for the remote tracking service.
#[derive(Debug)]
pub struct RemoteClient {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl RemoteClient {
    /// Create a client authenticating with an API key (Basic auth).
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{api_key}"));
        Self::with_auth_header(base_url, format!("Basic {auth}"))
    }

    /// Create a client with a pre-formatted auth header ("Basic ..." or
    /// "Bearer ...").
    pub fn with_auth_header(base_url: &str, auth_header: String) -> Result<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RailguardError::Config(format!(
                "base URL must be absolute http(s), got '{base_url}'"
            )));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    pub async fn submit_position(&self, position: &PositionSubmission) -> Result<()> {
        self.send_json(Method::POST, "/api/v1/positions", position)
            .await
    }

    pub async fn submit_alert_log(&self, alert: &AlertSubmission) -> Result<()> {
        self.send_json(Method::POST, "/api/v1/alerts", alert).await
    }

    pub async fn submit_pin(&self, pin: &PinSubmission) -> Result<()> {
        self.send_json(Method::POST, "/api/v1/pins", pin).await
    }

    /// Submit a batch of queued records. The server upserts idempotently, so
    /// a replayed batch is harmless.
    pub async fn submit_sync_batch(&self, entries: &[SyncBatchEntry]) -> Result<()> {
        self.send_json(Method::POST, "/api/v1/sync-batch", entries)
            .await
    }

    /// Reference points for one subdivision, used to populate the resolver's
    /// cached geometry.
    pub async fn fetch_subdivision_reference_data(
        &self,
        subdivision_id: &str,
    ) -> Result<Vec<TrackReferencePoint>> {
        self.get_json(&format!(
            "/api/v1/subdivisions/{subdivision_id}/reference-points"
        ))
        .await
    }

    /// Fetch reference points for several subdivisions concurrently, e.g.
    /// when pre-caching a work territory before going out of coverage.
    /// Per-subdivision failures are reported alongside the successes rather
    /// than aborting the whole prefetch.
    pub async fn fetch_reference_data_bulk(
        &self,
        subdivision_ids: Vec<String>,
    ) -> Vec<(String, Result<Vec<TrackReferencePoint>>)> {
        use futures::stream::{self, StreamExt};

        const MAX_CONCURRENCY: usize = 4;

        stream::iter(subdivision_ids)
            .map(|id| async move {
                let result = self.fetch_subdivision_reference_data(&id).await;
                (id, result)
            })
            .buffer_unordered(MAX_CONCURRENCY)
            .collect()
            .await
    }

    /// The worker's current Active authority, if any.
    pub async fn fetch_active_authority(&self, worker_id: &str) -> Result<Option<Authority>> {
        self.get_json(&format!("/api/v1/workers/{worker_id}/active-authority"))
            .await
    }

    pub async fn end_authority(&self, authority_id: &str) -> Result<()> {
        self.send_json(
            Method::POST,
            &format!("/api/v1/authorities/{authority_id}/end"),
            &serde_json::json!({}),
        )
        .await
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut retries = 0;

        loop {
            let response = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", &self.auth_header)
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!("[RemoteClient] {method} {path} -> {status}");
                        return Ok(());
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS && retries < MAX_RETRIES {
                        retries += 1;
                        let wait = backoff(retries);
                        warn!(
                            "[RemoteClient] 429 from {path}, retry {retries} after {wait:?}"
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(RailguardError::Http {
                        message: format!("{method} {path} failed"),
                        status: Some(status.as_u16()),
                    });
                }
                Err(e) if retries < MAX_RETRIES => {
                    retries += 1;
                    let wait = backoff(retries);
                    warn!(
                        "[RemoteClient] {method} {path} error: {e}, retry {retries} after {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut retries = 0;

        loop {
            let response = self
                .client
                .get(&url)
                .header("Authorization", &self.auth_header)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS && retries < MAX_RETRIES {
                        retries += 1;
                        let wait = backoff(retries);
                        warn!("[RemoteClient] 429 from {path}, retry {retries} after {wait:?}");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    if !status.is_success() {
                        return Err(RailguardError::Http {
                            message: format!("GET {path} failed"),
                            status: Some(status.as_u16()),
                        });
                    }
                    let value = resp.json::<T>().await?;
                    debug!("[RemoteClient] GET {path} -> {status}");
                    return Ok(value);
                }
                Err(e) if retries < MAX_RETRIES => {
                    retries += 1;
                    let wait = backoff(retries);
                    warn!("[RemoteClient] GET {path} error: {e}, retry {retries} after {wait:?}");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Exponential backoff: 400ms, 800ms, 1.6s.
fn backoff(retry: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_MS * (1 << retry.min(4)))
}
