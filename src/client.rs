//! Coordinator API client
//!
//! Wire types and typed calls for the endpoints the miner consumes:
//! ```text
//! GET  /miner/version                        version compatibility
//! GET  /miner/connect?timeout&since_time     long-poll for auctions
//! POST /miner/job/<jid>/bid                  200 = won, 402 = lost
//! POST /miner/device_snapshot[?jID=]         single device telemetry
//! POST /miner/stats                          aggregate miner stats
//! GET  /miner/job/<jid>          (data host) input data tar+gzip
//! POST /image/downloaded/<jid>               image pull acknowledgement
//! POST /job/<jid>/log                        log chunk, empty body = EOL
//! GET  /job/<jid>/cancel?timeout&since_time  long-poll for user cancel
//! POST /job/<jid>/data[?jobcanceled=1]       output archive
//! POST /auth/token?grant_type=token          token refresh
//! ```

use crate::config::Endpoints;
use crate::gpu::DeviceSnapshot;
use crate::transport::{RetryPolicy, Transport, TransportError};
use bytes::Bytes;
use reqwest::{Body, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Server-side hold time for long-polls, seconds
pub const LONGPOLL_TIMEOUT_SECS: u64 = 600;

/// Retry budget for log chunk uploads
pub const LOG_MAX_RETRIES: u32 = 10;

/// Retry budget for image/data downloads and output uploads
pub const TRANSFER_MAX_RETRIES: u32 = 10;

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Long-poll envelope shared by `/miner/connect` and `/job/<id>/cancel`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongpollResponse {
    #[serde(default)]
    pub events: Vec<LongpollEvent>,
    /// Server time (ms) to resume from when no events arrived
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl LongpollResponse {
    /// Next `since_time`: the last event's timestamp, else the envelope's.
    pub fn next_since(&self, current: i64) -> i64 {
        self.events
            .last()
            .map(|e| e.timestamp)
            .or(self.timestamp)
            .unwrap_or(current)
    }
}

/// One long-poll event; timestamps are ms since the epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongpollEvent {
    pub timestamp: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl LongpollEvent {
    /// Decode the job carried by an auction event. Null data and ids that
    /// fail [`is_valid_job_id`] yield `None`.
    pub fn job(&self) -> Option<JobDescriptor> {
        let job: JobDescriptor = match &self.data {
            serde_json::Value::Null => None,
            // Some servers double-encode the payload as a JSON string
            serde_json::Value::String(s) => serde_json::from_str(s).ok(),
            other => serde_json::from_value(other.clone()).ok(),
        }?;
        is_valid_job_id(&job.id).then_some(job)
    }
}

/// Longest job id accepted from the coordinator
pub const MAX_JOB_ID_LEN: usize = 128;

/// Job ids become path components and URL segments, so only
/// `[A-Za-z0-9_-]{1,128}` is accepted.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Job up for auction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(alias = "ID", alias = "jID", alias = "job_id")]
    pub id: String,
}

/// Specs declared with a bid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidSpecs {
    /// $/hr
    pub rate: f64,
    /// Accepted GPU model tag
    pub gpu: String,
    pub ram: u64,
    pub disk: u64,
    pub pcie: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub device_id: String,
    pub specs: BidSpecs,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Minimum compatible client version
    pub version: String,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

// ============================================================================
// CLIENT
// ============================================================================

/// Typed coordinator calls over the resilient transport
#[derive(Clone)]
pub struct CoordinatorClient {
    transport: Transport,
    endpoints: Endpoints,
}

impl CoordinatorClient {
    pub fn new(transport: Transport, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Password grant. Returns the new token.
    pub async fn login(
        &self,
        cancel: &CancellationToken,
        email: &str,
        password: &str,
        duration_days: u32,
    ) -> Result<String, TransportError> {
        let url = self.endpoints.api_url("/auth/token");
        let duration = duration_days.to_string();
        let response = self
            .transport
            .send(cancel, RetryPolicy::with_max_retries(3), |c| {
                c.post(&url)
                    .query(&[("grant_type", "password"), ("duration", duration.as_str())])
                    .json(&LoginRequest { email, password })
            })
            .await?;
        parse_token(response).await
    }

    /// Exchange the current bearer for a fresh token.
    pub async fn refresh_token(
        &self,
        cancel: &CancellationToken,
        max_retries: u32,
    ) -> Result<String, TransportError> {
        let url = self.endpoints.api_url("/auth/token");
        let response = self
            .transport
            .send(cancel, RetryPolicy::with_max_retries(max_retries), |c| {
                c.post(&url).query(&[("grant_type", "token")])
            })
            .await?;
        parse_token(response).await
    }

    /// Minimum client version the coordinator accepts.
    pub async fn miner_version(
        &self,
        cancel: &CancellationToken,
    ) -> Result<VersionInfo, TransportError> {
        let url = self.endpoints.api_url("/miner/version");
        let response = self
            .transport
            .send(cancel, RetryPolicy::with_max_retries(5), |c| c.get(&url))
            .await?;
        decode(response).await
    }

    /// One long-poll for auction events. Transient failures retry forever.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        since_time: i64,
    ) -> Result<LongpollResponse, TransportError> {
        let url = self.endpoints.api_url("/miner/connect");
        let response = self
            .transport
            .send(cancel, RetryPolicy::unbounded(), |c| {
                c.get(&url).query(&[
                    ("timeout", LONGPOLL_TIMEOUT_SECS as i64),
                    ("since_time", since_time),
                ])
            })
            .await?;
        decode(response).await
    }

    /// Single bid attempt; the worker owns the retry loop.
    pub async fn bid_once(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        bid: &Bid,
    ) -> Result<Bytes, TransportError> {
        let url = self.endpoints.api_url(&format!("/miner/job/{}/bid", job_id));
        let response = self
            .transport
            .send_once(cancel, |c| c.post(&url).json(bid))
            .await?;
        response
            .bytes()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }

    pub async fn upload_snapshot(
        &self,
        cancel: &CancellationToken,
        snapshot: &DeviceSnapshot,
        job_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let url = self.endpoints.api_url("/miner/device_snapshot");
        self.transport
            .send(cancel, RetryPolicy::with_max_retries(3), |c| {
                let req = c.post(&url).json(snapshot);
                match job_id {
                    Some(j) => req.query(&[("jID", j)]),
                    None => req,
                }
            })
            .await?;
        Ok(())
    }

    pub async fn upload_stats<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        stats: &T,
    ) -> Result<(), TransportError> {
        let url = self.endpoints.api_url("/miner/stats");
        self.transport
            .send(cancel, RetryPolicy::with_max_retries(3), |c| {
                c.post(&url).json(stats)
            })
            .await?;
        Ok(())
    }

    /// Start downloading the input data archive from the data host.
    pub async fn fetch_data(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> Result<Response, TransportError> {
        let url = self.endpoints.data_url(&format!("/miner/job/{}", job_id));
        self.transport
            .send(
                cancel,
                RetryPolicy::with_max_retries(TRANSFER_MAX_RETRIES),
                |c| c.get(&url),
            )
            .await
    }

    pub async fn ack_image(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> Result<(), TransportError> {
        let url = self
            .endpoints
            .api_url(&format!("/image/downloaded/{}", job_id));
        self.transport
            .send(
                cancel,
                RetryPolicy::with_max_retries(TRANSFER_MAX_RETRIES),
                |c| c.post(&url),
            )
            .await?;
        Ok(())
    }

    /// Upload a log chunk. An empty chunk tells the server the stream closed.
    pub async fn upload_log(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        chunk: Bytes,
    ) -> Result<(), TransportError> {
        let url = self.endpoints.api_url(&format!("/job/{}/log", job_id));
        self.transport
            .send(cancel, RetryPolicy::with_max_retries(LOG_MAX_RETRIES), |c| {
                c.post(&url).body(chunk.clone())
            })
            .await?;
        Ok(())
    }

    /// One long-poll for a user cancellation.
    pub async fn poll_cancel(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        since_time: i64,
    ) -> Result<LongpollResponse, TransportError> {
        let url = self.endpoints.api_url(&format!("/job/{}/cancel", job_id));
        let response = self
            .transport
            .send(cancel, RetryPolicy::unbounded(), |c| {
                c.get(&url).query(&[
                    ("timeout", LONGPOLL_TIMEOUT_SECS as i64),
                    ("since_time", since_time),
                ])
            })
            .await?;
        decode(response).await
    }

    /// Upload the output archive. `body` is called once per attempt so each
    /// retry streams a fresh archive.
    pub async fn upload_output<F>(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        canceled: bool,
        body: F,
    ) -> Result<(), TransportError>
    where
        F: Fn() -> Body,
    {
        let mut url = self.endpoints.api_url(&format!("/job/{}/data", job_id));
        if canceled {
            url.push_str("?jobcanceled=1");
        }
        self.transport
            .send(
                cancel,
                RetryPolicy::with_max_retries(TRANSFER_MAX_RETRIES),
                |c| {
                    c.post(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/gzip")
                        .body(body())
                },
            )
            .await?;
        Ok(())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|e| TransportError::Transient(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Permanent {
        status,
        body: format!("invalid response body: {}", e),
    })
}

async fn parse_token(response: Response) -> Result<String, TransportError> {
    let parsed: TokenResponse = decode(response).await?;
    Ok(parsed.token)
}

/// Current time in ms since the epoch, minus `lag`.
pub fn since_now(lag: Duration) -> i64 {
    (chrono::Utc::now() - chrono::Duration::from_std(lag).unwrap_or_default()).timestamp_millis()
}
