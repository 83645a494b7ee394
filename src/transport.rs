//! Resilient HTTP transport
//!
//! Every request the client makes to the coordinator goes through here:
//! - The bearer token is read from the shared [`TokenHandle`] on each attempt,
//!   so a refresh is picked up by the next request without rebuilding clients
//! - Responses are classified into success, transient (502, network errors),
//!   payment-required (402) and permanent (any other status >= 300)
//! - Transient failures are retried with jittered exponential backoff
//! - A cancellation token aborts the in-flight request and any pending sleep

use crate::token::TokenHandle;
use rand::Rng;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// First backoff interval
const INITIAL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound for a single backoff interval
const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Growth factor between consecutive intervals
const MULTIPLIER: f64 = 1.5;

/// Relative jitter applied to every interval (0.5 = +/-50%)
const RANDOMIZATION: f64 = 0.5;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed with status {status}: {body}")]
    Permanent { status: u16, body: String },
    #[error("payment required: {body}")]
    PaymentRequired { body: String },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("request canceled")]
    Canceled,
    #[error("failed to build request: {0}")]
    Build(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// How a response status is treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Transient,
    PaymentRequired,
    Permanent,
}

/// Classify a response status code.
pub fn classify(status: StatusCode) -> Classification {
    match status.as_u16() {
        200..=299 => Classification::Success,
        502 => Classification::Transient,
        402 => Classification::PaymentRequired,
        _ => Classification::Permanent,
    }
}

/// Retry policy for a single call
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// `None` retries until success, a permanent error or cancellation
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            initial_interval: INITIAL_INTERVAL,
            max_interval: MAX_INTERVAL,
            max_retries: Some(max_retries),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            initial_interval: INITIAL_INTERVAL,
            max_interval: MAX_INTERVAL,
            max_retries: None,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial_interval,
            retries: 0,
        }
    }
}

/// Jittered exponential backoff state
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    retries: u32,
}

impl Backoff {
    /// Next delay to wait, or `None` when the retry budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.retries >= max {
                return None;
            }
        }
        self.retries += 1;

        let base = self.current.as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-RANDOMIZATION..=RANDOMIZATION);
        let delay = Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0));

        let next = (base * MULTIPLIER).min(self.policy.max_interval.as_secs_f64());
        self.current = Duration::from_secs_f64(next);

        Some(delay)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Sleep for the next delay. Returns the error to surface when the budget
    /// is exhausted or the token fires first.
    pub async fn wait(
        &mut self,
        cancel: &CancellationToken,
        last: TransportError,
    ) -> Result<(), TransportError> {
        let Some(delay) = self.next_delay() else {
            return Err(last);
        };
        debug!("Retrying in {:?} after: {}", delay, last);
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Canceled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Bearer-authenticated HTTP client with a retry policy
#[derive(Clone)]
pub struct Transport {
    client: Client,
    token: TokenHandle,
}

impl Transport {
    pub fn new(token: TokenHandle) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, token }
    }

    pub fn token(&self) -> &TokenHandle {
        &self.token
    }

    /// Send a single attempt and classify the outcome.
    pub async fn send_once<F>(
        &self,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<Response, TransportError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        if cancel.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        let mut request = build(&self.client);
        let token = self.token.get();
        if !token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Canceled),
            response = request.send() => response,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_builder() => return Err(TransportError::Build(e.to_string())),
            Err(e) => return Err(TransportError::Transient(e.to_string())),
        };

        match classify(response.status()) {
            Classification::Success => Ok(response),
            Classification::Transient => Err(TransportError::Transient(format!(
                "{} from {}",
                response.status(),
                response.url()
            ))),
            Classification::PaymentRequired => Err(TransportError::PaymentRequired {
                body: response.text().await.unwrap_or_default(),
            }),
            Classification::Permanent => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Err(TransportError::Permanent { status, body })
            }
        }
    }

    /// Send with retries. `build` is invoked once per attempt, so streaming
    /// bodies are rebuilt from scratch on every retry.
    pub async fn send<F>(
        &self,
        cancel: &CancellationToken,
        policy: RetryPolicy,
        build: F,
    ) -> Result<Response, TransportError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut backoff = policy.backoff();
        loop {
            match self.send_once(cancel, &build).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => backoff.wait(cancel, e).await?,
                Err(e) => return Err(e),
            }
        }
    }
}
