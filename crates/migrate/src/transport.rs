//! Remote write transport
//!
//! [`RemoteWriteTransport`] delivers one encoded batch with retries and turns
//! the result into a [`WriteOutcome`]. The HTTP exchange itself sits behind
//! [`HttpSender`] so the retry and classification logic can be driven by
//! scripted responses; [`ReqwestSender`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Certificate, Client};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::codec::{self, EncodedBatch};
use crate::error::FailureKind;

pub const USER_AGENT: &str = concat!("promigrate/", env!("CARGO_PKG_VERSION"));
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";
pub const REMOTE_WRITE_VERSION_HEADER: &str = "X-Prometheus-Remote-Write-Version";
pub const SAMPLES_WRITTEN_HEADER: &str = "X-Prometheus-Remote-Write-Samples-Written";

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid http client configuration: {0}")]
    Client(String),
    #[error("server returned {status}: {body}")]
    Retryable {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("server rejected the batch with {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::Retryable { .. } => true,
            Self::Http(error) => !error.is_builder(),
            Self::Client(_) | Self::Rejected { .. } => false,
        }
    }

    /// HTTP status of the response that caused the error, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Retryable { status, .. } | Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Retryable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn failure_kind(&self) -> FailureKind {
        if self.status().is_some() {
            FailureKind::ServerRejection
        } else {
            FailureKind::Transport
        }
    }
}

/// Raw answer of the remote endpoint, whatever its status.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub samples_written: Option<u64>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// One HTTP POST of an encoded write request.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn post(&self, body: Bytes) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub insecure_skip_verify: bool,
    /// Extra PEM root certificate(s) to trust.
    pub ca_cert_pem: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl ReqwestSender {
    pub fn new(url: Url, timeout: Duration, tls: &TlsOptions) -> Result<Self, TransportError> {
        let mut builder = Client::builder().user_agent(USER_AGENT);

        if tls.insecure_skip_verify {
            warn!(%url, "TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &tls.ca_cert_pem {
            let certificate = Certificate::from_pem(pem)
                .map_err(|e| TransportError::Client(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn post(&self, body: Bytes) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(CONTENT_ENCODING, "snappy")
            .header(REMOTE_WRITE_VERSION_HEADER, REMOTE_WRITE_VERSION)
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let retry_after = header_str(response.headers(), RETRY_AFTER.as_str())
            .and_then(parse_retry_after);
        let samples_written = header_str(response.headers(), SAMPLES_WRITTEN_HEADER)
            .and_then(|value| value.trim().parse().ok());
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        Ok(HttpResponse {
            status,
            retry_after,
            samples_written,
            body,
        })
    }
}

impl ReqwestSender {
    fn map_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Http(error)
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Parses a `Retry-After` value given in seconds. HTTP dates are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per batch, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempts_used`.
    pub fn delay(&self, attempts_used: u32, retry_after: Option<Duration>) -> Duration {
        let multiplier = 2u32.saturating_pow(attempts_used.saturating_sub(1));
        let backoff = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX);
        let delay = retry_after.map_or(backoff, |hint| backoff.max(hint));
        delay.min(self.max_delay)
    }
}

/// Result of transmitting one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Delivered {
        samples: usize,
    },
    RetriedAndDelivered {
        samples: usize,
        retries: u32,
    },
    FailedPermanently {
        samples: usize,
        retries: u32,
        kind: FailureKind,
        errors: Vec<String>,
    },
    /// The run was cancelled while the batch was in flight.
    Cancelled {
        samples: usize,
    },
}

impl WriteOutcome {
    pub fn samples(&self) -> usize {
        match self {
            Self::Delivered { samples }
            | Self::RetriedAndDelivered { samples, .. }
            | Self::FailedPermanently { samples, .. }
            | Self::Cancelled { samples } => *samples,
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            Self::RetriedAndDelivered { retries, .. } | Self::FailedPermanently { retries, .. } => {
                *retries
            }
            Self::Delivered { .. } | Self::Cancelled { .. } => 0,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::RetriedAndDelivered { .. })
    }
}

pub struct RemoteWriteTransport<H> {
    sender: H,
    retry: RetryPolicy,
}

impl<H: HttpSender> RemoteWriteTransport<H> {
    pub fn new(sender: H, retry: RetryPolicy) -> Self {
        Self {
            sender,
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                ..retry
            },
        }
    }

    pub fn sender(&self) -> &H {
        &self.sender
    }

    /// Sends `batch`, retrying transient failures with exponential backoff.
    ///
    /// Cancellation interrupts both an in-flight attempt and a backoff sleep.
    pub async fn send(&self, batch: &EncodedBatch, cancel: &CancellationToken) -> WriteOutcome {
        let samples = batch.samples;
        let mut errors = Vec::new();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WriteOutcome::Cancelled { samples },
                result = self.attempt(batch.body.clone()) => result,
            };

            let error = match result {
                Ok(response) => {
                    acknowledge(&response, samples);
                    return if attempts == 1 {
                        WriteOutcome::Delivered { samples }
                    } else {
                        WriteOutcome::RetriedAndDelivered {
                            samples,
                            retries: attempts - 1,
                        }
                    };
                }
                Err(error) => error,
            };

            errors.push(format!("attempt {attempts}: {error}"));
            if !error.is_retryable() || attempts >= self.retry.max_attempts {
                warn!(
                    samples,
                    attempts,
                    error = %error,
                    "batch failed permanently"
                );
                return WriteOutcome::FailedPermanently {
                    samples,
                    retries: attempts - 1,
                    kind: error.failure_kind(),
                    errors,
                };
            }

            let delay = self.retry.delay(attempts, error.retry_after());
            debug!(
                samples,
                attempt = attempts,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying batch"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WriteOutcome::Cancelled { samples },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, body: Bytes) -> Result<HttpResponse, TransportError> {
        classify(self.sender.post(body).await?)
    }
}

fn classify(response: HttpResponse) -> Result<HttpResponse, TransportError> {
    match response.status {
        200..=299 => Ok(response),
        429 | 500..=599 => Err(TransportError::Retryable {
            status: response.status,
            body: truncate_body(&response.body),
            retry_after: response.retry_after,
        }),
        status => Err(TransportError::Rejected {
            status,
            body: truncate_body(&response.body),
        }),
    }
}

fn acknowledge(response: &HttpResponse, samples: usize) {
    if let Some(written) = response.samples_written {
        debug!(samples, samples_written = written, "remote reported samples written");
    }
    if response.body.is_empty() {
        return;
    }
    match codec::decode_ack(&response.body) {
        Ok(ack) => debug!(
            samples,
            acknowledged_series = ack.series.len(),
            acknowledged_samples = ack.sample_count(),
            "decoded write acknowledgement"
        ),
        Err(error) => warn!(samples, %error, "cannot decode write acknowledgement"),
    }
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.chars().count() <= MAX_ERROR_BODY_CHARS {
        return text.to_owned();
    }
    let mut truncated: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
    truncated.push_str("...");
    truncated
}
