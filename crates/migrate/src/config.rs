use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::batcher::BatchLimits;
use crate::progress::ProgressError;
use crate::selector::{Selector, SelectorError};
use crate::transport::{ReqwestSender, RetryPolicy, TlsOptions, TransportError};
use crate::types::TimeRange;

pub const DEFAULT_READ_PATH: &str = "data/";
pub const DEFAULT_REMOTE_WRITE_URL: &str = "http://localhost:7201/api/v1/prom/remote/write";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const MAX_RETRY_ATTEMPTS: u32 = 20;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_MAX_BATCH_SAMPLES: usize = 2_000;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;
/// Smallest byte budget that still fits a typical series with one sample.
pub const MIN_MAX_BATCH_BYTES: usize = 1024;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid remote write url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported remote write url scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),
    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("time window start {start} must be before end {end}")]
    EmptyWindow { start: i64, end: i64 },
    #[error("cannot read CA file {}: {source}", path.display())]
    CaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] TransportError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_file: Option<PathBuf>,
}

/// Everything a migration run needs, validated once before any work starts.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub read_path: PathBuf,
    pub remote_write_url: String,
    pub selector: Selector,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub batch: BatchLimits,
    /// Blocks migrated at the same time.
    pub concurrency: usize,
    pub tls: TlsConfig,
    /// Inclusive lower bound of the time window, in milliseconds.
    pub start: Option<i64>,
    /// Exclusive upper bound of the time window, in milliseconds.
    pub end: Option<i64>,
    pub dry_run: bool,
    pub progress_file: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            read_path: PathBuf::from(DEFAULT_READ_PATH),
            remote_write_url: DEFAULT_REMOTE_WRITE_URL.to_owned(),
            selector: Selector::match_all(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryPolicy {
                max_attempts: DEFAULT_RETRY_ATTEMPTS,
                base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
                max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            },
            batch: BatchLimits {
                max_samples: DEFAULT_MAX_BATCH_SAMPLES,
                max_bytes: DEFAULT_MAX_BATCH_BYTES,
            },
            concurrency: DEFAULT_CONCURRENCY,
            tls: TlsConfig::default(),
            start: None,
            end: None,
            dry_run: false,
            progress_file: None,
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote_write_url()?;

        if self.timeout.is_zero() {
            return Err(out_of_range("timeout", "greater than zero", self.timeout.as_secs()));
        }
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.retry.max_attempts) {
            return Err(out_of_range(
                "retry attempts",
                "between 1 and 20",
                self.retry.max_attempts,
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(out_of_range(
                "retry base delay",
                "at most the retry max delay",
                self.retry.base_delay.as_millis(),
            ));
        }
        if self.batch.max_samples == 0 {
            return Err(out_of_range("max batch samples", "at least 1", 0));
        }
        if self.batch.max_bytes < MIN_MAX_BATCH_BYTES {
            return Err(out_of_range(
                "max batch bytes",
                "at least 1024",
                self.batch.max_bytes,
            ));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(out_of_range("concurrency", "between 1 and 64", self.concurrency));
        }
        if let (Some(start), Some(end)) = (self.start, self.end)
            && start >= end
        {
            return Err(ConfigError::EmptyWindow { start, end });
        }
        Ok(())
    }

    pub fn remote_write_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.remote_write_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.remote_write_url.clone(),
            source,
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
    }

    /// The configured time window, if any bound is set.
    pub fn window(&self) -> Option<TimeRange> {
        if self.start.is_none() && self.end.is_none() {
            return None;
        }
        Some(TimeRange::new(
            self.start.unwrap_or(i64::MIN),
            self.end.unwrap_or(i64::MAX),
        ))
    }

    pub fn tls_options(&self) -> Result<TlsOptions, ConfigError> {
        let ca_cert_pem = self
            .tls
            .ca_file
            .as_ref()
            .map(|path| {
                std::fs::read(path).map_err(|source| ConfigError::CaFile {
                    path: path.clone(),
                    source,
                })
            })
            .transpose()?;
        Ok(TlsOptions {
            insecure_skip_verify: self.tls.insecure_skip_verify,
            ca_cert_pem,
        })
    }

    pub fn build_sender(&self) -> Result<ReqwestSender, ConfigError> {
        let sender = ReqwestSender::new(self.remote_write_url()?, self.timeout, &self.tls_options()?)?;
        Ok(sender)
    }
}

fn out_of_range(name: &'static str, expected: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::OutOfRange {
        name,
        expected,
        value: value.to_string(),
    }
}
