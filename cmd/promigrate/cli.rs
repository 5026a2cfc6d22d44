use std::{
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{ArgAction, Parser as ClapParser};
use eyre::{Result, WrapErr};
use promigrate::{
    MigrationConfig, MigrationStatus, Migrator,
    batcher::BatchLimits,
    config::{
        ConfigError, DEFAULT_CONCURRENCY, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_SAMPLES,
        DEFAULT_READ_PATH, DEFAULT_REMOTE_WRITE_URL, DEFAULT_RETRY_ATTEMPTS,
        DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_TIMEOUT_SECS, TlsConfig,
    },
    report::{MigrationErrorReport, MigrationReport, emit_error_report, emit_report},
    selector::{MATCH_ALL_SELECTOR, Selector, parse_prefix_matcher},
    store::{StoreError, block_dir::BlockDirStore},
    transport::RetryPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

use crate::initializers::cancel_on_ctrl_c;

/// Exit code for invalid configuration, matching clap's usage errors.
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_FATAL_ERROR: i32 = 1;

const MAX_RETRY_DELAY_MS: u64 = 600_000;
const MAX_TIMEOUT_SECS: u64 = 3_600;
const MAX_BATCH_SAMPLES: u64 = 1_000_000;
const MAX_BATCH_BYTES: u64 = 64 * 1024 * 1024;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "promigrate",
    author,
    version,
    about = "Migrate samples from a promigrate block directory to a Prometheus remote write endpoint",
    long_about = "Migrate samples from a promigrate block directory to a Prometheus remote write endpoint.\n\nBlocks are sub-directories holding meta.json, index.json and samples.rdat. Native Prometheus TSDB chunk and index files are not read."
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "read.storage.path",
        default_value = DEFAULT_READ_PATH,
        value_name = "PATH",
        env = "PROMIGRATE_READ_PATH",
        help = "Block directory to migrate (meta.json, index.json and samples.rdat per block).",
        help_heading = "Source options"
    )]
    pub read_path: PathBuf,
    #[arg(
        long = "selector",
        default_value = MATCH_ALL_SELECTOR,
        value_name = "SELECTOR",
        help = "PromQL series selector, e.g. 'node_load1{job=\"node\"}'.",
        long_help = "PromQL instant vector selector using =, !=, =~ and !~ matchers. Braces may be omitted for a plain matcher list.",
        help_heading = "Source options"
    )]
    pub selector: String,
    #[arg(
        long = "selector.prefix",
        value_name = "NAME=PREFIX",
        action = ArgAction::Append,
        help = "Also require label NAME to start with PREFIX. Repeatable.",
        help_heading = "Source options"
    )]
    pub selector_prefixes: Vec<String>,
    #[arg(
        long = "start",
        value_name = "UNIX_MS",
        allow_negative_numbers = true,
        help = "Only migrate samples at or after this timestamp.",
        help_heading = "Source options"
    )]
    pub start: Option<i64>,
    #[arg(
        long = "end",
        value_name = "UNIX_MS",
        allow_negative_numbers = true,
        help = "Only migrate samples before this timestamp.",
        help_heading = "Source options"
    )]
    pub end: Option<i64>,

    #[arg(
        long = "write.remote.url",
        default_value = DEFAULT_REMOTE_WRITE_URL,
        value_name = "URL",
        env = "PROMIGRATE_REMOTE_WRITE_URL",
        help = "Remote write endpoint receiving the samples.",
        help_heading = "Remote write options"
    )]
    pub remote_write_url: String,
    #[arg(
        long = "timeout-secs",
        default_value_t = DEFAULT_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_SECS),
        value_name = "SECONDS",
        help = "Per-request timeout (1-3600).",
        help_heading = "Remote write options"
    )]
    pub timeout_secs: u64,
    #[arg(
        long = "retry-attempts",
        default_value_t = DEFAULT_RETRY_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..=20),
        help = "Attempts per batch, the first one included (1-20).",
        help_heading = "Remote write options"
    )]
    pub retry_attempts: u32,
    #[arg(
        long = "retry-base-delay-ms",
        default_value_t = DEFAULT_RETRY_BASE_DELAY_MS,
        value_parser = clap::value_parser!(u64).range(0..=MAX_RETRY_DELAY_MS),
        help = "Initial retry backoff delay in milliseconds.",
        help_heading = "Remote write options"
    )]
    pub retry_base_delay_ms: u64,
    #[arg(
        long = "retry-max-delay-ms",
        default_value_t = DEFAULT_RETRY_MAX_DELAY_MS,
        value_parser = clap::value_parser!(u64).range(0..=MAX_RETRY_DELAY_MS),
        help = "Upper bound for a single retry delay in milliseconds.",
        help_heading = "Remote write options"
    )]
    pub retry_max_delay_ms: u64,
    #[arg(
        long = "max-batch-samples",
        default_value_t = DEFAULT_MAX_BATCH_SAMPLES as u64,
        value_parser = clap::value_parser!(u64).range(1..=MAX_BATCH_SAMPLES),
        help = "Maximum samples per request.",
        help_heading = "Remote write options"
    )]
    pub max_batch_samples: u64,
    #[arg(
        long = "max-batch-bytes",
        default_value_t = DEFAULT_MAX_BATCH_BYTES as u64,
        value_parser = clap::value_parser!(u64).range(1024..=MAX_BATCH_BYTES),
        help = "Maximum uncompressed request size in bytes.",
        help_heading = "Remote write options"
    )]
    pub max_batch_bytes: u64,
    #[arg(
        long = "concurrency",
        default_value_t = DEFAULT_CONCURRENCY as u64,
        value_parser = clap::value_parser!(u64).range(1..=64),
        help = "Blocks migrated at the same time (1-64).",
        help_heading = "Remote write options"
    )]
    pub concurrency: u64,
    #[arg(
        long = "tls.insecure-skip-verify",
        default_value_t = false,
        help = "Accept invalid server certificates.",
        help_heading = "Remote write options"
    )]
    pub tls_insecure_skip_verify: bool,
    #[arg(
        long = "tls.ca-file",
        value_name = "PEM_FILE",
        help = "Additional CA certificate(s) to trust.",
        help_heading = "Remote write options"
    )]
    pub tls_ca_file: Option<PathBuf>,

    #[arg(
        long = "dry-run",
        default_value_t = false,
        help = "Read and batch everything without sending.",
        help_heading = "Run options"
    )]
    pub dry_run: bool,
    #[arg(
        long = "progress-file",
        value_name = "PATH",
        help = "Checkpoint of completed blocks, skipped on the next run.",
        help_heading = "Run options"
    )]
    pub progress_file: Option<PathBuf>,
    #[arg(
        long = "json",
        default_value_t = false,
        help = "Emit the report as one JSON line.",
        help_heading = "Run options"
    )]
    pub json: bool,
    #[arg(
        long = "report-file",
        value_name = "PATH",
        help = "Append every emitted report line to this file.",
        help_heading = "Run options"
    )]
    pub report_file: Option<PathBuf>,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "PROMIGRATE_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Run options"
    )]
    pub log_level: Level,
}

impl Options {
    fn selector(&self) -> Result<Selector, ConfigError> {
        let mut selector: Selector = self.selector.parse()?;
        for spec in &self.selector_prefixes {
            selector = selector.with_matcher(parse_prefix_matcher(spec)?);
        }
        Ok(selector)
    }

    pub fn to_config(&self) -> Result<MigrationConfig, ConfigError> {
        let config = MigrationConfig {
            read_path: self.read_path.clone(),
            remote_write_url: self.remote_write_url.clone(),
            selector: self.selector()?,
            timeout: Duration::from_secs(self.timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            batch: BatchLimits {
                max_samples: saturating_usize(self.max_batch_samples),
                max_bytes: saturating_usize(self.max_batch_bytes),
            },
            concurrency: saturating_usize(self.concurrency),
            tls: TlsConfig {
                insecure_skip_verify: self.tls_insecure_skip_verify,
                ca_file: self.tls_ca_file.clone(),
            },
            start: self.start,
            end: self.end,
            dry_run: self.dry_run,
            progress_file: self.progress_file.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

fn saturating_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Runs the migration described by `opts` and returns the process exit code.
pub async fn run(opts: &Options, started_at: Instant) -> i32 {
    match migrate(opts).await {
        Ok(status) => status.exit_code(),
        Err(err) => {
            let (phase, error_type, code) = classify_error(&err);
            error!(phase, error_type, "{err:#}");
            let report = MigrationErrorReport::new(
                phase,
                error_type,
                format!("{err:#}"),
                elapsed_ms(started_at),
            );
            if let Err(emit_err) = emit_error_report(
                &report,
                opts.json,
                &mut io::stdout().lock(),
                &mut io::stderr().lock(),
                opts.report_file.as_deref(),
            ) {
                error!(error = %emit_err, "cannot emit error report");
            }
            code
        }
    }
}

async fn migrate(opts: &Options) -> Result<MigrationStatus> {
    let config = opts.to_config()?;
    let store = BlockDirStore::open(&config.read_path).wrap_err("cannot open block store")?;
    let mut migrator = Migrator::from_config(&config, Arc::new(store))?;

    info!(
        read_path = %config.read_path.display(),
        remote_write_url = %config.remote_write_url,
        selector = %config.selector,
        dry_run = config.dry_run,
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let summary = migrator.run(&cancel).await;
    emit_report(
        &MigrationReport::from(&summary),
        opts.json,
        &mut io::stdout().lock(),
        opts.report_file.as_deref(),
    )
    .wrap_err("cannot emit migration report")?;

    Ok(summary.status)
}

/// Maps a fatal error to `(phase, error_type, exit code)`.
fn classify_error(err: &eyre::Report) -> (&'static str, &'static str, i32) {
    if err.downcast_ref::<ConfigError>().is_some() {
        ("configuration", "config", EXIT_CONFIG_ERROR)
    } else if err.downcast_ref::<StoreError>().is_some() {
        ("enumeration", "storage", EXIT_FATAL_ERROR)
    } else {
        ("execution", "fatal", EXIT_FATAL_ERROR)
    }
}

fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}
