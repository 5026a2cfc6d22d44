//! Migration report emission
//!
//! A finished run is rendered either as one JSON line or as a few
//! human-readable lines. Every emitted line can also be appended to a report
//! file, so repeated runs build up a history.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::error::FailureKind;
use crate::summary::{FailureRecord, MigrationStatus, MigrationSummary};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Failure records printed in human mode; the JSON report carries them all.
const HUMAN_FAILURE_LINES: usize = 10;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot serialize migration report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cannot create report directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write report file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write report output: {0}")]
    Output(#[source] io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub schema_version: u32,
    pub status: &'static str,
    pub phase: &'static str,
    pub dry_run: bool,
    pub blocks_total: u64,
    pub blocks_processed: u64,
    pub blocks_skipped: u64,
    pub blocks_failed: u64,
    pub series_seen: u64,
    pub samples_extracted: u64,
    pub samples_sent: u64,
    pub batches_sent: u64,
    pub retries: u64,
    pub permanent_failures: u64,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
    pub failures: Vec<FailureRecord>,
    pub failures_dropped: u64,
    pub elapsed_ms: u64,
}

impl From<&MigrationSummary> for MigrationReport {
    fn from(summary: &MigrationSummary) -> Self {
        let (status, phase) = match summary.status {
            MigrationStatus::Done => ("completed", "execution"),
            MigrationStatus::Failed => ("failed", "enumeration"),
            MigrationStatus::Cancelled => ("cancelled", "execution"),
        };
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            status,
            phase,
            dry_run: summary.dry_run,
            blocks_total: summary.blocks_total,
            blocks_processed: summary.blocks_processed,
            blocks_skipped: summary.blocks_skipped,
            blocks_failed: summary.blocks_failed,
            series_seen: summary.series_seen,
            samples_extracted: summary.samples_extracted,
            samples_sent: summary.samples_sent,
            batches_sent: summary.batches_sent,
            retries: summary.retries,
            permanent_failures: summary.permanent_failures,
            failures_by_kind: summary.failures_by_kind.clone(),
            failures: summary.failures.clone(),
            failures_dropped: summary.failures_dropped,
            elapsed_ms: summary.elapsed_ms,
        }
    }
}

/// Report of a run that could not start or was aborted by a fatal error.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationErrorReport {
    pub schema_version: u32,
    pub status: &'static str,
    pub phase: &'static str,
    pub error_type: &'static str,
    pub error: String,
    pub elapsed_ms: u64,
}

impl MigrationErrorReport {
    pub fn new(
        phase: &'static str,
        error_type: &'static str,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            status: "failed",
            phase,
            error_type,
            error: error.into(),
            elapsed_ms,
        }
    }
}

/// Writes `report` to `out` and appends the same lines to `report_file`.
pub fn emit_report(
    report: &MigrationReport,
    json: bool,
    out: &mut impl Write,
    report_file: Option<&Path>,
) -> Result<(), ReportError> {
    let lines = if json {
        vec![serde_json::to_string(report)?]
    } else {
        human_lines(report)
    };
    for line in &lines {
        writeln!(out, "{line}").map_err(ReportError::Output)?;
        append_report_line(report_file, line)?;
    }
    Ok(())
}

/// Like [`emit_report`] for fatal errors. Human output goes to `err_out`.
pub fn emit_error_report(
    report: &MigrationErrorReport,
    json: bool,
    out: &mut impl Write,
    err_out: &mut impl Write,
    report_file: Option<&Path>,
) -> Result<(), ReportError> {
    let line = if json {
        let encoded = serde_json::to_string(report)?;
        writeln!(out, "{encoded}").map_err(ReportError::Output)?;
        encoded
    } else {
        let line = format!(
            "Migration failed after {}ms: {}",
            report.elapsed_ms, report.error
        );
        writeln!(err_out, "{line}").map_err(ReportError::Output)?;
        line
    };
    append_report_line(report_file, &line)
}

pub fn append_report_line(report_file: Option<&Path>, line: &str) -> Result<(), ReportError> {
    let Some(path) = report_file else {
        return Ok(());
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ReportError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let write_error = |source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_error)?;
    writeln!(file, "{line}").map_err(write_error)
}

fn human_lines(report: &MigrationReport) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Migration {}: {} of {} block(s) processed, {} skipped, {} failed.",
            report.status,
            report.blocks_processed,
            report.blocks_total,
            report.blocks_skipped,
            report.blocks_failed
        ),
        format!(
            "Series: {}, samples extracted: {}, samples sent: {}, batches: {}, retries: {}.",
            report.series_seen,
            report.samples_extracted,
            report.samples_sent,
            report.batches_sent,
            report.retries
        ),
    ];

    if report.permanent_failures > 0 {
        let by_kind = report
            .failures_by_kind
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!(
            "Failures: {} ({by_kind}).",
            report.permanent_failures
        ));
        for failure in report.failures.iter().take(HUMAN_FAILURE_LINES) {
            lines.push(format!("  - {}", describe_failure(failure)));
        }
        let hidden = report.permanent_failures as usize
            - report.failures.len().min(HUMAN_FAILURE_LINES);
        if hidden > 0 {
            lines.push(format!("  ... and {hidden} more"));
        }
    }

    if report.dry_run {
        lines.push("Dry-run complete: no data was written.".to_owned());
    }
    lines.push(format!("Elapsed: {}ms", report.elapsed_ms));
    lines
}

fn describe_failure(failure: &FailureRecord) -> String {
    let mut line = failure.kind.to_string();
    if let Some(block) = &failure.block {
        line.push_str(&format!(" block={block}"));
    }
    if let Some(range) = &failure.block_range {
        line.push_str(&format!(" range={range}"));
    }
    if let Some(series) = &failure.series {
        line.push_str(&format!(" series={series}"));
    }
    if let Some(samples) = failure.batch_samples {
        line.push_str(&format!(" samples={samples}"));
    }
    line.push_str(": ");
    line.push_str(&failure.message);
    line
}
