//! Run accounting: failure records, per-block statistics and the final
//! [`MigrationSummary`].

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::FailureKind;
use crate::types::{Block, Labels, TimeRange};

/// Failure records kept in the summary; later failures are only counted.
pub const MAX_FAILURE_RECORDS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Done,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::Failed => 1,
            Self::Cancelled => 130,
        }
    }
}

/// A contained failure with the context it happened in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_range: Option<TimeRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<Labels>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_samples: Option<usize>,
    pub message: String,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            block: None,
            block_range: None,
            series: None,
            batch_samples: None,
            message: message.into(),
        }
    }

    pub fn for_block(kind: FailureKind, block: &Block, message: impl Into<String>) -> Self {
        Self {
            block: Some(block.id.clone()),
            block_range: Some(block.range()),
            ..Self::new(kind, message)
        }
    }

    pub fn with_block_id(mut self, id: impl Into<String>) -> Self {
        self.block = Some(id.into());
        self
    }

    pub fn with_series(mut self, labels: &Labels) -> Self {
        self.series = Some(labels.clone());
        self
    }

    pub fn with_batch_samples(mut self, samples: usize) -> Self {
        self.batch_samples = Some(samples);
        self
    }
}

/// Statistics gathered while migrating one block.
#[derive(Debug, Default)]
pub struct BlockStats {
    pub series_seen: u64,
    pub samples_extracted: u64,
    pub samples_sent: u64,
    pub batches_sent: u64,
    pub retries: u64,
    pub failures: Vec<FailureRecord>,
    /// The block could not be opened or queried.
    pub aborted: bool,
    pub cancelled: bool,
}

impl BlockStats {
    /// Whether the whole block was delivered without any contained failure.
    pub fn is_complete(&self) -> bool {
        !self.aborted && !self.cancelled && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub status: MigrationStatus,
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
    /// Every contained failure, recorded or not.
    pub permanent_failures: u64,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
    pub failures: Vec<FailureRecord>,
    pub failures_dropped: u64,
    pub elapsed_ms: u64,
}

impl MigrationSummary {
    pub fn new(dry_run: bool) -> Self {
        Self {
            status: MigrationStatus::Done,
            dry_run,
            blocks_total: 0,
            blocks_processed: 0,
            blocks_skipped: 0,
            blocks_failed: 0,
            series_seen: 0,
            samples_extracted: 0,
            samples_sent: 0,
            batches_sent: 0,
            retries: 0,
            permanent_failures: 0,
            failures_by_kind: BTreeMap::new(),
            failures: Vec::new(),
            failures_dropped: 0,
            elapsed_ms: 0,
        }
    }

    pub fn record_failure(&mut self, record: FailureRecord) {
        self.permanent_failures += 1;
        *self.failures_by_kind.entry(record.kind).or_default() += 1;
        if self.failures.len() < MAX_FAILURE_RECORDS {
            self.failures.push(record);
        } else {
            self.failures_dropped += 1;
        }
    }

    pub fn merge_block(&mut self, stats: BlockStats) {
        self.series_seen += stats.series_seen;
        self.samples_extracted += stats.samples_extracted;
        self.samples_sent += stats.samples_sent;
        self.batches_sent += stats.batches_sent;
        self.retries += stats.retries;
        for failure in stats.failures {
            self.record_failure(failure);
        }
    }

    pub fn failures_of(&self, kind: FailureKind) -> u64 {
        self.failures_by_kind.get(&kind).copied().unwrap_or(0)
    }
}
