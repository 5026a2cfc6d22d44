//! Migration orchestrator
//!
//! Enumerates the blocks of the store and migrates up to `concurrency` of
//! them at a time. Each block gets one blocking extraction worker that runs
//! the extractor and the batcher and feeds a small bounded channel; an async
//! loop drains that channel, encodes every batch and hands it to the
//! transport one at a time. Per-block statistics flow back to the run loop,
//! which is the only place the summary and the progress checkpoint are
//! updated.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{BatchLimits, Batcher};
use crate::codec;
use crate::config::{ConfigError, MigrationConfig};
use crate::error::FailureKind;
use crate::extractor::Extractor;
use crate::progress::ProgressLog;
use crate::store::BlockStore;
use crate::summary::{BlockStats, FailureRecord, MigrationStatus, MigrationSummary};
use crate::transport::{HttpSender, RemoteWriteTransport, ReqwestSender, WriteOutcome};
use crate::types::{Batch, Block, TimeRange};

/// Batches buffered between an extraction worker and its sender loop.
const BATCH_CHANNEL_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    Enumerating,
    /// Blocks are being extracted, batched and sent.
    Migrating,
    /// No new work is scheduled; in-flight blocks are winding down.
    Draining,
    Done,
    Failed,
    Cancelled,
}

pub struct Migrator<H = ReqwestSender> {
    store: Arc<dyn BlockStore>,
    extractor: Extractor,
    transport: RemoteWriteTransport<H>,
    limits: BatchLimits,
    concurrency: usize,
    window: Option<TimeRange>,
    dry_run: bool,
    progress: Option<ProgressLog>,
    state: MigrationState,
}

impl Migrator<ReqwestSender> {
    /// Builds a migrator that posts to the configured remote write URL.
    pub fn from_config(
        config: &MigrationConfig,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let sender = config.build_sender()?;
        Self::with_sender(config, store, sender)
    }
}

impl<H: HttpSender> Migrator<H> {
    pub fn with_sender(
        config: &MigrationConfig,
        store: Arc<dyn BlockStore>,
        sender: H,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let progress = config
            .progress_file
            .as_deref()
            .map(ProgressLog::load)
            .transpose()?;

        Ok(Self {
            extractor: Extractor::new(Arc::clone(&store), config.selector.clone()),
            store,
            transport: RemoteWriteTransport::new(sender, config.retry),
            limits: config.batch,
            concurrency: config.concurrency,
            window: config.window(),
            dry_run: config.dry_run,
            progress,
            state: MigrationState::Idle,
        })
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn transport(&self) -> &RemoteWriteTransport<H> {
        &self.transport
    }

    /// Runs the migration to completion, failure or cancellation.
    ///
    /// Only a failure to enumerate the store fails the run; everything else
    /// is contained and reported in the summary.
    pub async fn run(&mut self, cancel: &CancellationToken) -> MigrationSummary {
        let started_at = Instant::now();
        let mut summary = MigrationSummary::new(self.dry_run);

        transition(&mut self.state, MigrationState::Enumerating);
        let store = Arc::clone(&self.store);
        let listing = match tokio::task::spawn_blocking(move || store.list_blocks()).await {
            Ok(Ok(listing)) => listing,
            Ok(Err(err)) => {
                error!(error = %err, "cannot enumerate blocks");
                summary.record_failure(FailureRecord::new(err.kind(), err.to_string()));
                return finish(&mut self.state, summary, MigrationStatus::Failed, started_at);
            }
            Err(err) => {
                error!(error = %err, "block enumeration task failed");
                summary.record_failure(FailureRecord::new(FailureKind::Storage, err.to_string()));
                return finish(&mut self.state, summary, MigrationStatus::Failed, started_at);
            }
        };

        summary.blocks_total = (listing.blocks.len() + listing.unreadable.len()) as u64;
        for (entry, err) in listing.unreadable {
            warn!(block = %entry, error = %err, "skipping unreadable block");
            summary.blocks_failed += 1;
            summary.record_failure(FailureRecord::new(err.kind(), err.to_string()).with_block_id(entry));
        }

        let mut pending = Vec::with_capacity(listing.blocks.len());
        for block in listing.blocks {
            let range = match self.window {
                Some(window) => block.range().intersect(&window),
                None => block.range(),
            };
            if self.window.is_some() && range.is_empty() {
                debug!(block = %block, "block outside the time window, skipping");
                summary.blocks_skipped += 1;
                continue;
            }
            if self.progress.as_ref().is_some_and(|progress| {
                progress.is_completed(&block, range, self.extractor.selector())
            }) {
                info!(block = %block.id, range = %range, "block already migrated, skipping");
                summary.blocks_skipped += 1;
                continue;
            }
            pending.push((block, range));
        }

        info!(
            blocks = pending.len(),
            skipped = summary.blocks_skipped,
            concurrency = self.concurrency,
            dry_run = self.dry_run,
            "starting migration"
        );
        transition(&mut self.state, MigrationState::Migrating);

        let context = BlockContext {
            extractor: &self.extractor,
            transport: &self.transport,
            limits: self.limits,
            dry_run: self.dry_run,
            cancel,
        };
        let mut results = futures::stream::iter(pending)
            .map(|(block, range)| migrate_block(&context, block, range))
            .buffer_unordered(self.concurrency);

        while let Some((block, range, stats)) = results.next().await {
            if stats.cancelled && self.state == MigrationState::Migrating {
                transition(&mut self.state, MigrationState::Draining);
            }

            if stats.aborted {
                summary.blocks_failed += 1;
            } else if !stats.cancelled {
                summary.blocks_processed += 1;
            }

            if stats.is_complete()
                && !self.dry_run
                && let Some(progress) = self.progress.as_mut()
                && let Err(err) = progress.record(&block, range, self.extractor.selector())
            {
                warn!(block = %block.id, error = %err, "cannot record block progress");
            }
            summary.merge_block(stats);
        }
        drop(results);

        let status = if cancel.is_cancelled() {
            MigrationStatus::Cancelled
        } else {
            MigrationStatus::Done
        };
        if self.state == MigrationState::Migrating {
            transition(&mut self.state, MigrationState::Draining);
        }
        finish(&mut self.state, summary, status, started_at)
    }
}

fn transition(state: &mut MigrationState, next: MigrationState) {
    debug!(from = ?*state, to = ?next, "migration state change");
    *state = next;
}

fn finish(
    state: &mut MigrationState,
    mut summary: MigrationSummary,
    status: MigrationStatus,
    started_at: Instant,
) -> MigrationSummary {
    transition(
        state,
        match status {
            MigrationStatus::Done => MigrationState::Done,
            MigrationStatus::Failed => MigrationState::Failed,
            MigrationStatus::Cancelled => MigrationState::Cancelled,
        },
    );
    summary.status = status;
    summary.elapsed_ms = started_at.elapsed().as_millis() as u64;
    info!(
        status = ?status,
        blocks_processed = summary.blocks_processed,
        series = summary.series_seen,
        samples_extracted = summary.samples_extracted,
        samples_sent = summary.samples_sent,
        batches = summary.batches_sent,
        retries = summary.retries,
        failures = summary.permanent_failures,
        elapsed_ms = summary.elapsed_ms,
        "migration finished"
    );
    summary
}

struct BlockContext<'a, H> {
    extractor: &'a Extractor,
    transport: &'a RemoteWriteTransport<H>,
    limits: BatchLimits,
    dry_run: bool,
    cancel: &'a CancellationToken,
}

async fn migrate_block<H: HttpSender>(
    ctx: &BlockContext<'_, H>,
    block: Block,
    range: TimeRange,
) -> (Block, TimeRange, BlockStats) {
    let mut stats = BlockStats::default();
    if ctx.cancel.is_cancelled() {
        stats.cancelled = true;
        return (block, range, stats);
    }
    info!(block = %block.id, range = %range, "migrating block");

    let (tx, mut rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
    let worker = {
        let extractor = ctx.extractor.clone();
        let block = block.clone();
        let limits = ctx.limits;
        let cancel = ctx.cancel.clone();
        tokio::task::spawn_blocking(move || {
            extract_block(&extractor, &block, range, limits, &cancel, &tx)
        })
    };

    while let Some(batch) = rx.recv().await {
        if !send_batch(ctx, &block, batch, &mut stats).await {
            stats.cancelled = true;
            break;
        }
    }
    // Stops the worker at its next send if we left the loop early.
    drop(rx);

    match worker.await {
        Ok(extracted) => {
            stats.series_seen += extracted.series_seen;
            stats.samples_extracted += extracted.samples_extracted;
            stats.aborted |= extracted.aborted;
            stats.cancelled |= extracted.cancelled;
            stats.failures.extend(extracted.failures);
        }
        Err(err) => {
            error!(block = %block.id, error = %err, "extraction worker failed");
            stats.failures.push(FailureRecord::for_block(
                FailureKind::Iteration,
                &block,
                format!("extraction worker failed: {err}"),
            ));
        }
    }

    info!(
        block = %block.id,
        series = stats.series_seen,
        samples = stats.samples_extracted,
        samples_sent = stats.samples_sent,
        batches = stats.batches_sent,
        failures = stats.failures.len(),
        cancelled = stats.cancelled,
        "block finished"
    );
    (block, range, stats)
}

/// Encodes and sends one batch. Returns `false` when the run was cancelled.
async fn send_batch<H: HttpSender>(
    ctx: &BlockContext<'_, H>,
    block: &Block,
    batch: Batch,
    stats: &mut BlockStats,
) -> bool {
    let samples = batch.sample_count();
    let failure = |kind, message: String| {
        let record = FailureRecord::for_block(kind, block, message).with_batch_samples(samples);
        match batch.series.as_slice() {
            [only] => record.with_series(&only.labels),
            _ => record,
        }
    };

    let encoded = match codec::encode(&batch) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(block = %block.id, samples, error = %err, "cannot encode batch");
            stats.failures.push(failure(FailureKind::Codec, err.to_string()));
            return true;
        }
    };

    if ctx.dry_run {
        debug!(
            block = %block.id,
            series = encoded.series,
            samples,
            bytes = encoded.body.len(),
            "dry run, batch not sent"
        );
        stats.batches_sent += 1;
        return true;
    }

    let outcome = ctx.transport.send(&encoded, ctx.cancel).await;
    stats.retries += u64::from(outcome.retries());
    match outcome {
        WriteOutcome::Delivered { .. } | WriteOutcome::RetriedAndDelivered { .. } => {
            stats.batches_sent += 1;
            stats.samples_sent += samples as u64;
            true
        }
        WriteOutcome::FailedPermanently { kind, errors, .. } => {
            warn!(
                block = %block.id,
                samples,
                kind = %kind,
                attempts = errors.len(),
                "batch dropped after permanent failure"
            );
            stats.failures.push(failure(kind, errors.join("; ")));
            true
        }
        WriteOutcome::Cancelled { .. } => false,
    }
}

/// Statistics of one extraction worker.
#[derive(Debug, Default)]
struct Extracted {
    series_seen: u64,
    samples_extracted: u64,
    failures: Vec<FailureRecord>,
    aborted: bool,
    cancelled: bool,
}

/// Walks the selected series of `block` and sends full batches to `tx`.
///
/// Runs on a blocking thread. Stops between series on cancellation and as
/// soon as the receiving side is gone.
fn extract_block(
    extractor: &Extractor,
    block: &Block,
    range: TimeRange,
    limits: BatchLimits,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Batch>,
) -> Extracted {
    let mut out = Extracted::default();

    let series_set = match extractor.open(block, range) {
        Ok(series_set) => series_set,
        Err(err) => {
            warn!(block = %block.id, kind = %err.kind(), error = %err, "skipping block");
            out.aborted = true;
            out.failures
                .push(FailureRecord::for_block(err.kind(), block, err.to_string()));
            return out;
        }
    };

    let mut batcher = Batcher::new(limits);
    for next in series_set {
        if cancel.is_cancelled() {
            out.cancelled = true;
            return out;
        }
        let series = match next {
            Ok(series) => series,
            Err(err) => {
                warn!(block = %block.id, error = %err, "cannot read next series");
                out.failures
                    .push(FailureRecord::for_block(err.kind(), block, err.to_string()));
                continue;
            }
        };

        let mut seen = false;
        for sample in series.samples {
            match sample {
                Ok(sample) => {
                    if !seen {
                        seen = true;
                        out.series_seen += 1;
                    }
                    out.samples_extracted += 1;
                    if let Some(batch) = batcher.push(&series.labels, sample)
                        && tx.blocking_send(batch).is_err()
                    {
                        out.cancelled = true;
                        return out;
                    }
                }
                Err(err) => {
                    warn!(
                        block = %block.id,
                        series = %series.labels,
                        error = %err,
                        "abandoning series after read failure"
                    );
                    out.failures.push(
                        FailureRecord::for_block(err.kind(), block, err.to_string())
                            .with_series(&series.labels),
                    );
                    break;
                }
            }
        }
    }

    if let Some(batch) = batcher.finish()
        && tx.blocking_send(batch).is_err()
    {
        out.cancelled = true;
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::selector::Selector;
    use crate::store::memory::InMemoryStore;
    use crate::store::{BlockListing, Querier, SampleIter, Series, SeriesSet, StoreError};
    use crate::transport::testing::{HangingSender, ScriptedSender, SlowSender, fast_retry};
    use crate::types::{Labels, Sample};

    /// Counts every sample the pipeline pulls out of the wrapped store.
    struct CountingStore {
        inner: InMemoryStore,
        pulled: Arc<AtomicUsize>,
    }

    struct CountingQuerier {
        inner: Box<dyn Querier>,
        pulled: Arc<AtomicUsize>,
    }

    struct CountingSeries {
        inner: Box<dyn Series>,
        pulled: Arc<AtomicUsize>,
    }

    impl BlockStore for CountingStore {
        fn list_blocks(&self) -> Result<BlockListing, StoreError> {
            self.inner.list_blocks()
        }

        fn open_query(&self, block: &Block, range: TimeRange) -> Result<Box<dyn Querier>, StoreError> {
            Ok(Box::new(CountingQuerier {
                inner: self.inner.open_query(block, range)?,
                pulled: Arc::clone(&self.pulled),
            }))
        }
    }

    impl Querier for CountingQuerier {
        fn select(&self, selector: &Selector) -> Result<SeriesSet, StoreError> {
            let pulled = Arc::clone(&self.pulled);
            Ok(Box::new(self.inner.select(selector)?.map(move |series| {
                series.map(|inner| {
                    Box::new(CountingSeries {
                        inner,
                        pulled: Arc::clone(&pulled),
                    }) as Box<dyn Series>
                })
            })))
        }
    }

    impl Series for CountingSeries {
        fn labels(&self) -> &Labels {
            self.inner.labels()
        }

        fn samples(&self) -> Result<SampleIter, StoreError> {
            let pulled = Arc::clone(&self.pulled);
            Ok(Box::new(self.inner.samples()?.inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })))
        }
    }

    fn labels(name: &str) -> Labels {
        Labels::new([("__name__", name), ("job", "node")]).unwrap()
    }

    fn config() -> MigrationConfig {
        MigrationConfig {
            retry: fast_retry(3),
            ..Default::default()
        }
    }

    fn three_series_block(store: InMemoryStore, id: &str) -> InMemoryStore {
        store
            .with_block(id, TimeRange::new(1000, 5000))
            .with_series(
                labels("a"),
                vec![Sample::new(1000, 1.0), Sample::new(2000, 2.0), Sample::new(5000, 0.0)],
            )
            .with_series(
                labels("b"),
                vec![Sample::new(500, 0.0), Sample::new(1500, 1.0), Sample::new(2500, 2.0)],
            )
            .with_series(
                labels("c"),
                vec![Sample::new(3000, 3.0), Sample::new(4999, 4.0), Sample::new(9000, 0.0)],
            )
    }

    fn decode_all(sender: &ScriptedSender) -> Vec<Batch> {
        sender
            .bodies
            .lock()
            .unwrap()
            .iter()
            .map(|body| codec::decode_write_request(body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn migrates_in_range_samples_of_every_series() {
        let store = Arc::new(three_series_block(InMemoryStore::new(), "b1"));
        let mut migrator =
            Migrator::with_sender(&config(), store, ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;

        assert_eq!(summary.status, MigrationStatus::Done);
        assert_eq!(migrator.state(), MigrationState::Done);
        assert_eq!(summary.blocks_total, 1);
        assert_eq!(summary.blocks_processed, 1);
        assert_eq!(summary.series_seen, 3);
        assert_eq!(summary.samples_extracted, 6);
        assert_eq!(summary.samples_sent, 6);
        assert_eq!(summary.permanent_failures, 0);

        let batches = decode_all(migrator.transport().sender());
        let sent: usize = batches.iter().map(Batch::sample_count).sum();
        assert_eq!(sent, 6);
        assert!(
            batches
                .iter()
                .flat_map(|b| &b.series)
                .flat_map(|s| &s.samples)
                .all(|s| (1000..5000).contains(&s.timestamp))
        );
    }

    #[tokio::test]
    async fn series_order_is_preserved_across_batches() {
        let samples: Vec<Sample> = (0..5).map(|t| Sample::new(1000 + t, t as f64)).collect();
        let store = Arc::new(
            InMemoryStore::new()
                .with_block("b1", TimeRange::new(0, 10_000))
                .with_series(labels("up"), samples.clone()),
        );
        let config = MigrationConfig {
            batch: BatchLimits {
                max_samples: 2,
                max_bytes: 1 << 20,
            },
            ..config()
        };
        let mut migrator = Migrator::with_sender(&config, store, ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.batches_sent, 3);

        let batches = decode_all(migrator.transport().sender());
        let sizes: Vec<_> = batches.iter().map(Batch::sample_count).collect();
        assert_eq!(sizes, [2, 2, 1]);
        let replayed: Vec<Sample> = batches
            .into_iter()
            .flat_map(|b| b.series)
            .flat_map(|s| s.samples)
            .collect();
        assert_eq!(replayed, samples);
    }

    #[tokio::test]
    async fn retried_batches_count_retries_not_failures() {
        let store = Arc::new(three_series_block(InMemoryStore::new(), "b1"));
        let sender = ScriptedSender::statuses(&[503, 503, 200]);
        let mut migrator = Migrator::with_sender(&config(), store, sender).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.status, MigrationStatus::Done);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.permanent_failures, 0);
        assert_eq!(summary.samples_sent, 6);
    }

    #[tokio::test]
    async fn rejected_batch_is_recorded_and_run_completes() {
        let store = Arc::new(three_series_block(InMemoryStore::new(), "b1"));
        let sender = ScriptedSender::statuses(&[400]);
        let mut migrator = Migrator::with_sender(&config(), store, sender).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.status, MigrationStatus::Done);
        assert_eq!(summary.failures_of(FailureKind::ServerRejection), 1);
        assert_eq!(summary.samples_sent, 0);
        assert_eq!(migrator.transport().sender().calls(), 1);

        let record = &summary.failures[0];
        assert_eq!(record.block.as_deref(), Some("b1"));
        assert_eq!(record.batch_samples, Some(6));
        assert!(record.message.contains("400"));
    }

    #[tokio::test]
    async fn enumeration_failure_fails_the_run() {
        let store = Arc::new(InMemoryStore::new().failing_listing());
        let mut migrator =
            Migrator::with_sender(&config(), store, ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.status, MigrationStatus::Failed);
        assert_eq!(summary.status.exit_code(), 1);
        assert_eq!(migrator.state(), MigrationState::Failed);
        assert_eq!(summary.failures_of(FailureKind::Storage), 1);
        assert_eq!(migrator.transport().sender().calls(), 0);
    }

    #[tokio::test]
    async fn block_scoped_failures_skip_only_that_block() {
        let store = InMemoryStore::new()
            .with_block("open", TimeRange::new(0, 1000))
            .with_series(labels("x"), vec![Sample::new(1, 1.0)])
            .with_block("select", TimeRange::new(1000, 2000))
            .with_series(labels("y"), vec![Sample::new(1001, 1.0)])
            .failing_open("open")
            .failing_select("select")
            .with_unreadable_block("broken");
        let store = Arc::new(three_series_block(store, "good"));
        let mut migrator =
            Migrator::with_sender(&config(), store, ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.status, MigrationStatus::Done);
        assert_eq!(summary.blocks_total, 4);
        assert_eq!(summary.blocks_failed, 3);
        assert_eq!(summary.blocks_processed, 1);
        assert_eq!(summary.failures_of(FailureKind::Storage), 2);
        assert_eq!(summary.failures_of(FailureKind::Query), 1);
        assert_eq!(summary.samples_sent, 6);
    }

    #[tokio::test]
    async fn iteration_failure_abandons_only_that_series() {
        let store = Arc::new(
            InMemoryStore::new()
                .with_block("b1", TimeRange::new(0, 100))
                .with_failing_series(
                    labels("flaky"),
                    vec![Sample::new(1, 1.0), Sample::new(2, 2.0), Sample::new(3, 3.0)],
                    2,
                )
                .with_series(labels("steady"), vec![Sample::new(1, 1.0)]),
        );
        let progress_dir = tempfile::tempdir().unwrap();
        let progress_file = progress_dir.path().join("progress.jsonl");
        let config = MigrationConfig {
            progress_file: Some(progress_file.clone()),
            ..config()
        };
        let mut migrator = Migrator::with_sender(&config, store, ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.series_seen, 2);
        assert_eq!(summary.samples_sent, 3);
        assert_eq!(summary.failures_of(FailureKind::Iteration), 1);
        assert_eq!(summary.failures[0].series, Some(labels("flaky")));
        // a block with failures is not checkpointed
        assert!(ProgressLog::load(&progress_file).unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_blocks_are_checkpointed_and_skipped_next_time() {
        let progress_dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig {
            progress_file: Some(progress_dir.path().join("progress.jsonl")),
            ..config()
        };
        let build = || {
            let store = three_series_block(InMemoryStore::new(), "b1");
            Arc::new(three_series_block(store, "b2"))
        };

        let mut first = Migrator::with_sender(&config, build(), ScriptedSender::default()).unwrap();
        let summary = first.run(&CancellationToken::new()).await;
        assert_eq!(summary.blocks_processed, 2);

        let mut second = Migrator::with_sender(&config, build(), ScriptedSender::default()).unwrap();
        let summary = second.run(&CancellationToken::new()).await;
        assert_eq!(summary.blocks_skipped, 2);
        assert_eq!(summary.blocks_processed, 0);
        assert_eq!(second.transport().sender().calls(), 0);
    }

    #[tokio::test]
    async fn windowed_checkpoint_does_not_skip_a_wider_run() {
        let progress_dir = tempfile::tempdir().unwrap();
        let progress_file = progress_dir.path().join("progress.jsonl");
        let build = || Arc::new(three_series_block(InMemoryStore::new(), "b1"));
        let windowed = MigrationConfig {
            start: Some(2000),
            end: Some(4000),
            progress_file: Some(progress_file.clone()),
            ..config()
        };
        let full = MigrationConfig {
            progress_file: Some(progress_file),
            ..config()
        };

        let mut first = Migrator::with_sender(&windowed, build(), ScriptedSender::default()).unwrap();
        let summary = first.run(&CancellationToken::new()).await;
        assert_eq!(summary.samples_sent, 3);

        let mut second = Migrator::with_sender(&full, build(), ScriptedSender::default()).unwrap();
        let summary = second.run(&CancellationToken::new()).await;
        assert_eq!(summary.blocks_skipped, 0);
        assert_eq!(summary.samples_sent, 6);

        // the full-range entry now covers both the full and the windowed run
        for config in [&full, &windowed] {
            let mut again = Migrator::with_sender(config, build(), ScriptedSender::default()).unwrap();
            let summary = again.run(&CancellationToken::new()).await;
            assert_eq!(summary.blocks_skipped, 1);
            assert_eq!(again.transport().sender().calls(), 0);
        }
    }

    #[tokio::test]
    async fn narrow_selector_checkpoint_does_not_skip_match_all() {
        let progress_dir = tempfile::tempdir().unwrap();
        let progress_file = progress_dir.path().join("progress.jsonl");
        let build = || Arc::new(three_series_block(InMemoryStore::new(), "b1"));
        let narrow = MigrationConfig {
            selector: r#"{__name__="a"}"#.parse().unwrap(),
            progress_file: Some(progress_file.clone()),
            ..config()
        };
        let all = MigrationConfig {
            progress_file: Some(progress_file),
            ..config()
        };

        let mut first = Migrator::with_sender(&narrow, build(), ScriptedSender::default()).unwrap();
        let summary = first.run(&CancellationToken::new()).await;
        assert_eq!(summary.samples_sent, 2);

        let mut second = Migrator::with_sender(&all, build(), ScriptedSender::default()).unwrap();
        let summary = second.run(&CancellationToken::new()).await;
        assert_eq!(summary.blocks_skipped, 0);
        assert_eq!(summary.samples_sent, 6);

        let mut third = Migrator::with_sender(&narrow, build(), ScriptedSender::default()).unwrap();
        let summary = third.run(&CancellationToken::new()).await;
        assert_eq!(summary.blocks_skipped, 1);
    }

    #[tokio::test]
    async fn time_window_clips_and_skips_blocks() {
        let store = three_series_block(InMemoryStore::new(), "inside");
        let store = Arc::new(
            store
                .with_block("outside", TimeRange::new(10_000, 20_000))
                .with_series(labels("z"), vec![Sample::new(15_000, 1.0)]),
        );
        let config = MigrationConfig {
            start: Some(2000),
            end: Some(4000),
            ..config()
        };
        let mut migrator = Migrator::with_sender(&config, store, ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.blocks_skipped, 1);
        assert_eq!(summary.blocks_processed, 1);
        // a@2000, b@2500, c@3000
        assert_eq!(summary.samples_sent, 3);
    }

    #[tokio::test]
    async fn dry_run_plans_batches_without_sending() {
        let store = Arc::new(three_series_block(InMemoryStore::new(), "b1"));
        let progress_dir = tempfile::tempdir().unwrap();
        let progress_file = progress_dir.path().join("progress.jsonl");
        let config = MigrationConfig {
            dry_run: true,
            progress_file: Some(progress_file.clone()),
            batch: BatchLimits {
                max_samples: 4,
                max_bytes: 1 << 20,
            },
            ..config()
        };
        let mut migrator = Migrator::with_sender(&config, store, ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert!(summary.dry_run);
        assert_eq!(summary.batches_sent, 2);
        assert_eq!(summary.samples_extracted, 6);
        assert_eq!(summary.samples_sent, 0);
        assert_eq!(migrator.transport().sender().calls(), 0);
        assert!(!progress_file.exists());
    }

    #[tokio::test]
    async fn concurrent_blocks_are_all_accounted() {
        let mut store = InMemoryStore::new();
        for i in 0..10 {
            store = three_series_block(store, &format!("b{i:02}"));
        }
        let config = MigrationConfig {
            concurrency: 3,
            batch: BatchLimits {
                max_samples: 1,
                max_bytes: 1 << 20,
            },
            ..config()
        };
        let mut migrator =
            Migrator::with_sender(&config, Arc::new(store), ScriptedSender::default()).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.blocks_processed, 10);
        assert_eq!(summary.samples_sent, 60);
        assert_eq!(summary.batches_sent, 60);
        assert_eq!(migrator.transport().sender().calls(), 60);
    }

    #[tokio::test]
    async fn in_flight_sends_never_exceed_concurrency() {
        let mut store = InMemoryStore::new();
        for i in 0..6 {
            store = three_series_block(store, &format!("b{i:02}"));
        }
        let config = MigrationConfig {
            concurrency: 2,
            batch: BatchLimits {
                max_samples: 1,
                max_bytes: 1 << 20,
            },
            ..config()
        };
        let sender = SlowSender::new(Duration::from_millis(5));
        let mut migrator = Migrator::with_sender(&config, Arc::new(store), sender).unwrap();

        let summary = migrator.run(&CancellationToken::new()).await;
        assert_eq!(summary.status, MigrationStatus::Done);
        assert_eq!(summary.samples_sent, 36);
        assert_eq!(migrator.transport().sender().calls(), 36);
        let peak = migrator.transport().sender().peak();
        assert!((1..=2).contains(&peak), "peak in-flight sends {peak}");
    }

    #[tokio::test]
    async fn slow_sends_stall_extraction() {
        let samples: Vec<Sample> = (0..40).map(|t| Sample::new(1000 + t, 1.0)).collect();
        let pulled = Arc::new(AtomicUsize::new(0));
        let store = CountingStore {
            inner: InMemoryStore::new()
                .with_block("b1", TimeRange::new(1000, 5000))
                .with_series(labels("a"), samples),
            pulled: Arc::clone(&pulled),
        };
        let config = MigrationConfig {
            concurrency: 1,
            batch: BatchLimits {
                max_samples: 1,
                max_bytes: 1 << 20,
            },
            ..config()
        };
        let gate = Arc::new(Semaphore::new(0));
        let mut migrator =
            Migrator::with_sender(&config, Arc::new(store), SlowSender::gated(Arc::clone(&gate)))
                .unwrap();

        let cancel = CancellationToken::new();
        let observe = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            // One batch held by the sender, a full channel, one batch waiting to
            // be queued and the sample that closed it.
            let stalled_at = pulled.load(Ordering::SeqCst);
            assert!(
                stalled_at <= BATCH_CHANNEL_CAPACITY + 3,
                "extraction ran ahead to {stalled_at} samples"
            );
            gate.add_permits(64);
        };
        let (summary, ()) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(migrator.run(&cancel), observe) },
        )
        .await
        .unwrap();

        assert_eq!(summary.status, MigrationStatus::Done);
        assert_eq!(summary.samples_sent, 40);
        assert_eq!(pulled.load(Ordering::SeqCst), 40);
        assert_eq!(migrator.transport().sender().peak(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let store = Arc::new(three_series_block(InMemoryStore::new(), "b1"));
        let mut migrator = Migrator::with_sender(&config(), store, HangingSender).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), migrator.run(&cancel))
            .await
            .unwrap();
        assert_eq!(summary.status, MigrationStatus::Cancelled);
        assert_eq!(summary.status.exit_code(), 130);
        assert_eq!(migrator.state(), MigrationState::Cancelled);
        assert_eq!(summary.samples_sent, 0);
        assert_eq!(summary.permanent_failures, 0);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_work() {
        let store = Arc::new(InMemoryStore::new());
        let config = MigrationConfig {
            concurrency: 0,
            ..config()
        };
        assert!(matches!(
            Migrator::with_sender(&config, store, ScriptedSender::default()),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
