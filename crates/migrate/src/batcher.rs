//! Sample batcher
//!
//! Groups the samples of consecutive series into [`Batch`]es bounded by a
//! sample count and a conservative estimate of the serialized size. A series
//! that does not fit is split and continues in the next batch, keeping its
//! samples in the order they were pushed.

use tracing::warn;

use crate::codec::{SAMPLE_MAX_ENCODED_LEN, series_overhead};
use crate::types::{Batch, Labels, Sample, TimeSeries};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_samples: usize,
    pub max_bytes: usize,
}

#[derive(Debug)]
pub struct Batcher {
    limits: BatchLimits,
    pending: Vec<TimeSeries>,
    samples: usize,
    bytes: usize,
}

impl Batcher {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits: BatchLimits {
                max_samples: limits.max_samples.max(1),
                max_bytes: limits.max_bytes,
            },
            pending: Vec::new(),
            samples: 0,
            bytes: 0,
        }
    }

    /// Adds one sample of the series identified by `labels`.
    ///
    /// Returns the previous batch when this sample did not fit in it. The
    /// sample itself always ends up in the pending batch.
    pub fn push(&mut self, labels: &Labels, sample: Sample) -> Option<Batch> {
        let mut flushed = None;
        let mut added = self.projected_growth(labels);

        if self.samples > 0
            && (self.samples + 1 > self.limits.max_samples
                || self.bytes + added > self.limits.max_bytes)
        {
            flushed = self.take();
            added = self.projected_growth(labels);
        }

        if self.samples == 0 && added > self.limits.max_bytes {
            warn!(
                series = %labels,
                estimated_bytes = added,
                max_bytes = self.limits.max_bytes,
                "single sample exceeds the batch byte budget, sending it alone"
            );
        }

        match self.pending.last_mut() {
            Some(last) if last.labels == *labels => last.samples.push(sample),
            _ => self.pending.push(TimeSeries {
                labels: labels.clone(),
                samples: vec![sample],
            }),
        }
        self.samples += 1;
        self.bytes += added;

        flushed
    }

    /// Flushes the partial batch, if any.
    pub fn finish(&mut self) -> Option<Batch> {
        self.take()
    }

    pub fn pending_samples(&self) -> usize {
        self.samples
    }

    fn projected_growth(&self, labels: &Labels) -> usize {
        let continues = self
            .pending
            .last()
            .is_some_and(|last| last.labels == *labels);
        if continues {
            SAMPLE_MAX_ENCODED_LEN
        } else {
            series_overhead(labels) + SAMPLE_MAX_ENCODED_LEN
        }
    }

    fn take(&mut self) -> Option<Batch> {
        if self.samples == 0 {
            return None;
        }
        let batch = Batch {
            series: std::mem::take(&mut self.pending),
            estimated_bytes: self.bytes,
        };
        self.samples = 0;
        self.bytes = 0;
        Some(batch)
    }
}
