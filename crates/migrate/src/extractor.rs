//! Series extractor
//!
//! Opens a query against one block and walks the selected series lazily.
//! Samples outside the requested half-open range are dropped here even if the
//! store already clips them.

use std::sync::Arc;

use crate::selector::Selector;
use crate::store::{BlockStore, Querier, SampleIter, SeriesSet, StoreError};
use crate::types::{Block, Labels, Sample, TimeRange};

#[derive(Clone)]
pub struct Extractor {
    store: Arc<dyn BlockStore>,
    selector: Selector,
}

impl Extractor {
    pub fn new(store: Arc<dyn BlockStore>, selector: Selector) -> Self {
        Self { store, selector }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Opens `block` restricted to `range` and selects the matching series.
    ///
    /// Fails with a storage error when the query cannot be opened and with a
    /// query error when selection fails.
    pub fn open(&self, block: &Block, range: TimeRange) -> Result<BlockSeries, StoreError> {
        let querier = self.store.open_query(block, range)?;
        let series = querier.select(&self.selector)?;
        Ok(BlockSeries {
            range,
            series,
            _querier: querier,
        })
    }
}

/// Series of one block, in store order. Dropping it releases the query.
pub struct BlockSeries {
    range: TimeRange,
    series: SeriesSet,
    _querier: Box<dyn Querier>,
}

impl Iterator for BlockSeries {
    type Item = Result<ExtractedSeries, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let series = match self.series.next()? {
            Ok(series) => series,
            Err(error) => return Some(Err(error)),
        };
        let labels = series.labels().clone();
        Some(series.samples().map(|inner| ExtractedSeries {
            labels,
            samples: InRange {
                inner,
                range: self.range,
            },
        }))
    }
}

pub struct ExtractedSeries {
    pub labels: Labels,
    pub samples: InRange,
}

/// Sample iterator restricted to `[min_time, max_time)`.
pub struct InRange {
    inner: SampleIter,
    range: TimeRange,
}

impl Iterator for InRange {
    type Item = Result<Sample, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(sample) if !self.range.contains(sample.timestamp) => continue,
                other => return Some(other),
            }
        }
    }
}
