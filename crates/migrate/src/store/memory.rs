//! In-memory block store
//!
//! Serves blocks held in memory and can inject a failure at each capability
//! boundary, which makes it the fixture of choice for pipeline tests.

use std::collections::HashSet;
use std::sync::Arc;

use super::{BlockListing, BlockStore, Querier, SampleIter, Series, SeriesSet, StoreError};
use crate::selector::Selector;
use crate::types::{Block, Labels, Sample, TimeRange};

#[derive(Debug, Clone)]
struct MemorySeries {
    labels: Labels,
    samples: Arc<Vec<Sample>>,
    /// Yield an iteration error after this many samples.
    fail_after: Option<usize>,
}

#[derive(Debug, Clone)]
struct MemoryBlock {
    block: Block,
    series: Vec<MemorySeries>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    blocks: Vec<MemoryBlock>,
    fail_listing: bool,
    fail_open: HashSet<String>,
    fail_select: HashSet<String>,
    unreadable: Vec<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(mut self, id: &str, range: TimeRange) -> Self {
        self.blocks.push(MemoryBlock {
            block: Block {
                id: id.to_owned(),
                min_time: range.min_time,
                max_time: range.max_time,
            },
            series: Vec::new(),
        });
        self
    }

    /// Adds a series to the most recently added block.
    pub fn with_series(self, labels: Labels, samples: Vec<Sample>) -> Self {
        self.push_series(labels, samples, None)
    }

    /// Adds a series whose sample iterator fails after `fail_after` samples.
    pub fn with_failing_series(self, labels: Labels, samples: Vec<Sample>, fail_after: usize) -> Self {
        self.push_series(labels, samples, Some(fail_after))
    }

    fn push_series(mut self, labels: Labels, samples: Vec<Sample>, fail_after: Option<usize>) -> Self {
        if let Some(block) = self.blocks.last_mut() {
            block.series.push(MemorySeries {
                labels,
                samples: Arc::new(samples),
                fail_after,
            });
        }
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    pub fn failing_open(mut self, id: &str) -> Self {
        self.fail_open.insert(id.to_owned());
        self
    }

    pub fn failing_select(mut self, id: &str) -> Self {
        self.fail_select.insert(id.to_owned());
        self
    }

    /// Reports an extra block entry whose metadata cannot be read.
    pub fn with_unreadable_block(mut self, name: &str) -> Self {
        self.unreadable.push(name.to_owned());
        self
    }
}

impl BlockStore for InMemoryStore {
    fn list_blocks(&self) -> Result<BlockListing, StoreError> {
        if self.fail_listing {
            return Err(StoreError::Unavailable {
                path: "memory".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "injected"),
            });
        }
        let mut blocks: Vec<Block> = self.blocks.iter().map(|b| b.block.clone()).collect();
        blocks.sort_by(|a, b| a.min_time.cmp(&b.min_time).then_with(|| a.id.cmp(&b.id)));
        Ok(BlockListing {
            blocks,
            unreadable: self
                .unreadable
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        StoreError::Open {
                            block: name.clone(),
                            reason: "injected unreadable meta".to_owned(),
                        },
                    )
                })
                .collect(),
        })
    }

    fn open_query(&self, block: &Block, _range: TimeRange) -> Result<Box<dyn Querier>, StoreError> {
        if self.fail_open.contains(&block.id) {
            return Err(StoreError::Open {
                block: block.id.clone(),
                reason: "injected open failure".to_owned(),
            });
        }
        let stored = self
            .blocks
            .iter()
            .find(|b| b.block.id == block.id)
            .ok_or_else(|| StoreError::Open {
                block: block.id.clone(),
                reason: "no such block".to_owned(),
            })?;
        Ok(Box::new(MemoryQuerier {
            block: block.id.clone(),
            series: stored.series.clone(),
            fail_select: self.fail_select.contains(&block.id),
        }))
    }
}

struct MemoryQuerier {
    block: String,
    series: Vec<MemorySeries>,
    fail_select: bool,
}

impl Querier for MemoryQuerier {
    fn select(&self, selector: &Selector) -> Result<SeriesSet, StoreError> {
        if self.fail_select {
            return Err(StoreError::Query {
                block: self.block.clone(),
                reason: "injected select failure".to_owned(),
            });
        }
        let selected: Vec<MemorySeries> = self
            .series
            .iter()
            .filter(|s| selector.matches(&s.labels))
            .cloned()
            .collect();
        Ok(Box::new(
            selected
                .into_iter()
                .map(|series| Ok(Box::new(series) as Box<dyn Series>)),
        ))
    }
}

impl Series for MemorySeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn samples(&self) -> Result<SampleIter, StoreError> {
        let samples = Arc::clone(&self.samples);
        let fail_after = self.fail_after;
        let len = samples.len();
        let limit = fail_after.map_or(len, |n| n.min(len));

        let ok = (0..limit).map(move |i| Ok(samples[i]));
        let failure = fail_after.map(|n| {
            Err(StoreError::Iteration(format!(
                "injected failure after {n} samples"
            )))
        });
        Ok(Box::new(ok.chain(failure)))
    }
}
