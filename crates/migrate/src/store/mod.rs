//! Read-only block store abstraction
//!
//! The store is modelled as a chain of capabilities: a [`BlockStore`] lists
//! blocks and opens a [`Querier`] over a time range of one block, the querier
//! selects a lazy [`SeriesSet`], and every [`Series`] hands out a lazy sample
//! iterator. Each handle owns its own resources and releases them on drop, so
//! abandoning an iterator early (on error or cancellation) never leaks.
//!
//! Two implementations are provided: [`block_dir::BlockDirStore`] reads the
//! on-disk block directory format and [`memory::InMemoryStore`] serves
//! in-memory fixtures with failure injection.

pub mod block_dir;
pub mod memory;

use std::path::PathBuf;

use thiserror::Error;

use crate::error::FailureKind;
use crate::selector::Selector;
use crate::types::{Block, Labels, Sample, TimeRange};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot read block store at {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open block {block}: {reason}")]
    Open { block: String, reason: String },
    #[error("query on block {block} failed: {reason}")]
    Query { block: String, reason: String },
    #[error("iteration failed: {0}")]
    Iteration(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unavailable { .. } | Self::Open { .. } => FailureKind::Storage,
            Self::Query { .. } => FailureKind::Query,
            Self::Iteration(_) => FailureKind::Iteration,
        }
    }
}

/// Result of enumerating a store.
///
/// Blocks whose metadata could not be read are reported next to the readable
/// ones so the caller can account for them instead of silently losing data.
#[derive(Debug, Default)]
pub struct BlockListing {
    /// Readable blocks, sorted by `min_time` then id.
    pub blocks: Vec<Block>,
    /// Unreadable block entries as `(entry name, error)`.
    pub unreadable: Vec<(String, StoreError)>,
}

/// Lazy sample sequence of one series.
pub type SampleIter = Box<dyn Iterator<Item = Result<Sample, StoreError>> + Send>;

/// Lazy sequence of series selected from one block.
pub type SeriesSet = Box<dyn Iterator<Item = Result<Box<dyn Series>, StoreError>> + Send>;

pub trait BlockStore: Send + Sync {
    /// Enumerates every block of the store.
    ///
    /// Fails only when the store itself cannot be read.
    fn list_blocks(&self) -> Result<BlockListing, StoreError>;

    /// Opens a query context against `block` restricted to `range`.
    fn open_query(&self, block: &Block, range: TimeRange) -> Result<Box<dyn Querier>, StoreError>;
}

pub trait Querier: Send {
    fn select(&self, selector: &Selector) -> Result<SeriesSet, StoreError>;
}

pub trait Series: Send {
    fn labels(&self) -> &Labels;

    /// Starts iterating the series' samples in timestamp order.
    fn samples(&self) -> Result<SampleIter, StoreError>;
}
