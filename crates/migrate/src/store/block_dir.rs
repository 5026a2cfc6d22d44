//! On-disk block directory store
//!
//! This is promigrate's own block export layout. It shares the block
//! directory structure and `meta.json` fields with Prometheus TSDB but stores
//! series in `index.json` and `samples.rdat`. Native Prometheus `index` and
//! `chunks/` files are not read, so pointing the store at a Prometheus `data/`
//! directory reports its blocks as unreadable.
//!
//! ## Layout
//!
//! The store root holds one directory per block. Directories without a
//! `meta.json` (the WAL, temporary compaction output) are ignored.
//!
//! | File           | Content                                                   |
//! |----------------|-----------------------------------------------------------|
//! | `meta.json`    | block id, `minTime`/`maxTime` (ms, half-open), stats      |
//! | `index.json`   | one entry per series: label map, first record, record count |
//! | `samples.rdat` | fixed 16-byte sample records                              |
//!
//! ## Sample Record Format
//!
//! - bytes `[0..8]`: big-endian `i64` timestamp in milliseconds
//! - bytes `[8..16]`: big-endian `u64` IEEE-754 bits of the value
//!
//! Series `n` occupies records `offset..offset + count`. Storing raw bits keeps
//! NaN payloads intact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BlockListing, BlockStore, Querier, SampleIter, Series, SeriesSet, StoreError};
use crate::selector::Selector;
use crate::types::{Block, Labels, Sample, TimeRange};

const META_FILE: &str = "meta.json";
const INDEX_FILE: &str = "index.json";
const SAMPLES_FILE: &str = "samples.rdat";
const RECORD_SIZE: u64 = 16;
const META_VERSION: u32 = 1;

/// Guard against unreasonable allocations from a corrupted index.
const MAX_INDEX_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_series: u64,
    pub num_samples: u64,
}

/// Contents of a block's `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: String,
    pub min_time: i64,
    pub max_time: i64,
    #[serde(default)]
    pub stats: BlockStats,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    labels: BTreeMap<String, String>,
    offset: u64,
    count: u64,
}

/// Read-only reader for a directory of blocks.
#[derive(Debug)]
pub struct BlockDirStore {
    base: PathBuf,
}

impl BlockDirStore {
    /// Opens the store rooted at `base`. Nothing is read until [`BlockStore::list_blocks`].
    pub fn open(base: &Path) -> Result<Self, StoreError> {
        let metadata = fs::metadata(base).map_err(|source| StoreError::Unavailable {
            path: base.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(StoreError::Unavailable {
                path: base.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
            });
        }
        Ok(Self {
            base: base.to_path_buf(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn read_meta(dir: &Path, name: &str) -> Result<BlockMeta, StoreError> {
        let open_error = |reason: String| StoreError::Open {
            block: name.to_owned(),
            reason,
        };
        let raw = fs::read(dir.join(META_FILE))
            .map_err(|e| open_error(format!("cannot read {META_FILE}: {e}")))?;
        let meta: BlockMeta = serde_json::from_slice(&raw)
            .map_err(|e| open_error(format!("invalid {META_FILE}: {e}")))?;

        if meta.version != META_VERSION {
            return Err(open_error(format!(
                "unsupported block version {} (expected {META_VERSION})",
                meta.version
            )));
        }
        if meta.min_time > meta.max_time {
            return Err(open_error(format!(
                "minTime ({}) is after maxTime ({})",
                meta.min_time, meta.max_time
            )));
        }
        if meta.ulid != name {
            warn!(dir = name, ulid = %meta.ulid, "block directory name differs from its ulid");
        }
        Ok(meta)
    }
}

impl BlockStore for BlockDirStore {
    fn list_blocks(&self) -> Result<BlockListing, StoreError> {
        let unavailable = |source| StoreError::Unavailable {
            path: self.base.clone(),
            source,
        };

        let mut listing = BlockListing::default();
        for entry in fs::read_dir(&self.base).map_err(unavailable)? {
            let entry = entry.map_err(unavailable)?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.join(META_FILE).exists() {
                debug!(dir = %name, "skipping directory without {META_FILE}");
                continue;
            }

            match Self::read_meta(&path, &name) {
                Ok(meta) => listing.blocks.push(Block {
                    id: name,
                    min_time: meta.min_time,
                    max_time: meta.max_time,
                }),
                Err(error) => listing.unreadable.push((name, error)),
            }
        }

        listing
            .blocks
            .sort_by(|a, b| a.min_time.cmp(&b.min_time).then_with(|| a.id.cmp(&b.id)));
        Ok(listing)
    }

    fn open_query(&self, block: &Block, range: TimeRange) -> Result<Box<dyn Querier>, StoreError> {
        let dir = self.base.join(&block.id);
        let open_error = |reason: String| StoreError::Open {
            block: block.id.clone(),
            reason,
        };

        let index_path = dir.join(INDEX_FILE);
        let index_len = fs::metadata(&index_path)
            .map_err(|e| open_error(format!("cannot stat {INDEX_FILE}: {e}")))?
            .len();
        if index_len > MAX_INDEX_SIZE {
            return Err(open_error(format!(
                "{INDEX_FILE} claims unreasonable size {index_len} bytes (max {MAX_INDEX_SIZE})"
            )));
        }
        let index = fs::read(&index_path)
            .map_err(|e| open_error(format!("cannot read {INDEX_FILE}: {e}")))?;

        let samples_path = dir.join(SAMPLES_FILE);
        if !samples_path.is_file() {
            return Err(open_error(format!("missing {SAMPLES_FILE}")));
        }

        Ok(Box::new(BlockDirQuerier {
            block: block.id.clone(),
            index,
            samples_path: Arc::new(samples_path),
            range,
        }))
    }
}

struct BlockDirQuerier {
    block: String,
    index: Vec<u8>,
    samples_path: Arc<PathBuf>,
    range: TimeRange,
}

impl Querier for BlockDirQuerier {
    fn select(&self, selector: &Selector) -> Result<SeriesSet, StoreError> {
        let entries: Vec<IndexEntry> =
            serde_json::from_slice(&self.index).map_err(|e| StoreError::Query {
                block: self.block.clone(),
                reason: format!("invalid {INDEX_FILE}: {e}"),
            })?;

        let mut selected = Vec::new();
        for entry in entries {
            let labels = Labels::new(entry.labels).map_err(|e| StoreError::Query {
                block: self.block.clone(),
                reason: format!("invalid series labels: {e}"),
            })?;
            if selector.matches(&labels) {
                selected.push(DiskSeries {
                    labels,
                    samples_path: Arc::clone(&self.samples_path),
                    offset: entry.offset,
                    count: entry.count,
                    range: self.range,
                });
            }
        }

        debug!(block = %self.block, series = selected.len(), "selected series");
        Ok(Box::new(
            selected
                .into_iter()
                .map(|series| Ok(Box::new(series) as Box<dyn Series>)),
        ))
    }
}

struct DiskSeries {
    labels: Labels,
    samples_path: Arc<PathBuf>,
    offset: u64,
    count: u64,
    range: TimeRange,
}

impl Series for DiskSeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn samples(&self) -> Result<SampleIter, StoreError> {
        let mut file = File::open(self.samples_path.as_path()).map_err(|e| {
            StoreError::Iteration(format!(
                "cannot open {}: {e}",
                self.samples_path.display()
            ))
        })?;
        let start = self
            .offset
            .checked_mul(RECORD_SIZE)
            .ok_or_else(|| StoreError::Iteration(format!("record offset {} overflows", self.offset)))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| StoreError::Iteration(format!("cannot seek to record {}: {e}", self.offset)))?;

        Ok(Box::new(RecordIter {
            reader: BufReader::new(file),
            next_record: self.offset,
            remaining: self.count,
            range: self.range,
        }))
    }
}

/// Streams sample records, skipping those before the range and stopping at its end.
struct RecordIter {
    reader: BufReader<File>,
    next_record: u64,
    remaining: u64,
    range: TimeRange,
}

impl RecordIter {
    fn read_record(&mut self) -> Result<Sample, StoreError> {
        let mut buf = [0u8; RECORD_SIZE as usize];
        self.reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StoreError::Iteration(format!(
                    "samples file truncated at record {}",
                    self.next_record
                ))
            } else {
                StoreError::Iteration(format!("cannot read record {}: {e}", self.next_record))
            }
        })?;
        self.next_record += 1;
        Ok(decode_record(&buf))
    }
}

impl Iterator for RecordIter {
    type Item = Result<Sample, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            self.remaining -= 1;
            match self.read_record() {
                Ok(sample) if sample.timestamp < self.range.min_time => continue,
                Ok(sample) if sample.timestamp >= self.range.max_time => {
                    self.remaining = 0;
                    return None;
                }
                Ok(sample) => return Some(Ok(sample)),
                Err(error) => {
                    self.remaining = 0;
                    return Some(Err(error));
                }
            }
        }
        None
    }
}

fn encode_record(sample: &Sample) -> [u8; RECORD_SIZE as usize] {
    let mut buf = [0u8; RECORD_SIZE as usize];
    buf[..8].copy_from_slice(&sample.timestamp.to_be_bytes());
    buf[8..].copy_from_slice(&sample.value.to_bits().to_be_bytes());
    buf
}

fn decode_record(buf: &[u8; RECORD_SIZE as usize]) -> Sample {
    let mut timestamp = [0u8; 8];
    let mut bits = [0u8; 8];
    timestamp.copy_from_slice(&buf[..8]);
    bits.copy_from_slice(&buf[8..]);
    Sample::new(
        i64::from_be_bytes(timestamp),
        f64::from_bits(u64::from_be_bytes(bits)),
    )
}

/// Writes one block in the directory format read by [`BlockDirStore`].
///
/// `meta.json` is written last so a partially written block is never listed.
#[derive(Debug)]
pub struct BlockWriter {
    dir: PathBuf,
    ulid: String,
    range: TimeRange,
    series: Vec<(Labels, Vec<Sample>)>,
}

impl BlockWriter {
    pub fn new(base: &Path, ulid: &str, range: TimeRange) -> Self {
        Self {
            dir: base.join(ulid),
            ulid: ulid.to_owned(),
            range,
            series: Vec::new(),
        }
    }

    pub fn add_series(&mut self, labels: Labels, samples: Vec<Sample>) -> &mut Self {
        self.series.push((labels, samples));
        self
    }

    pub fn write(mut self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        self.series.sort_by(|a, b| a.0.cmp(&b.0));

        let mut samples = BufWriter::new(File::create(self.dir.join(SAMPLES_FILE))?);
        let mut index = Vec::with_capacity(self.series.len());
        let mut offset = 0u64;
        for (labels, series_samples) in &self.series {
            for sample in series_samples {
                samples.write_all(&encode_record(sample))?;
            }
            let count = series_samples.len() as u64;
            index.push(IndexEntry {
                labels: labels
                    .iter()
                    .map(|l| (l.name.clone(), l.value.clone()))
                    .collect(),
                offset,
                count,
            });
            offset += count;
        }
        samples.flush()?;

        fs::write(
            self.dir.join(INDEX_FILE),
            serde_json::to_vec(&index).map_err(io::Error::other)?,
        )?;

        let meta = BlockMeta {
            ulid: self.ulid.clone(),
            min_time: self.range.min_time,
            max_time: self.range.max_time,
            stats: BlockStats {
                num_series: self.series.len() as u64,
                num_samples: offset,
            },
            version: META_VERSION,
        };
        fs::write(
            self.dir.join(META_FILE),
            serde_json::to_vec_pretty(&meta).map_err(io::Error::other)?,
        )?;

        Ok(self.dir)
    }
}
