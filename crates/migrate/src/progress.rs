//! Block-granular progress checkpoint
//!
//! A JSON-lines file listing the blocks a previous run delivered completely,
//! together with the time range and selector of that run. A block is skipped
//! on the next run only when a recorded entry covers the requested range and
//! selected at least the same series.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selector::Selector;
use crate::types::{Block, TimeRange};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("cannot read progress file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed progress file {} at line {line}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot write progress file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One delivered block: the range that was migrated and the selector used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub block: String,
    pub min_time: i64,
    pub max_time: i64,
    pub selector: String,
}

impl ProgressEntry {
    pub fn new(block: &Block, range: TimeRange, selector: &Selector) -> Self {
        Self {
            block: block.id.clone(),
            min_time: range.min_time,
            max_time: range.max_time,
            selector: selector.to_string(),
        }
    }

    fn range(&self) -> TimeRange {
        TimeRange::new(self.min_time, self.max_time)
    }

    /// Whether this entry already delivered every sample `selector` picks in `range`.
    fn covers(&self, range: TimeRange, selector: &str, match_all: &str) -> bool {
        let recorded = self.range();
        let selected = self.selector == selector || self.selector == match_all;
        selected && recorded.min_time <= range.min_time && recorded.max_time >= range.max_time
    }
}

#[derive(Debug)]
pub struct ProgressLog {
    path: PathBuf,
    completed: HashMap<String, Vec<ProgressEntry>>,
}

impl ProgressLog {
    /// Loads the checkpoint at `path`. A missing file is an empty checkpoint.
    pub fn load(path: &Path) -> Result<Self, ProgressError> {
        let mut log = Self {
            path: path.to_path_buf(),
            completed: HashMap::new(),
        };
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(log),
            Err(source) => {
                return Err(ProgressError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| ProgressError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ProgressEntry =
                serde_json::from_str(&line).map_err(|source| ProgressError::Malformed {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                })?;
            log.insert(entry);
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a previous run delivered `block` over at least `range` with
    /// `selector` or with a match-all selector.
    pub fn is_completed(&self, block: &Block, range: TimeRange, selector: &Selector) -> bool {
        let selector = selector.to_string();
        let match_all = Selector::match_all().to_string();
        self.completed.get(&block.id).is_some_and(|entries| {
            entries
                .iter()
                .any(|e| e.covers(range, &selector, &match_all))
        })
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.completed.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Appends the delivery of `block` over `range` to the checkpoint file.
    pub fn record(
        &mut self,
        block: &Block,
        range: TimeRange,
        selector: &Selector,
    ) -> Result<(), ProgressError> {
        let write_error = |source| ProgressError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let entry = ProgressEntry::new(block, range, selector);
        let line = serde_json::to_string(&entry).map_err(|e| write_error(io::Error::other(e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_error)?;
        writeln!(file, "{line}").map_err(write_error)?;

        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, entry: ProgressEntry) {
        self.completed
            .entry(entry.block.clone())
            .or_default()
            .push(entry);
    }
}
