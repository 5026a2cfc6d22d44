//! Core data model shared by every pipeline stage.

use std::fmt;

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use thiserror::Error;

/// Label is a name/value pair of strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelsError {
    #[error("duplicate label name: {0}")]
    DuplicateName(String),
}

/// `Labels` is a set of `Label`s with unique names, kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new<I, N, V>(labels: I) -> Result<Self, LabelsError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels = labels
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect::<Vec<_>>();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = labels.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(LabelsError::DuplicateName(pair[0].name.clone()));
        }
        Ok(Self(labels))
    }

    /// Returns the value of the label with given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|label| label.name.as_str().cmp(name))
            .ok()
            .map(|index| self.0[index].value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        f.write_str("}")
    }
}

impl Serialize for Labels {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in &self.0 {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

/// One stored point. NaN and infinities are valid values.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Samples compare by timestamp and value bits so NaN payloads are distinguishable.
impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.value.to_bits() == other.value.to_bits()
    }
}

impl Eq for Sample {}

/// Half-open millisecond range `[min_time, max_time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub min_time: i64,
    pub max_time: i64,
}

impl TimeRange {
    /// Builds a range; `min_time > max_time` is clamped to an empty range at `min_time`.
    pub fn new(min_time: i64, max_time: i64) -> Self {
        Self {
            min_time,
            max_time: max_time.max(min_time),
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.min_time <= timestamp && timestamp < self.max_time
    }

    pub fn is_empty(&self) -> bool {
        self.min_time >= self.max_time
    }

    pub fn intersect(&self, other: &TimeRange) -> TimeRange {
        TimeRange::new(
            self.min_time.max(other.min_time),
            self.max_time.min(other.max_time),
        )
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min_time, self.max_time)
    }
}

/// An immutable, time-bounded partition of the source store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Opaque identifier the store uses to open queries (the block ULID on disk).
    pub id: String,
    pub min_time: i64,
    pub max_time: i64,
}

impl Block {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.min_time, self.max_time)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.range())
    }
}

/// A series with the samples assigned to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// A bounded group of series prepared for one transmission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub series: Vec<TimeSeries>,
    /// Conservative upper bound of the serialized size, computed while batching.
    pub estimated_bytes: usize,
}

impl Batch {
    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|s| s.samples.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_sorted_by_name() {
        let labels = Labels::new([("job", "node"), ("__name__", "up"), ("instance", "a")]).unwrap();
        let names: Vec<_> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["__name__", "instance", "job"]);
        assert_eq!(labels.get("job"), Some("node"));
        assert_eq!(labels.get("missing"), None);
    }

    #[test]
    fn labels_reject_duplicate_names() {
        let err = Labels::new([("a", "1"), ("b", "2"), ("a", "3")]).unwrap_err();
        assert_eq!(err, LabelsError::DuplicateName("a".to_owned()));
    }

    #[test]
    fn labels_display_is_prometheus_like() {
        let labels = Labels::new([("job", "node"), ("__name__", "up")]).unwrap();
        assert_eq!(labels.to_string(), r#"{__name__="up", job="node"}"#);
    }

    #[test]
    fn sample_equality_uses_value_bits() {
        assert_eq!(Sample::new(1, f64::NAN), Sample::new(1, f64::NAN));
        assert_ne!(Sample::new(1, 0.0), Sample::new(1, -0.0));
        assert_ne!(
            Sample::new(1, f64::NAN),
            Sample::new(1, f64::from_bits(f64::NAN.to_bits() ^ 1))
        );
    }

    #[test]
    fn time_range_is_half_open() {
        let range = TimeRange::new(1000, 5000);
        assert!(range.contains(1000));
        assert!(range.contains(4999));
        assert!(!range.contains(5000));
        assert!(!range.contains(999));
    }

    #[test]
    fn degenerate_range_contains_nothing() {
        let range = TimeRange::new(1000, 1000);
        assert!(range.is_empty());
        assert!(!range.contains(1000));

        let reversed = TimeRange::new(5000, 1000);
        assert!(reversed.is_empty());
        assert_eq!(reversed.min_time, 5000);
    }

    #[test]
    fn intersect_narrows_both_ends() {
        let block = TimeRange::new(1000, 5000);
        assert_eq!(block.intersect(&TimeRange::new(2000, 9000)), TimeRange::new(2000, 5000));
        assert!(block.intersect(&TimeRange::new(6000, 9000)).is_empty());
    }
}
