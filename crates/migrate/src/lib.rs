//! Block storage to Prometheus remote-write migration library
//!
//! This crate walks the immutable blocks of a local block directory (see
//! [`store::block_dir`] for the supported layout), extracts every series
//! matching a selector and delivers the samples to a remote write endpoint as
//! snappy-compressed protobuf batches.
//!
//! The pipeline is Extractor → Batcher → Codec → Transport, driven by the
//! [`orchestrator::Migrator`]. Failures flow back to the orchestrator only and
//! are contained at the narrowest scope (series, batch or block).

pub mod batcher;
pub mod codec;
pub mod config;
pub mod error;
pub mod extractor;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod selector;
pub mod store;
pub mod summary;
pub mod transport;
pub mod types;

pub use config::MigrationConfig;
pub use error::FailureKind;
pub use orchestrator::Migrator;
pub use selector::Selector;
pub use summary::{MigrationStatus, MigrationSummary};
pub use types::{Batch, Block, Label, Labels, Sample, TimeRange, TimeSeries};
