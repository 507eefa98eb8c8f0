//! Batch-ingestion pipeline: parallel parse, strictly-ordered merge.

pub mod batch;
pub mod parse;
pub mod pipeline;
pub mod source;

pub use batch::Batch;
pub use parse::{parse_batch, ParseError, ParsedBatch, ParsedBlock, ParsedTx};
pub use pipeline::{SyncConfig, SyncError, SyncMetrics, Synchronizer};
pub use source::{BlockFetcher, FetchError};
