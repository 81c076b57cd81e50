//! block2parquet - Time Series Block Exporter
//!
//! This crate reads an immutable time series block and writes one summary
//! record per stored chunk into a directory of sharded parquet files.
//!
//! # Components
//!
//! - [`Block`] / [`BlockWriter`]: on-disk block with index and chunk segments
//! - [`summarize_chunk`]: per-chunk aggregation into a [`SummaryRecord`]
//! - [`ShardedWriter`]: count-bounded parquet shard rotation
//! - [`convert`] / [`run`]: the sequential export pipeline
//!
//! # Example
//!
//! ```rust,ignore
//! use block2parquet::{run, ExportConfig};
//!
//! let config = ExportConfig::default().with_shard_size(1_000_000);
//! let report = run("data/01HBLOCK", "out", &config)?;
//! for shard in &report.shards {
//!     println!("{}: {} records", shard.path.display(), shard.records);
//! }
//! ```

#![deny(missing_docs)]

pub mod block;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod summary;

pub use block::{Block, BlockMeta, BlockWriter, Chunk, ChunkMeta, Labels, Timestamp};
pub use config::{Codec, ExportConfig};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{
    convert, run, ChunkResolver, ExportReport, ExportStats, RecordSink, SeriesSource,
};
pub use summary::{
    summarize, summarize_chunk, SentinelPolicy, ShardInfo, ShardedWriter, SummaryRecord,
};
