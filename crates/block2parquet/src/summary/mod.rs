//! Chunk summaries and their sharded parquet output.

pub mod aggregate;
pub mod writer;

pub use aggregate::{summarize, summarize_chunk, SentinelPolicy, SummaryRecord};
pub use writer::{parse_shard_file_name, shard_path, summary_schema, ShardInfo, ShardedWriter};
