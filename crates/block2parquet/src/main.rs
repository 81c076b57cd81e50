//! Command line exporter from a time series block to parquet shards.
//!
//! Usage:
//!   block2parquet --block data/01HBLOCK --output out/ --shard-size 1000000

use block2parquet::{run, Codec, ExportConfig, SentinelPolicy};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Block directory to read
    #[arg(long)]
    block: PathBuf,

    /// Directory receiving the shard files
    #[arg(long)]
    output: PathBuf,

    /// Maximum records per shard
    #[arg(long, default_value_t = block2parquet::config::DEFAULT_SHARD_SIZE)]
    shard_size: u64,

    /// Records buffered before each encoder batch
    #[arg(long, default_value_t = block2parquet::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Maximum rows per parquet row group
    #[arg(long, default_value_t = block2parquet::config::DEFAULT_MAX_ROW_GROUP_SIZE)]
    row_group_size: usize,

    /// Parquet data page size limit in bytes
    #[arg(long, default_value_t = block2parquet::config::DEFAULT_DATA_PAGE_SIZE)]
    page_size: usize,

    /// Shard compression codec
    #[arg(long, value_enum, default_value_t = CompressionArg::Snappy)]
    compression: CompressionArg,

    /// Records between progress lines (0 disables them)
    #[arg(long, default_value_t = block2parquet::config::DEFAULT_PROGRESS_INTERVAL)]
    progress_interval: u64,

    /// Seed min/max from the first finite sample instead of zero
    #[arg(long, default_value = "false")]
    seed_from_first_sample: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CompressionArg {
    Snappy,
    Zstd,
    None,
}

impl From<CompressionArg> for Codec {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Snappy => Codec::Snappy,
            CompressionArg::Zstd => Codec::Zstd,
            CompressionArg::None => Codec::Uncompressed,
        }
    }
}

impl Args {
    fn config(&self) -> ExportConfig {
        let sentinel = if self.seed_from_first_sample {
            SentinelPolicy::FirstSample
        } else {
            SentinelPolicy::Zero
        };
        ExportConfig::default()
            .with_shard_size(self.shard_size)
            .with_batch_size(self.batch_size)
            .with_max_row_group_size(self.row_group_size)
            .with_data_page_size(self.page_size)
            .with_compression(self.compression.into())
            .with_progress_interval(self.progress_interval)
            .with_sentinel(sentinel)
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.config();
    debug!("Export config: {:?}", config);

    match run(&args.block, &args.output, &config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
