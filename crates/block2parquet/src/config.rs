//! Export configuration.

use crate::error::{Error, Result};
use crate::summary::SentinelPolicy;
use parquet::basic::{Compression, ZstdLevel};

/// Default maximum number of records per shard file.
pub const DEFAULT_SHARD_SIZE: u64 = 3_000_000;

/// Default number of records buffered before handing a batch to the encoder.
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Default maximum number of rows per parquet row group.
pub const DEFAULT_MAX_ROW_GROUP_SIZE: usize = 1024 * 1024;

/// Default parquet data page size limit in bytes.
pub const DEFAULT_DATA_PAGE_SIZE: usize = 8 * 1024;

/// Default number of records between throughput log lines.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100_000;

/// Compression codec applied to shard files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Snappy block compression.
    #[default]
    Snappy,
    /// Zstandard at the encoder's default level.
    Zstd,
    /// No compression.
    Uncompressed,
}

impl Codec {
    /// Returns the parquet compression setting for this codec.
    pub fn to_parquet(self) -> Compression {
        match self {
            Codec::Snappy => Compression::SNAPPY,
            Codec::Zstd => Compression::ZSTD(ZstdLevel::default()),
            Codec::Uncompressed => Compression::UNCOMPRESSED,
        }
    }
}

/// Configuration for exporting a block to sharded parquet files.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    /// Maximum number of records per shard file.
    /// Default: 3,000,000
    pub shard_size: u64,
    /// Records buffered in memory before being encoded as one batch.
    /// Default: 8192
    pub batch_size: usize,
    /// Maximum rows per parquet row group.
    /// Default: 1,048,576
    pub max_row_group_size: usize,
    /// Parquet data page size limit in bytes.
    /// Default: 8 KiB
    pub data_page_size: usize,
    /// Shard compression codec.
    /// Default: Snappy
    pub compression: Codec,
    /// Records between throughput log lines; 0 disables them.
    /// Default: 100,000
    pub progress_interval: u64,
    /// How per-chunk min/max accumulators are seeded.
    /// Default: `SentinelPolicy::Zero`
    pub sentinel: SentinelPolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_SHARD_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_row_group_size: DEFAULT_MAX_ROW_GROUP_SIZE,
            data_page_size: DEFAULT_DATA_PAGE_SIZE,
            compression: Codec::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            sentinel: SentinelPolicy::default(),
        }
    }
}

impl ExportConfig {
    /// Sets the shard size.
    pub fn with_shard_size(mut self, shard_size: u64) -> Self {
        self.shard_size = shard_size;
        self
    }

    /// Sets the encoder batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the maximum row group size.
    pub fn with_max_row_group_size(mut self, rows: usize) -> Self {
        self.max_row_group_size = rows;
        self
    }

    /// Sets the data page size limit.
    pub fn with_data_page_size(mut self, bytes: usize) -> Self {
        self.data_page_size = bytes;
        self
    }

    /// Sets the compression codec.
    pub fn with_compression(mut self, codec: Codec) -> Self {
        self.compression = codec;
        self
    }

    /// Sets the throughput log interval.
    pub fn with_progress_interval(mut self, records: u64) -> Self {
        self.progress_interval = records;
        self
    }

    /// Sets the min/max seeding policy.
    pub fn with_sentinel(mut self, sentinel: SentinelPolicy) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Checks that every size is positive.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.shard_size == 0 {
            return Err(Error::InvalidConfig("shard_size must be greater than 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be greater than 0".into()));
        }
        if self.max_row_group_size == 0 {
            return Err(Error::InvalidConfig(
                "max_row_group_size must be greater than 0".into(),
            ));
        }
        if self.data_page_size == 0 {
            return Err(Error::InvalidConfig("data_page_size must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = ExportConfig::default();
        assert_eq!(config.shard_size, 3_000_000);
        assert_eq!(config.progress_interval, 100_000);
        assert_eq!(config.compression, Codec::Snappy);
        assert_eq!(config.sentinel, SentinelPolicy::Zero);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ExportConfig::default()
            .with_shard_size(10)
            .with_batch_size(4)
            .with_compression(Codec::Zstd)
            .with_sentinel(SentinelPolicy::FirstSample);
        assert_eq!(config.shard_size, 10);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.compression.to_parquet(), Compression::ZSTD(ZstdLevel::default()));
        assert_eq!(config.sentinel, SentinelPolicy::FirstSample);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let err = ExportConfig::default().with_shard_size(0).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("shard_size"));

        assert!(ExportConfig::default().with_batch_size(0).validate().is_err());
        assert!(ExportConfig::default().with_max_row_group_size(0).validate().is_err());
        assert!(ExportConfig::default().with_data_page_size(0).validate().is_err());
    }
}
