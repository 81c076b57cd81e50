//! Sharded parquet output.
//!
//! Records are numbered in write order. Record `n` lands in shard
//! `n / shard_size`, so every shard but the last holds exactly `shard_size`
//! records. Shards are opened lazily on their first record and only one is
//! open at a time.

use crate::config::ExportConfig;
use crate::error::{Error, Result};
use crate::pipeline::RecordSink;
use crate::summary::aggregate::SummaryRecord;
use arrow_array::builder::{
    Float64Builder, Int64Builder, MapBuilder, StringBuilder, UInt64Builder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Fields, Schema, SchemaRef};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// File name prefix of a shard.
pub const SHARD_PREFIX: &str = "part";

/// File extension of a shard.
pub const SHARD_EXTENSION: &str = "parquet";

/// Digits in a shard file name's index: enough for any `u64`.
pub const SHARD_INDEX_WIDTH: usize = 20;

/// Returns the path of shard `index` inside `dir`.
///
/// Indices are zero padded to the full width of a `u64`, so a lexicographic
/// listing follows shard order for every possible index.
pub fn shard_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!(
        "{}{:0width$}.{}",
        SHARD_PREFIX,
        index,
        SHARD_EXTENSION,
        width = SHARD_INDEX_WIDTH
    ))
}

/// Parses a shard file name as produced by [`shard_path`] back to its index.
///
/// Names whose index is not exactly [`SHARD_INDEX_WIDTH`] digits are rejected.
pub fn parse_shard_file_name(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(SHARD_PREFIX)?
        .strip_suffix(SHARD_EXTENSION)?
        .strip_suffix('.')?;
    if digits.len() != SHARD_INDEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn label_values_field() -> Field {
    Field::new("values", DataType::Utf8, false)
}

/// Returns the arrow schema of a shard. No column and no map entry is nullable.
pub fn summary_schema() -> SchemaRef {
    let entries = Fields::from(vec![
        Field::new("keys", DataType::Utf8, false),
        label_values_field(),
    ]);
    let labels = DataType::Map(
        Arc::new(Field::new("entries", DataType::Struct(entries), false)),
        false,
    );

    Arc::new(Schema::new(vec![
        Field::new("labels", labels, false),
        Field::new("metric_name", DataType::Utf8, false),
        Field::new("series_hash", DataType::UInt64, false),
        Field::new("sample_count", DataType::Int64, false),
        Field::new("min_timestamp", DataType::Int64, false),
        Field::new("max_timestamp", DataType::Int64, false),
        Field::new("min_value", DataType::Float64, false),
        Field::new("max_value", DataType::Float64, false),
        Field::new("chunk_size", DataType::UInt64, false),
    ]))
}

/// A shard that has been closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    /// Zero-based shard index.
    pub index: u64,
    /// Path of the shard file.
    pub path: PathBuf,
    /// Number of records in the shard.
    pub records: u64,
}

/// Column builders for records not yet handed to the encoder.
struct RecordBuffer {
    labels: MapBuilder<StringBuilder, StringBuilder>,
    metric_name: StringBuilder,
    series_hash: UInt64Builder,
    sample_count: Int64Builder,
    min_timestamp: Int64Builder,
    max_timestamp: Int64Builder,
    min_value: Float64Builder,
    max_value: Float64Builder,
    chunk_size: UInt64Builder,
    len: usize,
}

impl RecordBuffer {
    fn new() -> Self {
        Self {
            labels: MapBuilder::new(None, StringBuilder::new(), StringBuilder::new())
                .with_values_field(label_values_field()),
            metric_name: StringBuilder::new(),
            series_hash: UInt64Builder::new(),
            sample_count: Int64Builder::new(),
            min_timestamp: Int64Builder::new(),
            max_timestamp: Int64Builder::new(),
            min_value: Float64Builder::new(),
            max_value: Float64Builder::new(),
            chunk_size: UInt64Builder::new(),
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, record: &SummaryRecord) -> Result<()> {
        for label in record.labels.iter() {
            self.labels.keys().append_value(&label.name);
            self.labels.values().append_value(&label.value);
        }
        self.labels.append(true)?;
        self.metric_name.append_value(&record.metric_name);
        self.series_hash.append_value(record.series_hash);
        self.sample_count.append_value(record.sample_count as i64);
        self.min_timestamp.append_value(record.min_timestamp);
        self.max_timestamp.append_value(record.max_timestamp);
        self.min_value.append_value(record.min_value);
        self.max_value.append_value(record.max_value);
        self.chunk_size.append_value(record.chunk_size);
        self.len += 1;
        Ok(())
    }

    /// Drains the builders into one batch.
    fn finish(&mut self, schema: &SchemaRef) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.labels.finish()),
            Arc::new(self.metric_name.finish()),
            Arc::new(self.series_hash.finish()),
            Arc::new(self.sample_count.finish()),
            Arc::new(self.min_timestamp.finish()),
            Arc::new(self.max_timestamp.finish()),
            Arc::new(self.min_value.finish()),
            Arc::new(self.max_value.finish()),
            Arc::new(self.chunk_size.finish()),
        ];
        self.len = 0;
        Ok(RecordBatch::try_new(schema.clone(), columns)?)
    }
}

struct OpenShard {
    index: u64,
    path: PathBuf,
    writer: ArrowWriter<File>,
    records: u64,
}

/// Writes summary records to a sequence of parquet shards.
///
/// The writer owns at most one open file. [`ShardedWriter::close`] flushes
/// and closes it; dropping an unclosed writer does the same and logs any
/// failure instead of returning it.
///
/// # Example
///
/// ```rust,ignore
/// let mut writer = ShardedWriter::new("out", &ExportConfig::default())?;
/// writer.write(&record)?;
/// let shards = writer.close()?;
/// ```
pub struct ShardedWriter {
    dir: PathBuf,
    schema: SchemaRef,
    props: WriterProperties,
    shard_size: u64,
    batch_size: usize,
    progress_interval: u64,
    buffer: RecordBuffer,
    current: Option<OpenShard>,
    shards: Vec<ShardInfo>,
    written: u64,
    started: Instant,
    reports: u64,
    closed: bool,
}

impl ShardedWriter {
    /// Creates the output directory if needed. No shard is opened yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a rejected config and `Error::Io`
    /// when the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>, config: &ExportConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let props = WriterProperties::builder()
            .set_compression(config.compression.to_parquet())
            .set_max_row_group_size(config.max_row_group_size)
            .set_data_page_size_limit(config.data_page_size)
            .build();

        Ok(Self {
            dir,
            schema: summary_schema(),
            props,
            shard_size: config.shard_size,
            batch_size: config.batch_size,
            progress_interval: config.progress_interval,
            buffer: RecordBuffer::new(),
            current: None,
            shards: Vec::new(),
            written: 0,
            started: Instant::now(),
            reports: 0,
            closed: false,
        })
    }

    /// Measures throughput from `started` instead of the writer's creation.
    pub fn with_start(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    /// Returns the output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the number of records written so far across all shards.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns the shards closed so far.
    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    /// Appends one record, rotating to the next shard when the current one is full.
    pub fn write(&mut self, record: &SummaryRecord) -> Result<()> {
        if self.closed {
            return Err(Error::WriterClosed);
        }

        let target = self.written / self.shard_size;
        if self.current.as_ref().map(|shard| shard.index) != Some(target) {
            self.finish_shard()?;
            self.open_shard(target)?;
        }

        self.buffer.push(record)?;
        if let Some(shard) = self.current.as_mut() {
            shard.records += 1;
        }
        self.written += 1;

        if self.buffer.len() >= self.batch_size {
            self.flush_batch()?;
        }
        if self.progress_interval > 0 && self.written % self.progress_interval == 0 {
            self.report_progress();
        }
        Ok(())
    }

    /// Flushes and closes the open shard, if any.
    ///
    /// Returns every shard closed during the writer's life. Calling it again
    /// is a no-op that returns the same list.
    pub fn close(&mut self) -> Result<Vec<ShardInfo>> {
        if !self.closed {
            self.closed = true;
            self.finish_shard()?;
        }
        Ok(self.shards.clone())
    }

    fn open_shard(&mut self, index: u64) -> Result<()> {
        let path = shard_path(&self.dir, index);
        let file = File::create(&path)?;
        let writer = ArrowWriter::try_new(file, self.schema.clone(), Some(self.props.clone()))?;
        debug!("Opened shard {}", path.display());
        self.current = Some(OpenShard {
            index,
            path,
            writer,
            records: 0,
        });
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = self.buffer.finish(&self.schema)?;
        if let Some(shard) = self.current.as_mut() {
            shard.writer.write(&batch)?;
        }
        Ok(())
    }

    fn finish_shard(&mut self) -> Result<()> {
        self.flush_batch()?;
        let Some(shard) = self.current.take() else {
            return Ok(());
        };
        shard.writer.close()?;
        info!(
            "Closed shard {} ({} records)",
            shard.path.display(),
            shard.records
        );
        self.shards.push(ShardInfo {
            index: shard.index,
            path: shard.path,
            records: shard.records,
        });
        Ok(())
    }

    /// Records written per second since the start instant.
    fn throughput(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.written as f64 / secs
        } else {
            0.0
        }
    }

    fn report_progress(&mut self) {
        let rate = self.throughput();
        self.reports += 1;
        info!(
            records = self.written,
            records_per_sec = rate,
            "Wrote {} records ({:.0} records/sec)",
            self.written,
            rate
        );
    }
}

impl RecordSink for ShardedWriter {
    fn write(&mut self, record: &SummaryRecord) -> Result<()> {
        ShardedWriter::write(self, record)
    }

    fn close(&mut self) -> Result<Vec<ShardInfo>> {
        ShardedWriter::close(self)
    }
}

impl Drop for ShardedWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close shard on drop: {:?}", e);
        }
    }
}
