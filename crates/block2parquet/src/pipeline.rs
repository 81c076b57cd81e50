//! Block-to-shards driver.
//!
//! [`convert`] walks every series the source enumerates and every chunk of
//! each series, in the order given, turning each chunk into exactly one
//! summary record. The first error from any stage aborts the walk.
//! [`run`] wires the on-disk block and the sharded writer around it.

use crate::block::{
    Block, Chunk, ChunkMeta, ChunkReader, ChunkRef, IndexReader, Labels, SeriesRef,
};
use crate::config::ExportConfig;
use crate::error::{ErrorKind, Result, ResultExt};
use crate::summary::{
    summarize_chunk, SentinelPolicy, ShardInfo, ShardedWriter, SummaryRecord,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Enumerates series and their chunk descriptors.
pub trait SeriesSource {
    /// Returns every series reference in enumeration order.
    fn postings(&self) -> Box<dyn Iterator<Item = Result<SeriesRef>> + '_>;

    /// Returns the label set and chunk descriptors of one series.
    fn series(&self, series_ref: SeriesRef) -> Result<(Labels, Vec<ChunkMeta>)>;
}

/// Loads chunks by reference.
pub trait ChunkResolver {
    /// Returns the encoded chunk at `chunk_ref`.
    fn chunk(&mut self, chunk_ref: ChunkRef) -> Result<Chunk>;
}

/// Consumes summary records.
pub trait RecordSink {
    /// Accepts one record.
    fn write(&mut self, record: &SummaryRecord) -> Result<()>;

    /// Flushes everything and returns the shards produced. Idempotent.
    fn close(&mut self) -> Result<Vec<ShardInfo>>;
}

impl SeriesSource for IndexReader {
    fn postings(&self) -> Box<dyn Iterator<Item = Result<SeriesRef>> + '_> {
        Box::new(IndexReader::postings(self).map(Ok))
    }

    fn series(&self, series_ref: SeriesRef) -> Result<(Labels, Vec<ChunkMeta>)> {
        IndexReader::series(self, series_ref)
    }
}

impl ChunkResolver for ChunkReader {
    fn chunk(&mut self, chunk_ref: ChunkRef) -> Result<Chunk> {
        ChunkReader::chunk(self, chunk_ref)
    }
}

/// Counters of one conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    /// Series enumerated.
    pub series: u64,
    /// Chunks read and summarized.
    pub chunks: u64,
    /// Records handed to the sink.
    pub records: u64,
}

/// Outcome of [`run`].
#[derive(Debug, Clone)]
pub struct ExportReport {
    /// Conversion counters.
    pub stats: ExportStats,
    /// Shards written, in index order.
    pub shards: Vec<ShardInfo>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Summarizes every chunk of every series into `sink`.
///
/// Errors carry the failing stage and, once the series is known, its
/// label set. The sink is not closed here.
pub fn convert<S, C, W>(
    source: &S,
    resolver: &mut C,
    sink: &mut W,
    policy: SentinelPolicy,
) -> Result<ExportStats>
where
    S: SeriesSource + ?Sized,
    C: ChunkResolver + ?Sized,
    W: RecordSink + ?Sized,
{
    let mut stats = ExportStats::default();

    for series_ref in source.postings() {
        let series_ref = series_ref.stage(ErrorKind::Source, "list postings")?;
        let (labels, metas) = source
            .series(series_ref)
            .stage(ErrorKind::Source, "read series")?;

        for meta in &metas {
            let chunk = resolver
                .chunk(meta.chunk_ref)
                .series_stage(ErrorKind::Source, "read chunk", &labels)?;
            let record = summarize_chunk(&labels, &chunk, policy).series_stage(
                ErrorKind::Decode,
                "decode chunk",
                &labels,
            )?;
            sink.write(&record)
                .series_stage(ErrorKind::Sink, "write record", &labels)?;
            stats.chunks += 1;
            stats.records += 1;
        }

        stats.series += 1;
        debug!("Exported series {} ({} chunks)", labels, metas.len());
    }

    Ok(stats)
}

/// Exports the block at `block_path` as parquet shards under `output_path`.
///
/// The output directory is only created once the block has been opened.
/// On failure, shards already rotated stay on disk and the open shard is
/// closed when the writer drops.
pub fn run(
    block_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &ExportConfig,
) -> Result<ExportReport> {
    config.validate()?;
    let started = Instant::now();
    let block_path = block_path.as_ref();
    let output_path = output_path.as_ref();

    let block = Block::open(block_path).stage(ErrorKind::Source, "open block")?;
    let index = block.index().stage(ErrorKind::Source, "open index")?;
    let mut chunks = block.chunks().stage(ErrorKind::Source, "open chunks")?;
    let mut writer = ShardedWriter::new(output_path, config)
        .stage(ErrorKind::Sink, "open output")?
        .with_start(started);

    info!(
        "Exporting {} ({} series, {} chunks) to {}",
        block_path.display(),
        block.meta().stats.num_series,
        block.meta().stats.num_chunks,
        output_path.display()
    );

    let stats = convert(&index, &mut chunks, &mut writer, config.sentinel)?;
    let shards = writer.close().stage(ErrorKind::Sink, "close shard")?;
    let elapsed = started.elapsed();

    info!(
        series = stats.series,
        records = stats.records,
        shards = shards.len(),
        "Exported {} records from {} series into {} shards in {:.2?}",
        stats.records,
        stats.series,
        shards.len(),
        elapsed
    );

    Ok(ExportReport {
        stats,
        shards,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{chunk_ref, ChunkAppender, ChunkEncoding};
    use crate::error::Error;
    use std::collections::HashMap;

    struct MemSource {
        series: Vec<(Labels, Vec<ChunkMeta>)>,
        fail_postings_at: Option<usize>,
    }

    impl SeriesSource for MemSource {
        fn postings(&self) -> Box<dyn Iterator<Item = Result<SeriesRef>> + '_> {
            let fail_at = self.fail_postings_at;
            Box::new((0..self.series.len() as u64).map(move |i| {
                if Some(i as usize) == fail_at {
                    Err(Error::Corrupted("postings list truncated".into()))
                } else {
                    Ok(i)
                }
            }))
        }

        fn series(&self, series_ref: SeriesRef) -> Result<(Labels, Vec<ChunkMeta>)> {
            self.series
                .get(series_ref as usize)
                .cloned()
                .ok_or(Error::SeriesNotFound(series_ref))
        }
    }

    #[derive(Default)]
    struct MemChunks(HashMap<ChunkRef, Chunk>);

    impl ChunkResolver for MemChunks {
        fn chunk(&mut self, chunk_ref: ChunkRef) -> Result<Chunk> {
            self.0
                .get(&chunk_ref)
                .cloned()
                .ok_or(Error::ChunkNotFound(chunk_ref))
        }
    }

    #[derive(Default)]
    struct MemSink {
        records: Vec<SummaryRecord>,
        fail_after: Option<usize>,
    }

    impl RecordSink for MemSink {
        fn write(&mut self, record: &SummaryRecord) -> Result<()> {
            if Some(self.records.len()) == self.fail_after {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.records.push(record.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<Vec<ShardInfo>> {
            Ok(Vec::new())
        }
    }

    fn encode(samples: &[(i64, f64)]) -> Chunk {
        let mut appender = ChunkAppender::new();
        for &(ts, v) in samples {
            appender.append(ts, v).unwrap();
        }
        appender.finish()
    }

    fn meta(chunk_ref: ChunkRef, n: u32) -> ChunkMeta {
        ChunkMeta {
            chunk_ref,
            min_time: 0,
            max_time: 0,
            num_samples: n,
        }
    }

    /// Two series: `cpu` with two chunks and `mem` with one.
    fn fixture() -> (MemSource, MemChunks) {
        let mut chunks = MemChunks::default();
        chunks.0.insert(chunk_ref(0, 8), encode(&[(100, 1.0), (200, f64::NAN), (300, -5.0)]));
        chunks.0.insert(chunk_ref(0, 64), encode(&[(400, 2.0)]));
        chunks.0.insert(chunk_ref(1, 8), encode(&[(100, 9.0), (200, 3.0)]));

        let source = MemSource {
            series: vec![
                (
                    Labels::from_pairs([("__name__", "cpu")]),
                    vec![meta(chunk_ref(0, 8), 3), meta(chunk_ref(0, 64), 1)],
                ),
                (
                    Labels::from_pairs([("__name__", "mem"), ("host", "b")]),
                    vec![meta(chunk_ref(1, 8), 2)],
                ),
            ],
            fail_postings_at: None,
        };
        (source, chunks)
    }

    #[test]
    fn test_one_record_per_chunk_in_order() {
        let (source, mut chunks) = fixture();
        let mut sink = MemSink::default();
        let stats = convert(&source, &mut chunks, &mut sink, SentinelPolicy::Zero).unwrap();

        assert_eq!(
            stats,
            ExportStats {
                series: 2,
                chunks: 3,
                records: 3
            }
        );
        let names: Vec<&str> = sink.records.iter().map(|r| r.metric_name.as_str()).collect();
        assert_eq!(names, vec!["cpu", "cpu", "mem"]);

        let first = &sink.records[0];
        assert_eq!(first.sample_count, 2);
        assert_eq!(first.max_timestamp, 300);
        assert_eq!((first.min_value, first.max_value), (-5.0, 1.0));
        assert_eq!(sink.records[1].max_timestamp, 400);
        assert_eq!(sink.records[2].min_value, 0.0);
    }

    #[test]
    fn test_policy_is_forwarded() {
        let (source, mut chunks) = fixture();
        let mut sink = MemSink::default();
        convert(&source, &mut chunks, &mut sink, SentinelPolicy::FirstSample).unwrap();
        assert_eq!(sink.records[2].min_value, 3.0);
        assert_eq!(sink.records[2].min_timestamp, 100);
    }

    #[test]
    fn test_series_without_chunks() {
        let source = MemSource {
            series: vec![(Labels::from_pairs([("__name__", "idle")]), vec![])],
            fail_postings_at: None,
        };
        let mut sink = MemSink::default();
        let stats =
            convert(&source, &mut MemChunks::default(), &mut sink, SentinelPolicy::Zero).unwrap();
        assert_eq!(stats.series, 1);
        assert_eq!(stats.records, 0);
        assert!(sink.records.is_empty());
    }

    #[test]
    fn test_postings_error_is_fatal() {
        let (mut source, mut chunks) = fixture();
        source.fail_postings_at = Some(1);
        let mut sink = MemSink::default();
        let err = convert(&source, &mut chunks, &mut sink, SentinelPolicy::Zero).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Source);
        assert!(err.to_string().starts_with("list postings: "));
        assert_eq!(sink.records.len(), 2);
    }

    #[test]
    fn test_missing_chunk_names_series() {
        let (source, mut chunks) = fixture();
        chunks.0.remove(&chunk_ref(1, 8));
        let mut sink = MemSink::default();
        let err = convert(&source, &mut chunks, &mut sink, SentinelPolicy::Zero).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Source);
        assert_eq!(
            err.to_string(),
            r#"read chunk({__name__="mem", host="b"}): Chunk not found: 0x100000008"#
        );
        assert!(matches!(err.root(), Error::ChunkNotFound(_)));
    }

    #[test]
    fn test_decode_error_aborts() {
        let (source, mut chunks) = fixture();
        chunks
            .0
            .insert(chunk_ref(0, 64), Chunk::from_bytes(ChunkEncoding::Xor, vec![5, 0, 1]));
        let mut sink = MemSink::default();
        let err = convert(&source, &mut chunks, &mut sink, SentinelPolicy::Zero).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.to_string().starts_with(r#"decode chunk({__name__="cpu"})"#));
        assert_eq!(sink.records.len(), 1);
    }

    #[test]
    fn test_sink_error_aborts() {
        let (source, mut chunks) = fixture();
        let mut sink = MemSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let err = convert(&source, &mut chunks, &mut sink, SentinelPolicy::Zero).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sink);
        assert!(err.to_string().starts_with("write record("));
        assert_eq!(sink.records.len(), 1);
    }

    #[test]
    fn test_run_rejects_missing_block_without_creating_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out");
        let err = run(dir.path().join("missing"), &out, &ExportConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Source);
        assert!(err.to_string().starts_with("open block: "));
        assert!(!out.exists());
    }

    #[test]
    fn test_run_rejects_bad_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ExportConfig::default().with_shard_size(0);
        let err = run(dir.path(), dir.path().join("out"), &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
