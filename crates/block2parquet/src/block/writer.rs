//! Block builder.

use crate::block::chunk::ChunkAppender;
use crate::block::chunks::ChunkWriter;
use crate::block::index::IndexWriter;
use crate::block::{
    BlockMeta, BlockStats, ChunkMeta, Labels, Timestamp, CHUNKS_DIRNAME, INDEX_FILENAME,
    META_FILENAME, META_VERSION,
};
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default number of samples cut into one chunk by
/// [`BlockWriter::add_series_samples`].
pub const DEFAULT_SAMPLES_PER_CHUNK: usize = 120;

/// Writes a block directory: chunk segments, index and `meta.json`.
///
/// # Example
///
/// ```rust,ignore
/// let mut writer = BlockWriter::create(dir)?;
/// writer.add_series_samples(
///     &Labels::from_pairs([("__name__", "cpu"), ("host", "a")]),
///     &samples,
/// )?;
/// let meta = writer.finish()?;
/// ```
pub struct BlockWriter {
    dir: PathBuf,
    chunks: ChunkWriter,
    index: IndexWriter,
    samples_per_chunk: usize,
    min_time: Timestamp,
    max_time: Timestamp,
    stats: BlockStats,
}

impl BlockWriter {
    /// Creates the block directory (and its parents) and prepares writers.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let chunks = ChunkWriter::new(dir.join(CHUNKS_DIRNAME))?;
        let index = IndexWriter::new(dir.join(INDEX_FILENAME));
        Ok(Self {
            dir,
            chunks,
            index,
            samples_per_chunk: DEFAULT_SAMPLES_PER_CHUNK,
            min_time: i64::MAX,
            max_time: i64::MIN,
            stats: BlockStats::default(),
        })
    }

    /// Sets how many samples [`BlockWriter::add_series_samples`] puts in one chunk.
    pub fn with_samples_per_chunk(mut self, n: usize) -> Self {
        self.samples_per_chunk = n.clamp(1, u16::MAX as usize);
        self
    }

    /// Sets the chunk segment size bound.
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.chunks = self.chunks.with_max_segment_size(size);
        self
    }

    /// Adds a series whose chunks are given explicitly, one sample run per chunk.
    ///
    /// An empty run produces an empty chunk, which is still indexed.
    pub fn add_series(&mut self, labels: &Labels, chunks: &[Vec<(Timestamp, f64)>]) -> Result<()> {
        let mut metas = Vec::with_capacity(chunks.len());
        for samples in chunks {
            metas.push(self.write_chunk(samples)?);
        }
        self.index.add_series(labels, &metas)?;
        self.stats.num_series += 1;
        debug!("Added series {} with {} chunks", labels, metas.len());
        Ok(())
    }

    /// Adds a series, cutting its samples into chunks of the configured size.
    pub fn add_series_samples(
        &mut self,
        labels: &Labels,
        samples: &[(Timestamp, f64)],
    ) -> Result<()> {
        let runs: Vec<Vec<(Timestamp, f64)>> = samples
            .chunks(self.samples_per_chunk)
            .map(|run| run.to_vec())
            .collect();
        self.add_series(labels, &runs)
    }

    fn write_chunk(&mut self, samples: &[(Timestamp, f64)]) -> Result<ChunkMeta> {
        if samples.len() > u16::MAX as usize {
            return Err(Error::Corrupted(format!(
                "{} samples do not fit one chunk",
                samples.len()
            )));
        }

        let mut appender = ChunkAppender::new();
        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;
        for &(ts, value) in samples {
            appender.append(ts, value)?;
            min_time = min_time.min(ts);
            max_time = max_time.max(ts);
        }
        if samples.is_empty() {
            min_time = 0;
            max_time = 0;
        } else {
            self.min_time = self.min_time.min(min_time);
            self.max_time = self.max_time.max(max_time);
        }

        let chunk = appender.finish();
        let chunk_ref = self.chunks.write_chunk(&chunk)?;
        self.stats.num_chunks += 1;
        self.stats.num_samples += samples.len() as u64;

        Ok(ChunkMeta {
            chunk_ref,
            min_time,
            max_time,
            num_samples: samples.len() as u32,
        })
    }

    /// Finishes chunk segments and index, then writes `meta.json`.
    pub fn finish(self) -> Result<BlockMeta> {
        let segments = self.chunks.finish()?;
        self.index.finish()?;

        let (min_time, max_time) = if self.stats.num_samples == 0 {
            (0, 0)
        } else {
            (self.min_time, self.max_time)
        };
        let meta = BlockMeta {
            version: META_VERSION,
            min_time,
            max_time,
            stats: self.stats,
        };

        let file = File::create(self.dir.join(META_FILENAME))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &meta)?;
        writer.flush()?;

        debug!(
            "Finished block {}: {} series, {} chunks, {} segments",
            self.dir.display(),
            meta.stats.num_series,
            meta.stats.num_chunks,
            segments
        );
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use tempfile::TempDir;

    #[test]
    fn test_block_roundtrip() {
        let dir = TempDir::new().unwrap();
        let labels = Labels::from_pairs([("__name__", "cpu"), ("host", "a")]);
        let samples: Vec<(i64, f64)> = (0..250).map(|i| (1000 + i * 10, i as f64)).collect();

        let mut writer = BlockWriter::create(dir.path()).unwrap();
        writer.add_series_samples(&labels, &samples).unwrap();
        let meta = writer.finish().unwrap();

        assert_eq!(meta.stats.num_series, 1);
        assert_eq!(meta.stats.num_chunks, 3);
        assert_eq!(meta.stats.num_samples, 250);
        assert_eq!(meta.min_time, 1000);
        assert_eq!(meta.max_time, 1000 + 249 * 10);

        let block = Block::open(dir.path()).unwrap();
        assert_eq!(block.meta(), &meta);

        let index = block.index().unwrap();
        let mut chunks = block.chunks().unwrap();
        let series_ref = index.postings().next().unwrap();
        let (read_labels, metas) = index.series(series_ref).unwrap();
        assert_eq!(read_labels, labels);
        assert_eq!(
            metas.iter().map(|m| m.num_samples).collect::<Vec<_>>(),
            vec![120, 120, 10]
        );

        let mut decoded = Vec::new();
        for meta in &metas {
            let chunk = chunks.chunk(meta.chunk_ref).unwrap();
            for sample in chunk.iter() {
                decoded.push(sample.unwrap());
            }
        }
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_empty_block() {
        let dir = TempDir::new().unwrap();
        let meta = BlockWriter::create(dir.path()).unwrap().finish().unwrap();
        assert_eq!(meta.stats, BlockStats::default());
        assert_eq!((meta.min_time, meta.max_time), (0, 0));

        let block = Block::open(dir.path()).unwrap();
        assert_eq!(block.index().unwrap().series_count(), 0);
        assert_eq!(block.chunks().unwrap().segment_count(), 0);
    }

    #[test]
    fn test_empty_chunk_is_indexed() {
        let dir = TempDir::new().unwrap();
        let labels = Labels::from_pairs([("__name__", "idle")]);
        let mut writer = BlockWriter::create(dir.path()).unwrap();
        writer.add_series(&labels, &[vec![]]).unwrap();
        writer.finish().unwrap();

        let block = Block::open(dir.path()).unwrap();
        let index = block.index().unwrap();
        let (_, metas) = index.series(index.postings().next().unwrap()).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].num_samples, 0);

        let chunk = block.chunks().unwrap().chunk(metas[0].chunk_ref).unwrap();
        assert!(chunk.iter().next().is_none());
    }
}
