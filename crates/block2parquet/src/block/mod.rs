//! Time series storage block.
//!
//! A block is an immutable directory holding every series and chunk for a
//! time window:
//!
//! ```text
//! <block>/
//! ├── meta.json      BlockMeta (time range, counts, format version)
//! ├── index          series label sets, chunk metadata, postings
//! └── chunks/
//!     ├── 000001     chunk segment files
//!     └── 000002
//! ```
//!
//! [`BlockWriter`] builds blocks; [`Block`] opens them and hands out an
//! [`IndexReader`] and a [`ChunkReader`].

pub mod chunk;
pub mod chunks;
pub mod index;
pub mod writer;

pub use chunk::{Chunk, ChunkAppender, ChunkEncoding, SampleIter};
pub use chunks::{ChunkReader, ChunkWriter};
pub use index::{IndexReader, IndexWriter};
pub use writer::BlockWriter;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Timestamp in source-defined units (milliseconds for most blocks).
pub type Timestamp = i64;

/// Reference to a series entry: its byte offset inside the index file.
pub type SeriesRef = u64;

/// Reference to a chunk: segment number in the upper 32 bits, byte offset
/// within the segment in the lower 32 bits.
pub type ChunkRef = u64;

/// Label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Name of the metadata file inside a block directory.
pub const META_FILENAME: &str = "meta.json";

/// Name of the index file inside a block directory.
pub const INDEX_FILENAME: &str = "index";

/// Name of the chunk segment directory inside a block directory.
pub const CHUNKS_DIRNAME: &str = "chunks";

/// Current block metadata version.
pub const META_VERSION: u16 = 1;

/// Packs a segment number and byte offset into a [`ChunkRef`].
pub fn chunk_ref(segment: u32, offset: u32) -> ChunkRef {
    ((segment as u64) << 32) | offset as u64
}

/// Splits a [`ChunkRef`] into segment number and byte offset.
pub fn split_chunk_ref(chunk_ref: ChunkRef) -> (u32, u32) {
    ((chunk_ref >> 32) as u32, chunk_ref as u32)
}

/// A single name/value label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

/// The label set identifying a series.
///
/// Labels are kept sorted by name; names are unique. When built from pairs
/// with a repeated name, the last value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a label set from name/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = Vec::new();
        for (name, value) in pairs {
            let name = name.into();
            let value = value.into();
            match labels.iter_mut().find(|l| l.name == name) {
                Some(existing) => existing.value = value,
                None => labels.push(Label { name, value }),
            }
        }
        labels.sort();
        Self(labels)
    }

    /// Returns the value of the named label.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Returns the metric name, or `""` if the series has none.
    pub fn metric_name(&self) -> &str {
        self.get(METRIC_NAME_LABEL).unwrap_or_default()
    }

    /// Iterates labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable 64-bit hash of the label set.
    ///
    /// `xxh64` over `name 0xff value 0xff` for every label in name order.
    /// The separator cannot appear in valid UTF-8, so distinct label sets
    /// never share an input.
    pub fn stable_hash(&self) -> u64 {
        let capacity = self.0.iter().map(|l| l.name.len() + l.value.len() + 2).sum();
        let mut buf = Vec::with_capacity(capacity);
        for label in &self.0 {
            buf.extend_from_slice(label.name.as_bytes());
            buf.push(0xff);
            buf.extend_from_slice(label.value.as_bytes());
            buf.push(0xff);
        }
        xxhash_rust::xxh64::xxh64(&buf, 0)
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

/// Location and time range of one chunk of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Where the chunk lives in the chunk store.
    pub chunk_ref: ChunkRef,
    /// First sample timestamp.
    pub min_time: Timestamp,
    /// Last sample timestamp.
    pub max_time: Timestamp,
    /// Number of samples encoded in the chunk.
    pub num_samples: u32,
}

/// Aggregate counts recorded in `meta.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    /// Number of series in the block.
    pub num_series: u64,
    /// Number of chunks in the block.
    pub num_chunks: u64,
    /// Number of samples in the block.
    pub num_samples: u64,
}

/// Contents of a block's `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Metadata format version.
    pub version: u16,
    /// Smallest sample timestamp in the block.
    pub min_time: Timestamp,
    /// Largest sample timestamp in the block.
    pub max_time: Timestamp,
    /// Series, chunk and sample counts.
    pub stats: BlockStats,
}

impl BlockMeta {
    /// Reads and validates `meta.json` from a block directory.
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let file = File::open(dir.join(META_FILENAME))?;
        let meta: BlockMeta = serde_json::from_reader(BufReader::new(file))?;
        if meta.version > META_VERSION {
            return Err(Error::UnsupportedVersion(meta.version));
        }
        Ok(meta)
    }
}

/// An opened, read-only block directory.
#[derive(Debug)]
pub struct Block {
    dir: PathBuf,
    meta: BlockMeta,
}

impl Block {
    /// Opens the block at `dir`, validating its metadata.
    ///
    /// The index and chunk store are opened separately through
    /// [`Block::index`] and [`Block::chunks`].
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta = BlockMeta::read_from_dir(&dir)?;
        Ok(Self { dir, meta })
    }

    /// Returns the block directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the block metadata.
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Opens the block's series index.
    pub fn index(&self) -> Result<IndexReader> {
        IndexReader::open(&self.dir.join(INDEX_FILENAME))
    }

    /// Opens the block's chunk store.
    pub fn chunks(&self) -> Result<ChunkReader> {
        ChunkReader::open(&self.dir.join(CHUNKS_DIRNAME))
    }
}
