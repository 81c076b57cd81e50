//! Error and Result types for block export operations.

use crate::block::{ChunkRef, Labels, SeriesRef};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for export operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a failure, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Opening or reading the block, its index, or its chunk store failed.
    Source,
    /// A chunk's sample stream could not be decoded.
    Decode,
    /// Opening, writing or closing a shard file failed.
    Sink,
    /// The export configuration was rejected.
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Source => "source",
            ErrorKind::Decode => "decode",
            ErrorKind::Sink => "sink",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// The error type for block reading, aggregation and shard writing.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid magic bytes in a file header or footer.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported file or metadata format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the computed one.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// The index has no series entry at this reference.
    #[error("Series not found: {0}")]
    SeriesNotFound(SeriesRef),

    /// The chunk store has no chunk at this reference.
    #[error("Chunk not found: {0:#x}")]
    ChunkNotFound(ChunkRef),

    /// A structural inconsistency in an index or chunk segment.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// A chunk's sample stream ended early or is malformed.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A record was written after the writer was closed.
    #[error("Writer already closed")]
    WriterClosed,

    /// Rejected configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Block metadata could not be parsed or written.
    #[error("Block metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    /// Columnar encoder failure.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow batch construction failure.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// An error annotated with the pipeline stage that produced it.
    #[error("{stage}: {source}")]
    Stage {
        /// Classification of the failing stage.
        kind: ErrorKind,
        /// Name of the failing stage.
        stage: &'static str,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// An error annotated with the stage and the series being processed.
    #[error("{stage}({labels}): {source}")]
    Series {
        /// Classification of the failing stage.
        kind: ErrorKind,
        /// Name of the failing stage.
        stage: &'static str,
        /// Rendered label set of the offending series.
        labels: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the classification of this error.
    ///
    /// Context wrappers report the kind they were attached with; bare
    /// errors are classified by their variant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Stage { kind, .. } | Error::Series { kind, .. } => *kind,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Parquet(_) | Error::Arrow(_) | Error::WriterClosed => ErrorKind::Sink,
            Error::InvalidConfig(_) => ErrorKind::Config,
            _ => ErrorKind::Source,
        }
    }

    /// Returns the innermost error beneath any stage annotations.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } | Error::Series { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Attaches stage context to fallible results.
pub(crate) trait ResultExt<T> {
    /// Wraps an error with the failing stage.
    fn stage(self, kind: ErrorKind, stage: &'static str) -> Result<T>;

    /// Wraps an error with the failing stage and the offending series.
    fn series_stage(self, kind: ErrorKind, stage: &'static str, labels: &Labels) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn stage(self, kind: ErrorKind, stage: &'static str) -> Result<T> {
        self.map_err(|e| Error::Stage {
            kind,
            stage,
            source: Box::new(e),
        })
    }

    fn series_stage(self, kind: ErrorKind, stage: &'static str, labels: &Labels) -> Result<T> {
        self.map_err(|e| Error::Series {
            kind,
            stage,
            labels: labels.to_string(),
            source: Box::new(e),
        })
    }
}
