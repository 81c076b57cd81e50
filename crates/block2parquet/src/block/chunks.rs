//! Chunk store: numbered segment files holding encoded chunks.
//!
//! ## Segment Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Segment Header (8 bytes)                                    │
//! │  - Magic: "BCHK" (4 bytes)                                   │
//! │  - Version: u8 (1 byte) = 1                                  │
//! │  - Reserved: 3 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Chunk Records (repeated)                                    │
//! │  - data_len: u32 LE                                          │
//! │  - encoding: u8                                              │
//! │  - data[data_len]                                            │
//! │  - crc32: u32 LE (over encoding + data)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Segments are named with six zero-padded digits starting at `000001`.
//! A [`ChunkRef`] addresses a record by segment number and the byte offset
//! of its `data_len` field.

use crate::block::chunk::{Chunk, ChunkEncoding};
use crate::block::{chunk_ref, split_chunk_ref, ChunkRef};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes for chunk segment headers: "BCHK"
pub const SEGMENT_MAGIC: [u8; 4] = *b"BCHK";

/// Current chunk segment format version.
pub const SEGMENT_VERSION: u8 = 1;

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: u64 = 8;

/// Bytes a record adds around its chunk data: length, encoding, CRC.
pub const RECORD_OVERHEAD: u64 = 4 + 1 + 4;

/// Default upper bound on a segment file's size (512 MiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

/// Returns the path of segment `number` inside `dir`.
pub fn segment_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("{:06}", number))
}

fn record_crc(encoding: u8, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[encoding]);
    hasher.update(data);
    hasher.finalize()
}

/// Appends chunks to segment files, cutting a new segment when the current
/// one would grow past the configured size.
pub struct ChunkWriter {
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
    segment: u32,
    position: u64,
    max_segment_size: u64,
}

impl ChunkWriter {
    /// Creates a writer for the segment directory `dir`, creating it if needed.
    ///
    /// No segment file exists until the first chunk is written.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            writer: None,
            segment: 0,
            position: 0,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
        })
    }

    /// Sets the segment size bound.
    ///
    /// Offsets are stored in 32 bits, so the bound is clamped to `u32::MAX`.
    /// A single chunk larger than the bound still gets a segment of its own.
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size =
            size.clamp(SEGMENT_HEADER_SIZE + RECORD_OVERHEAD, u32::MAX as u64);
        self
    }

    /// Writes a chunk and returns its reference.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be created or written, or if
    /// the chunk does not fit in a segment at all.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<ChunkRef> {
        let record_len = RECORD_OVERHEAD + chunk.len() as u64;
        let data_len = u32::try_from(chunk.len())
            .map_err(|_| Error::Corrupted(format!("chunk of {} bytes too large", chunk.len())))?;

        let needs_cut = match self.writer {
            None => true,
            Some(_) => {
                self.position > SEGMENT_HEADER_SIZE
                    && self.position + record_len > self.max_segment_size
            }
        };
        if needs_cut {
            self.cut()?;
        }

        let offset = u32::try_from(self.position).map_err(|_| {
            Error::Corrupted(format!(
                "segment {} offset {} exceeds 32 bits",
                self.segment, self.position
            ))
        })?;
        let encoding = chunk.encoding() as u8;
        let crc = record_crc(encoding, chunk.bytes());

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Corrupted("no open chunk segment".into()))?;
        writer.write_all(&data_len.to_le_bytes())?;
        writer.write_all(&[encoding])?;
        writer.write_all(chunk.bytes())?;
        writer.write_all(&crc.to_le_bytes())?;
        self.position += record_len;

        Ok(chunk_ref(self.segment, offset))
    }

    /// Closes the current segment and starts the next one.
    fn cut(&mut self) -> Result<()> {
        self.finish_segment()?;

        self.segment += 1;
        let path = segment_path(&self.dir, self.segment);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&SEGMENT_MAGIC)?;
        writer.write_all(&[SEGMENT_VERSION, 0, 0, 0])?;
        self.writer = Some(writer);
        self.position = SEGMENT_HEADER_SIZE;

        debug!("Started chunk segment: {}", path.display());
        Ok(())
    }

    fn finish_segment(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Flushes and syncs the last segment, returning the number of segments written.
    pub fn finish(mut self) -> Result<u32> {
        self.finish_segment()?;
        Ok(self.segment)
    }
}

struct Segment {
    reader: BufReader<File>,
    size: u64,
}

/// Resolves chunk references against a segment directory.
pub struct ChunkReader {
    dir: PathBuf,
    segments: BTreeMap<u32, Segment>,
}

impl ChunkReader {
    /// Opens every segment in `dir` and validates its header.
    ///
    /// Files whose names are not six-digit segment numbers are ignored.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut segments = BTreeMap::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .filter(|n| n.len() == 6 && n.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let file = File::open(entry.path())?;
            let size = file.metadata()?.len();
            let mut reader = BufReader::new(file);

            let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
            reader.read_exact(&mut header)?;
            let magic: [u8; 4] = [header[0], header[1], header[2], header[3]];
            if magic != SEGMENT_MAGIC {
                return Err(Error::InvalidMagic(magic));
            }
            if header[4] > SEGMENT_VERSION {
                return Err(Error::UnsupportedVersion(header[4] as u16));
            }

            segments.insert(number, Segment { reader, size });
        }

        debug!("Opened {} chunk segments in {}", segments.len(), dir.display());
        Ok(Self { dir, segments })
    }

    /// Returns the segment directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of segments found.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Reads and CRC-verifies the chunk at `chunk_ref`.
    ///
    /// # Errors
    ///
    /// - `Error::ChunkNotFound` if the segment does not exist or the offset
    ///   lies outside it.
    /// - `Error::ChecksumMismatch` if the record's CRC does not match.
    /// - `Error::Corrupted` if the record runs past the end of the segment or
    ///   names an unknown encoding.
    pub fn chunk(&mut self, chunk_ref: ChunkRef) -> Result<Chunk> {
        let (number, offset) = split_chunk_ref(chunk_ref);
        let segment = self
            .segments
            .get_mut(&number)
            .ok_or(Error::ChunkNotFound(chunk_ref))?;

        let offset = offset as u64;
        if offset < SEGMENT_HEADER_SIZE || offset + RECORD_OVERHEAD > segment.size {
            return Err(Error::ChunkNotFound(chunk_ref));
        }

        segment.reader.seek(SeekFrom::Start(offset))?;
        let mut buf4 = [0u8; 4];
        segment.reader.read_exact(&mut buf4)?;
        let data_len = u32::from_le_bytes(buf4) as u64;
        if offset + RECORD_OVERHEAD + data_len > segment.size {
            return Err(Error::Corrupted(format!(
                "chunk at segment {} offset {} runs past end of segment ({} bytes)",
                number, offset, segment.size
            )));
        }

        let mut encoding = [0u8; 1];
        segment.reader.read_exact(&mut encoding)?;
        let mut data = vec![0u8; data_len as usize];
        segment.reader.read_exact(&mut data)?;
        segment.reader.read_exact(&mut buf4)?;
        let expected = u32::from_le_bytes(buf4);

        let actual = record_crc(encoding[0], &data);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let encoding = ChunkEncoding::from_u8(encoding[0])
            .ok_or_else(|| Error::Corrupted(format!("unknown chunk encoding {}", encoding[0])))?;
        Ok(Chunk::from_bytes(encoding, data))
    }
}
