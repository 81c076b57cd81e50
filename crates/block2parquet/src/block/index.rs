//! Series index file.
//!
//! The index lists every series of a block with its label set and the
//! metadata of its chunks, followed by postings that enumerate the series in
//! label order.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (16 bytes)                                           │
//! │  - Magic: "BIDX" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! │  - Series Count: u32 (4 bytes)                               │
//! │  - Reserved: 4 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Series Entries (repeated, addressed by byte offset)         │
//! │  - label_count: u16, [(len: u16, name, len: u16, value)]     │
//! │  - chunk_count: u32, [(ref: u64, min: i64, max: i64, n: u32)]│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Postings                                                    │
//! │  - count: u32, [series_ref: u64] in label order              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (32 bytes)                                           │
//! │  - Series offset, postings offset, CRC, reverse magic        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::block::{ChunkMeta, Labels, SeriesRef};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the index header: "BIDX"
pub const INDEX_MAGIC: [u8; 4] = *b"BIDX";

/// Reverse magic bytes for the index footer: "XDIB"
pub const INDEX_MAGIC_REVERSE: [u8; 4] = *b"XDIB";

/// Current index format version.
pub const INDEX_VERSION: u16 = 1;

/// Header size in bytes.
pub const INDEX_HEADER_SIZE: usize = 16;

/// Footer size in bytes.
pub const INDEX_FOOTER_SIZE: usize = 32;

/// Index footer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexFooter {
    series_offset: u64,
    postings_offset: u64,
    file_crc32: u32,
}

impl IndexFooter {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.series_offset.to_le_bytes())?;
        writer.write_all(&self.postings_offset.to_le_bytes())?;
        writer.write_all(&self.file_crc32.to_le_bytes())?;
        writer.write_all(&[0u8; 4])?;
        writer.write_all(&INDEX_MAGIC_REVERSE)?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    fn read_from(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let series_offset = read_u64(&mut cursor)?;
        let postings_offset = read_u64(&mut cursor)?;
        let file_crc32 = read_u32(&mut cursor)?;
        let _reserved = read_u32(&mut cursor)?;
        let mut magic = [0u8; 4];
        read_exact(&mut cursor, &mut magic)?;
        if magic != INDEX_MAGIC_REVERSE {
            return Err(Error::InvalidMagic(magic));
        }
        Ok(Self {
            series_offset,
            postings_offset,
            file_crc32,
        })
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Corrupted("index entry truncated".into()),
        _ => Error::Io(e),
    })
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u16(reader)? as usize;
    let mut bytes = vec![0u8; len];
    read_exact(reader, &mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| Error::Corrupted(format!("Invalid UTF-8 in label: {}", e)))
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::Corrupted(format!("label of {} bytes exceeds 65535", s.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Builds an index file.
///
/// Entries are encoded in memory as they are added; [`IndexWriter::finish`]
/// appends postings and footer and writes the file in one go.
pub struct IndexWriter {
    path: PathBuf,
    buf: Vec<u8>,
    postings: BTreeMap<Labels, SeriesRef>,
}

impl IndexWriter {
    /// Creates a writer for the index at `path`. Nothing is written until
    /// [`IndexWriter::finish`].
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            buf: vec![0u8; INDEX_HEADER_SIZE],
            postings: BTreeMap::new(),
        }
    }

    /// Adds a series and returns its reference.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the label set was already added or a
    /// label does not fit the on-disk length fields.
    pub fn add_series(&mut self, labels: &Labels, chunks: &[ChunkMeta]) -> Result<SeriesRef> {
        if self.postings.contains_key(labels) {
            return Err(Error::Corrupted(format!("duplicate series {}", labels)));
        }
        let label_count = u16::try_from(labels.len())
            .map_err(|_| Error::Corrupted(format!("too many labels: {}", labels.len())))?;
        let chunk_count = u32::try_from(chunks.len())
            .map_err(|_| Error::Corrupted(format!("too many chunks: {}", chunks.len())))?;

        let mut entry = Vec::new();
        entry.extend_from_slice(&label_count.to_le_bytes());
        for label in labels.iter() {
            write_string(&mut entry, &label.name)?;
            write_string(&mut entry, &label.value)?;
        }
        entry.extend_from_slice(&chunk_count.to_le_bytes());
        for meta in chunks {
            entry.extend_from_slice(&meta.chunk_ref.to_le_bytes());
            entry.extend_from_slice(&meta.min_time.to_le_bytes());
            entry.extend_from_slice(&meta.max_time.to_le_bytes());
            entry.extend_from_slice(&meta.num_samples.to_le_bytes());
        }

        let series_ref = self.buf.len() as SeriesRef;
        self.buf.extend_from_slice(&entry);
        self.postings.insert(labels.clone(), series_ref);
        Ok(series_ref)
    }

    /// Number of series added so far.
    pub fn series_count(&self) -> usize {
        self.postings.len()
    }

    /// Writes postings, header and footer, then flushes and syncs the file.
    ///
    /// Returns the number of series in the index.
    pub fn finish(mut self) -> Result<u32> {
        let series_count = u32::try_from(self.postings.len())
            .map_err(|_| Error::Corrupted("too many series".into()))?;

        let postings_offset = self.buf.len() as u64;
        self.buf.extend_from_slice(&series_count.to_le_bytes());
        for series_ref in self.postings.values() {
            self.buf.extend_from_slice(&series_ref.to_le_bytes());
        }

        let mut header = Vec::with_capacity(INDEX_HEADER_SIZE);
        header.extend_from_slice(&INDEX_MAGIC);
        header.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        header.extend_from_slice(&[0u8; 2]);
        header.extend_from_slice(&series_count.to_le_bytes());
        header.extend_from_slice(&[0u8; 4]);
        self.buf[..INDEX_HEADER_SIZE].copy_from_slice(&header);

        let footer = IndexFooter {
            series_offset: INDEX_HEADER_SIZE as u64,
            postings_offset,
            file_crc32: crc32fast::hash(&self.buf),
        };
        footer.write_to(&mut self.buf)?;

        let mut file = File::create(&self.path)?;
        file.write_all(&self.buf)?;
        file.sync_all()?;
        Ok(series_count)
    }
}

/// Reads an index file.
///
/// The whole file is loaded and CRC-verified on open; series entries are
/// decoded on demand.
#[derive(Debug)]
pub struct IndexReader {
    path: PathBuf,
    data: Vec<u8>,
    series_end: usize,
    postings: Vec<SeriesRef>,
}

impl IndexReader {
    /// Opens and validates the index at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The magic bytes are invalid
    /// - The version is unsupported
    /// - The checksum does not match
    /// - The postings reference entries outside the series section
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        if data.len() < INDEX_HEADER_SIZE + INDEX_FOOTER_SIZE {
            return Err(Error::Corrupted(format!(
                "index of {} bytes is smaller than header and footer",
                data.len()
            )));
        }

        let magic: [u8; 4] = [data[0], data[1], data[2], data[3]];
        if magic != INDEX_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > INDEX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let footer_start = data.len() - INDEX_FOOTER_SIZE;
        let footer = IndexFooter::read_from(&data[footer_start..])?;
        let actual = crc32fast::hash(&data[..footer_start]);
        if actual != footer.file_crc32 {
            return Err(Error::ChecksumMismatch {
                expected: footer.file_crc32,
                actual,
            });
        }

        let series_end = footer.postings_offset as usize;
        if footer.series_offset as usize != INDEX_HEADER_SIZE || series_end > footer_start {
            return Err(Error::Corrupted("index section offsets out of range".into()));
        }

        let mut cursor = Cursor::new(&data[series_end..footer_start]);
        let count = read_u32(&mut cursor)? as usize;
        // Count is untrusted until every entry has been read.
        let mut postings = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let series_ref = read_u64(&mut cursor)?;
            if series_ref < INDEX_HEADER_SIZE as u64 || series_ref >= series_end as u64 {
                return Err(Error::Corrupted(format!(
                    "posting {} outside series section",
                    series_ref
                )));
            }
            postings.push(series_ref);
        }

        Ok(Self {
            path: path.to_path_buf(),
            data,
            series_end,
            postings,
        })
    }

    /// Returns the index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of series in the index.
    pub fn series_count(&self) -> usize {
        self.postings.len()
    }

    /// Iterates series references in label order.
    pub fn postings(&self) -> impl Iterator<Item = SeriesRef> + '_ {
        self.postings.iter().copied()
    }

    /// Decodes the series entry at `series_ref`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SeriesNotFound` if the reference lies outside the
    /// series section, `Error::Corrupted` if the entry cannot be decoded.
    pub fn series(&self, series_ref: SeriesRef) -> Result<(Labels, Vec<ChunkMeta>)> {
        if series_ref < INDEX_HEADER_SIZE as u64 || series_ref >= self.series_end as u64 {
            return Err(Error::SeriesNotFound(series_ref));
        }
        let mut cursor = Cursor::new(&self.data[series_ref as usize..self.series_end]);

        let label_count = read_u16(&mut cursor)? as usize;
        let mut pairs = Vec::with_capacity(label_count);
        for _ in 0..label_count {
            let name = read_string(&mut cursor)?;
            let value = read_string(&mut cursor)?;
            pairs.push((name, value));
        }

        let chunk_count = read_u32(&mut cursor)? as usize;
        let mut chunks = Vec::with_capacity(chunk_count.min(4096));
        for _ in 0..chunk_count {
            let chunk_ref = read_u64(&mut cursor)?;
            let min_time = read_u64(&mut cursor)? as i64;
            let max_time = read_u64(&mut cursor)? as i64;
            let num_samples = read_u32(&mut cursor)?;
            chunks.push(ChunkMeta {
                chunk_ref,
                min_time,
                max_time,
                num_samples,
            });
        }

        Ok((Labels::from_pairs(pairs), chunks))
    }
}
