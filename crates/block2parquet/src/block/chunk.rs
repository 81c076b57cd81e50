//! XOR chunk encoding.
//!
//! A chunk stores up to 65,535 samples of one series as a single bit stream
//! in which each sample's timestamp and value are written back to back.
//!
//! # Layout
//!
//! ```text
//! ┌───────────────────────┬──────────────────────────────────────────┐
//! │ num_samples: u16 (LE) │ bit stream (MSB first, zero padded)      │
//! └───────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps (delta-of-delta)
//!
//! - First timestamp: 64 bits raw
//! - Then the delta-of-delta `dod`:
//!   - `0`: `'0'`
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! ## Values (XOR)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Then the XOR with the previous value:
//!   - XOR = 0: `'0'`
//!   - Fits the previous window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading zeros + 6 bits length + meaningful bits
//!
//! NaN and infinite values are stored bit-exactly.

use crate::block::Timestamp;
use crate::error::{Error, Result};
use bitvec::prelude::*;
use std::iter::FusedIterator;

/// Size of the sample count header in bytes.
const CHUNK_HEADER_SIZE: usize = 2;

/// Largest leading-zero count representable in the 5-bit field.
const MAX_LEADING_ZEROS: u32 = 31;

/// Encoding of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChunkEncoding {
    /// Delta-of-delta timestamps interleaved with XOR values.
    #[default]
    Xor = 1,
}

impl ChunkEncoding {
    /// Creates a ChunkEncoding from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Xor),
            _ => None,
        }
    }
}

/// An encoded chunk of samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    encoding: ChunkEncoding,
    data: Vec<u8>,
}

impl Chunk {
    /// Wraps encoded bytes. No validation happens until the chunk is iterated.
    pub fn from_bytes(encoding: ChunkEncoding, data: Vec<u8>) -> Self {
        Self { encoding, data }
    }

    /// Returns the chunk encoding.
    pub fn encoding(&self) -> ChunkEncoding {
        self.encoding
    }

    /// Returns the encoded bytes, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the encoded size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the chunk holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sample count declared in the header, or 0 if the header is missing.
    pub fn num_samples(&self) -> u16 {
        match self.data.get(..CHUNK_HEADER_SIZE) {
            Some(header) => u16::from_le_bytes([header[0], header[1]]),
            None => 0,
        }
    }

    /// Returns a lazy, single-pass iterator over the chunk's samples.
    pub fn iter(&self) -> SampleIter<'_> {
        SampleIter::new(&self.data)
    }
}

impl<'a> IntoIterator for &'a Chunk {
    type Item = Result<(Timestamp, f64)>;
    type IntoIter = SampleIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn push_bits(out: &mut BitVec<u8, Msb0>, value: u64, width: u32) {
    for i in (0..width).rev() {
        out.push((value >> i) & 1 == 1);
    }
}

/// Builds a chunk one sample at a time.
#[derive(Debug, Clone, Default)]
pub struct ChunkAppender {
    bits: BitVec<u8, Msb0>,
    count: u16,
    prev_ts: i64,
    prev_delta: i64,
    prev_value: u64,
    /// Current (leading, trailing) zero window, once one has been written.
    window: Option<(u32, u32)>,
}

impl ChunkAppender {
    /// Creates an empty appender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples appended so far.
    pub fn num_samples(&self) -> u16 {
        self.count
    }

    /// Returns true if no further sample fits in the chunk.
    pub fn is_full(&self) -> bool {
        self.count == u16::MAX
    }

    /// Appends one sample.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the chunk already holds `u16::MAX` samples.
    pub fn append(&mut self, timestamp: Timestamp, value: f64) -> Result<()> {
        if self.is_full() {
            return Err(Error::Corrupted(format!(
                "chunk already holds {} samples",
                u16::MAX
            )));
        }

        let bits = value.to_bits();
        if self.count == 0 {
            push_bits(&mut self.bits, timestamp as u64, 64);
            push_bits(&mut self.bits, bits, 64);
            self.prev_ts = timestamp;
            self.prev_delta = 0;
            self.prev_value = bits;
            self.count = 1;
            return Ok(());
        }

        self.encode_timestamp(timestamp);
        self.encode_value(bits);
        self.count += 1;
        Ok(())
    }

    fn encode_timestamp(&mut self, timestamp: Timestamp) {
        let delta = timestamp.wrapping_sub(self.prev_ts);
        let dod = delta.wrapping_sub(self.prev_delta);
        let out = &mut self.bits;

        if dod == 0 {
            out.push(false);
        } else if (-63..=64).contains(&dod) {
            push_bits(out, 0b10, 2);
            push_bits(out, (dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            push_bits(out, 0b110, 3);
            push_bits(out, (dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            push_bits(out, 0b1110, 4);
            push_bits(out, (dod + 2047) as u64, 12);
        } else {
            push_bits(out, 0b1111, 4);
            push_bits(out, dod as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = timestamp;
    }

    fn encode_value(&mut self, bits: u64) {
        let xor = bits ^ self.prev_value;
        self.prev_value = bits;
        let out = &mut self.bits;

        if xor == 0 {
            out.push(false);
            return;
        }

        let leading = xor.leading_zeros().min(MAX_LEADING_ZEROS);
        let trailing = xor.trailing_zeros();

        match self.window {
            Some((prev_leading, prev_trailing))
                if leading >= prev_leading && trailing >= prev_trailing =>
            {
                out.push(true);
                out.push(false);
                let meaningful = 64 - prev_leading - prev_trailing;
                push_bits(out, xor >> prev_trailing, meaningful);
            }
            _ => {
                out.push(true);
                out.push(true);
                let meaningful = 64 - leading - trailing;
                push_bits(out, leading as u64, 5);
                push_bits(out, (meaningful - 1) as u64, 6);
                push_bits(out, xor >> trailing, meaningful);
                self.window = Some((leading, trailing));
            }
        }
    }

    /// Finishes the chunk.
    pub fn finish(self) -> Chunk {
        let mut data = Vec::with_capacity(CHUNK_HEADER_SIZE + self.bits.as_raw_slice().len());
        data.extend_from_slice(&self.count.to_le_bytes());
        data.extend_from_slice(self.bits.as_raw_slice());
        Chunk::from_bytes(ChunkEncoding::Xor, data)
    }
}

/// Lazy iterator over the samples of an XOR chunk.
///
/// Yields `Ok((timestamp, value))` for every declared sample. A malformed or
/// truncated stream yields a single `Err(Error::Decode)` after which the
/// iterator is exhausted.
pub struct SampleIter<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
    total: u16,
    read: u16,
    failed: bool,
    prev_ts: i64,
    prev_delta: i64,
    prev_value: u64,
    leading: u32,
    trailing: u32,
}

impl<'a> SampleIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        let (total, body, failed) = match data.get(..CHUNK_HEADER_SIZE) {
            Some(header) => (
                u16::from_le_bytes([header[0], header[1]]),
                &data[CHUNK_HEADER_SIZE..],
                false,
            ),
            None => (0, &data[..0], true),
        };
        Self {
            bits: body.view_bits::<Msb0>(),
            pos: 0,
            total,
            read: 0,
            failed,
            prev_ts: 0,
            prev_delta: 0,
            prev_value: 0,
            leading: 0,
            trailing: 0,
        }
    }

    fn read_bit(&mut self) -> Result<bool> {
        let bit = self.bits.get(self.pos).map(|b| *b).ok_or_else(|| {
            Error::Decode(format!(
                "unexpected end of chunk at bit {} (sample {} of {})",
                self.pos, self.read, self.total
            ))
        })?;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, width: u32) -> Result<u64> {
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    fn decode_timestamp(&mut self) -> Result<Timestamp> {
        let dod = if !self.read_bit()? {
            0
        } else if !self.read_bit()? {
            self.read_bits(7)? as i64 - 63
        } else if !self.read_bit()? {
            self.read_bits(9)? as i64 - 255
        } else if !self.read_bit()? {
            self.read_bits(12)? as i64 - 2047
        } else {
            self.read_bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(dod);
        let ts = self.prev_ts.wrapping_add(delta);
        self.prev_delta = delta;
        self.prev_ts = ts;
        Ok(ts)
    }

    fn decode_value(&mut self) -> Result<f64> {
        let xor = if !self.read_bit()? {
            0
        } else if !self.read_bit()? {
            let meaningful = 64 - self.leading - self.trailing;
            self.read_bits(meaningful)? << self.trailing
        } else {
            let leading = self.read_bits(5)? as u32;
            let meaningful = self.read_bits(6)? as u32 + 1;
            if leading + meaningful > 64 {
                return Err(Error::Decode(format!(
                    "invalid XOR window: {} leading zeros, {} meaningful bits",
                    leading, meaningful
                )));
            }
            let trailing = 64 - leading - meaningful;
            self.leading = leading;
            self.trailing = trailing;
            self.read_bits(meaningful)? << trailing
        };

        self.prev_value ^= xor;
        Ok(f64::from_bits(self.prev_value))
    }

    fn decode_next(&mut self) -> Result<(Timestamp, f64)> {
        if self.read == 0 {
            let ts = self.read_bits(64)? as i64;
            let value = self.read_bits(64)?;
            self.prev_ts = ts;
            self.prev_delta = 0;
            self.prev_value = value;
            return Ok((ts, f64::from_bits(value)));
        }
        let ts = self.decode_timestamp()?;
        let value = self.decode_value()?;
        Ok((ts, value))
    }
}

impl Iterator for SampleIter<'_> {
    type Item = Result<(Timestamp, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            // Missing header: report once, then stay exhausted.
            self.failed = false;
            self.read = self.total;
            return Some(Err(Error::Decode("chunk shorter than its header".into())));
        }
        if self.read >= self.total {
            return None;
        }
        match self.decode_next() {
            Ok(sample) => {
                self.read += 1;
                Some(Ok(sample))
            }
            Err(e) => {
                self.read = self.total;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.read) as usize;
        (0, Some(remaining + self.failed as usize))
    }
}

impl FusedIterator for SampleIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(samples: &[(i64, f64)]) -> Chunk {
        let mut appender = ChunkAppender::new();
        for &(ts, v) in samples {
            appender.append(ts, v).unwrap();
        }
        appender.finish()
    }

    fn decode(chunk: &Chunk) -> Vec<(i64, f64)> {
        chunk.iter().collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_roundtrip_regular_interval() {
        let samples: Vec<(i64, f64)> = (0..500)
            .map(|i| (1_600_000_000_000 + i * 15_000, 50.0 + (i as f64 * 0.1).sin()))
            .collect();
        let chunk = encode(&samples);
        assert_eq!(chunk.num_samples(), 500);
        assert_eq!(decode(&chunk), samples);
    }

    #[test]
    fn test_constant_series_compresses() {
        let samples: Vec<(i64, f64)> = (0..1000).map(|i| (i * 10_000, 42.0)).collect();
        let chunk = encode(&samples);
        // Two bits per sample after the first: '0' timestamp, '0' value.
        assert!(chunk.len() <= CHUNK_HEADER_SIZE + 16 + 2 + 1000 * 2 / 8 + 1);
        assert_eq!(decode(&chunk), samples);
    }

    #[test]
    fn test_roundtrip_irregular_timestamps() {
        let samples = vec![
            (1000_i64, 1.0_f64),
            (1010, 1.1),
            (1020, 1.2),
            (1300, 1.1),
            (5000, 1.0),
            (5001, -7.5),
            (9_000_000, 0.0),
            (9_000_001, 0.0),
        ];
        assert_eq!(decode(&encode(&samples)), samples);
    }

    #[test]
    fn test_roundtrip_extreme_deltas() {
        let samples = vec![(i64::MIN, 1.0), (0, 2.0), (i64::MAX, 3.0), (-5, 4.0)];
        assert_eq!(decode(&encode(&samples)), samples);
    }

    #[test]
    fn test_special_values_are_bit_exact() {
        let samples = vec![
            (1, f64::NAN),
            (2, f64::INFINITY),
            (3, 1.5),
            (4, f64::NEG_INFINITY),
            (5, -0.0),
            (6, f64::MIN_POSITIVE),
            (7, f64::MAX),
        ];
        let decoded = decode(&encode(&samples));
        assert_eq!(decoded.len(), samples.len());
        for ((ts, v), (dts, dv)) in samples.iter().zip(decoded.iter()) {
            assert_eq!(ts, dts);
            assert_eq!(v.to_bits(), dv.to_bits());
        }
    }

    #[test]
    fn test_values_with_many_leading_zeros() {
        // XORs with more than 31 leading zeros exercise the capped window.
        let samples = vec![
            (1, f64::from_bits(1)),
            (2, f64::from_bits(3)),
            (3, f64::from_bits(2)),
            (4, f64::from_bits(1 << 40)),
            (5, f64::from_bits((1 << 40) | 1)),
        ];
        let decoded = decode(&encode(&samples));
        for ((_, v), (_, dv)) in samples.iter().zip(decoded.iter()) {
            assert_eq!(v.to_bits(), dv.to_bits());
        }
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = ChunkAppender::new().finish();
        assert_eq!(chunk.num_samples(), 0);
        assert_eq!(chunk.len(), CHUNK_HEADER_SIZE);
        assert!(chunk.iter().next().is_none());
    }

    #[test]
    fn test_truncated_chunk_reports_single_error() {
        let samples: Vec<(i64, f64)> = (0..50).map(|i| (i * 1000, i as f64 * 1.7)).collect();
        let chunk = encode(&samples);
        let cut = Chunk::from_bytes(ChunkEncoding::Xor, chunk.bytes()[..chunk.len() / 2].to_vec());

        let mut iter = cut.iter();
        let mut ok = 0;
        let mut errors = 0;
        for item in iter.by_ref() {
            match item {
                Ok(_) => ok += 1,
                Err(Error::Decode(_)) => errors += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(ok < 50);
        assert_eq!(errors, 1);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_missing_header_is_decode_error() {
        let chunk = Chunk::from_bytes(ChunkEncoding::Xor, vec![7]);
        let mut iter = chunk.iter();
        assert!(matches!(iter.next(), Some(Err(Error::Decode(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_full_appender_rejects_sample() {
        let mut appender = ChunkAppender::new();
        for i in 0..u16::MAX as i64 {
            appender.append(i, 1.0).unwrap();
        }
        assert!(appender.is_full());
        assert!(appender.append(70_000, 1.0).is_err());
        assert_eq!(appender.finish().num_samples(), u16::MAX);
    }

    #[test]
    fn test_encoding_from_u8() {
        assert_eq!(ChunkEncoding::from_u8(1), Some(ChunkEncoding::Xor));
        assert_eq!(ChunkEncoding::from_u8(0), None);
    }
}
