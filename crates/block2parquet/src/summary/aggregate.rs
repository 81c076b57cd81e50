//! Per-chunk aggregation.
//!
//! Every chunk is reduced to one [`SummaryRecord`]: sample count, timestamp
//! range and value range over the samples whose value is finite. NaN and
//! ±Inf samples are skipped entirely.
//!
//! # Seeding
//!
//! Under [`SentinelPolicy::Zero`] the running minimum and maximum start at
//! zero, not at the first sample. A chunk whose values are all positive
//! therefore reports `min_value == 0.0`, one whose values are all negative
//! reports `max_value == 0.0`, and the same holds for timestamps (so
//! `min_timestamp` is 0 for any chunk with non-negative timestamps). This
//! is the established output of the tool and stays the default.
//! [`SentinelPolicy::FirstSample`] seeds every accumulator from the first
//! finite sample and yields the true ranges.
//!
//! With no finite samples every aggregate is 0 under both policies.

use crate::block::{Chunk, Labels, Timestamp};
use crate::error::Result;

/// How the running min/max accumulators of a chunk are initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SentinelPolicy {
    /// Start all accumulators at zero.
    #[default]
    Zero,
    /// Start all accumulators at the first finite sample.
    FirstSample,
}

/// Aggregate statistics of one chunk, the unit of output.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    /// Label set of the owning series.
    pub labels: Labels,
    /// Value of the `__name__` label, or empty.
    pub metric_name: String,
    /// Stable hash of the label set.
    pub series_hash: u64,
    /// Number of finite samples.
    pub sample_count: u64,
    /// Smallest timestamp among finite samples (see module docs for seeding).
    pub min_timestamp: Timestamp,
    /// Largest timestamp among finite samples.
    pub max_timestamp: Timestamp,
    /// Smallest finite value.
    pub min_value: f64,
    /// Largest finite value.
    pub max_value: f64,
    /// Encoded size of the chunk in bytes, 0 when not known.
    pub chunk_size: u64,
}

/// Running state for one chunk. Owned per call, never shared between chunks.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: u64,
    min_ts: Timestamp,
    max_ts: Timestamp,
    min_value: f64,
    max_value: f64,
    seeded: bool,
}

impl Accumulator {
    fn new(policy: SentinelPolicy) -> Self {
        Self {
            count: 0,
            min_ts: 0,
            max_ts: 0,
            min_value: 0.0,
            max_value: 0.0,
            seeded: policy == SentinelPolicy::Zero,
        }
    }

    fn observe(&mut self, ts: Timestamp, value: f64) {
        if !value.is_finite() {
            return;
        }
        if !self.seeded {
            self.min_ts = ts;
            self.max_ts = ts;
            self.min_value = value;
            self.max_value = value;
            self.seeded = true;
        }

        self.max_value = value.max(self.max_value);
        self.min_value = value.min(self.min_value);
        self.count += 1;
        if ts > self.max_ts {
            self.max_ts = ts;
        }
        if ts < self.min_ts {
            self.min_ts = ts;
        }
    }
}

/// Reduces a sample stream to a summary record.
///
/// `samples` is consumed exactly once. The first `Err` it yields aborts the
/// aggregation and is returned unchanged. `chunk_size` is left at 0.
pub fn summarize<I>(
    labels: &Labels,
    samples: I,
    policy: SentinelPolicy,
) -> Result<SummaryRecord>
where
    I: IntoIterator<Item = Result<(Timestamp, f64)>>,
{
    let mut acc = Accumulator::new(policy);
    for sample in samples {
        let (ts, value) = sample?;
        acc.observe(ts, value);
    }

    Ok(SummaryRecord {
        labels: labels.clone(),
        metric_name: labels.metric_name().to_string(),
        series_hash: labels.stable_hash(),
        sample_count: acc.count,
        min_timestamp: acc.min_ts,
        max_timestamp: acc.max_ts,
        min_value: acc.min_value,
        max_value: acc.max_value,
        chunk_size: 0,
    })
}

/// Decodes and reduces one stored chunk, recording its encoded size.
pub fn summarize_chunk(
    labels: &Labels,
    chunk: &Chunk,
    policy: SentinelPolicy,
) -> Result<SummaryRecord> {
    let mut record = summarize(labels, chunk.iter(), policy)?;
    record.chunk_size = chunk.len() as u64;
    Ok(record)
}
