//! Property-based tests for chunk encoding and aggregation.
//!
//! Timestamps and value bit patterns are unconstrained: the chunk codec
//! falls back to raw 64-bit deltas, so any input must round-trip exactly.

use block2parquet::block::ChunkAppender;
use block2parquet::{summarize_chunk, Labels, SentinelPolicy};
use proptest::prelude::*;

/// Arbitrary samples, including NaN and infinities via raw bit patterns.
fn raw_samples() -> impl Strategy<Value = Vec<(i64, u64)>> {
    prop::collection::vec((any::<i64>(), any::<u64>()), 0..200)
}

/// Regularly spaced samples with a mix of finite and non-finite values.
fn mixed_samples() -> impl Strategy<Value = Vec<(i64, f64)>> {
    let value = prop_oneof![
        8 => -1_000_000.0f64..1_000_000.0,
        1 => Just(f64::NAN),
        1 => Just(f64::INFINITY),
        1 => Just(f64::NEG_INFINITY),
    ];
    (0i64..1_000_000_000_000, 1i64..60_000, prop::collection::vec(value, 0..200)).prop_map(
        |(start, step, values)| {
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (start + i as i64 * step, v))
                .collect()
        },
    )
}

fn encode(samples: &[(i64, f64)]) -> block2parquet::Chunk {
    let mut appender = ChunkAppender::new();
    for &(ts, v) in samples {
        appender.append(ts, v).unwrap();
    }
    appender.finish()
}

proptest! {
    /// Every timestamp and every value bit pattern survives a round trip.
    #[test]
    fn test_chunk_roundtrip_bit_exact(raw in raw_samples()) {
        let samples: Vec<(i64, f64)> = raw
            .iter()
            .map(|&(t, bits)| (t, f64::from_bits(bits)))
            .collect();
        let chunk = encode(&samples);
        prop_assert_eq!(chunk.num_samples() as usize, samples.len());

        let decoded: Vec<(i64, u64)> = chunk
            .iter()
            .map(|s| s.map(|(t, v)| (t, v.to_bits())))
            .collect::<Result<_, _>>()
            .unwrap();
        prop_assert_eq!(decoded, raw);
    }

    /// The record counts exactly the finite samples.
    #[test]
    fn test_sample_count_is_finite_count(samples in mixed_samples()) {
        let chunk = encode(&samples);
        let labels = Labels::from_pairs([("__name__", "prop")]);
        let finite = samples.iter().filter(|(_, v)| v.is_finite()).count() as u64;

        for policy in [SentinelPolicy::Zero, SentinelPolicy::FirstSample] {
            let record = summarize_chunk(&labels, &chunk, policy).unwrap();
            prop_assert_eq!(record.sample_count, finite);
            prop_assert!(record.min_value <= record.max_value);
            prop_assert!(record.min_timestamp <= record.max_timestamp);
            if finite == 0 {
                prop_assert_eq!(record.min_value, 0.0);
                prop_assert_eq!(record.max_value, 0.0);
            }
        }
    }

    /// Seeding from the first sample gives the true finite range.
    #[test]
    fn test_first_sample_range_matches_scan(samples in mixed_samples()) {
        let chunk = encode(&samples);
        let labels = Labels::from_pairs([("__name__", "prop")]);
        let record = summarize_chunk(&labels, &chunk, SentinelPolicy::FirstSample).unwrap();

        let finite: Vec<&(i64, f64)> = samples.iter().filter(|(_, v)| v.is_finite()).collect();
        if let (Some(first), Some(last)) = (finite.first(), finite.last()) {
            let min = finite.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
            let max = finite.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
            prop_assert_eq!(record.min_timestamp, first.0);
            prop_assert_eq!(record.max_timestamp, last.0);
            prop_assert_eq!(record.min_value, min);
            prop_assert_eq!(record.max_value, max);
        }
    }
}
