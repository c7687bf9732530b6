//! Time-series buckets with Gorilla compression.
//!
//! Points for one series land in hourly buckets under the `ts` CF.
//! Timestamps are delta-of-delta encoded, values XOR encoded — the
//! classic layout for monotone-ish streams.

use crate::storage::keys::{prefix_upper_bound, ts_key, ts_series_prefix};
use crate::storage::{SnapshotView, CF_TS, SCAN_BATCH_SIZE};
use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};

/// Bucket span: one hour of points per KV value.
pub const BUCKET_SPAN_MS: i64 = 3_600_000;

/// One observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TsPoint {
    pub ts: i64,
    pub value: f64,
}

/// Bucket id for a timestamp.
pub fn bucket_id(ts_ms: i64) -> u64 {
    (ts_ms.div_euclid(BUCKET_SPAN_MS)) as u64
}

struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self { bytes: Vec::new(), bit: 0 }
    }

    fn push_bit(&mut self, b: bool) {
        if self.bit == 0 {
            self.bytes.push(0);
        }
        if b {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << (7 - self.bit);
        }
        self.bit = (self.bit + 1) % 8;
    }

    fn push_bits(&mut self, value: u64, count: u32) {
        for i in (0..count).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool> {
        let byte = self.pos / 8;
        if byte >= self.bytes.len() {
            return Err(ThemisError::IndexCorrupt("ts bucket truncated".into()));
        }
        let bit = (self.bytes[byte] >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    fn read_bits(&mut self, count: u32) -> Result<u64> {
        let mut v = 0u64;
        for _ in 0..count {
            v = (v << 1) | u64::from(self.read_bit()?);
        }
        Ok(v)
    }
}

/// Compress a sorted run of points into one bucket payload.
pub fn compress(points: &[TsPoint]) -> Vec<u8> {
    let mut out = (points.len() as u32).to_le_bytes().to_vec();
    if points.is_empty() {
        return out;
    }

    let mut bits = BitWriter::new();
    bits.push_bits(points[0].ts as u64, 64);
    bits.push_bits(points[0].value.to_bits(), 64);

    let mut prev_ts = points[0].ts;
    let mut prev_delta: i64 = 0;
    let mut prev_value = points[0].value.to_bits();
    let mut prev_leading = 64u32;
    let mut prev_trailing = 64u32;

    for point in &points[1..] {
        // Delta-of-delta timestamps.
        let delta = point.ts - prev_ts;
        let dod = delta - prev_delta;
        prev_ts = point.ts;
        prev_delta = delta;

        match dod {
            0 => bits.push_bit(false),
            -63..=64 => {
                bits.push_bits(0b10, 2);
                bits.push_bits((dod + 63) as u64, 7);
            }
            -255..=256 => {
                bits.push_bits(0b110, 3);
                bits.push_bits((dod + 255) as u64, 9);
            }
            -2047..=2048 => {
                bits.push_bits(0b1110, 4);
                bits.push_bits((dod + 2047) as u64, 12);
            }
            _ => {
                bits.push_bits(0b1111, 4);
                bits.push_bits(dod as u64, 64);
            }
        }

        // XOR values.
        let value = point.value.to_bits();
        let xor = value ^ prev_value;
        prev_value = value;
        if xor == 0 {
            bits.push_bit(false);
        } else {
            bits.push_bit(true);
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();
            if leading >= prev_leading && trailing >= prev_trailing && prev_leading + prev_trailing < 64 {
                bits.push_bit(false);
                let len = 64 - prev_leading - prev_trailing;
                bits.push_bits(xor >> prev_trailing, len);
            } else {
                bits.push_bit(true);
                let len = 64 - leading - trailing;
                bits.push_bits(leading as u64, 6);
                bits.push_bits((len - 1) as u64, 6);
                bits.push_bits(xor >> trailing, len);
                prev_leading = leading;
                prev_trailing = trailing;
            }
        }
    }

    out.extend_from_slice(&bits.finish());
    out
}

/// Decompress one bucket payload.
pub fn decompress(bytes: &[u8]) -> Result<Vec<TsPoint>> {
    if bytes.len() < 4 {
        return Err(ThemisError::IndexCorrupt("ts bucket header truncated".into()));
    }
    let count = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    let mut points = Vec::with_capacity(count);
    if count == 0 {
        return Ok(points);
    }

    let mut bits = BitReader::new(&bytes[4..]);
    let first_ts = bits.read_bits(64)? as i64;
    let first_value = f64::from_bits(bits.read_bits(64)?);
    points.push(TsPoint { ts: first_ts, value: first_value });

    let mut prev_ts = first_ts;
    let mut prev_delta: i64 = 0;
    let mut prev_value = first_value.to_bits();
    let mut prev_leading = 64u32;
    let mut prev_trailing = 64u32;

    for _ in 1..count {
        let dod = if !bits.read_bit()? {
            0i64
        } else if !bits.read_bit()? {
            bits.read_bits(7)? as i64 - 63
        } else if !bits.read_bit()? {
            bits.read_bits(9)? as i64 - 255
        } else if !bits.read_bit()? {
            bits.read_bits(12)? as i64 - 2047
        } else {
            bits.read_bits(64)? as i64
        };
        prev_delta += dod;
        prev_ts += prev_delta;

        let value = if !bits.read_bit()? {
            prev_value
        } else if !bits.read_bit()? {
            let len = 64 - prev_leading - prev_trailing;
            let meaningful = bits.read_bits(len)?;
            prev_value ^ (meaningful << prev_trailing)
        } else {
            let leading = bits.read_bits(6)? as u32;
            let len = bits.read_bits(6)? as u32 + 1;
            let trailing = 64 - leading - len;
            let meaningful = bits.read_bits(len)?;
            prev_leading = leading;
            prev_trailing = trailing;
            prev_value ^ (meaningful << trailing)
        };
        prev_value = value;
        points.push(TsPoint { ts: prev_ts, value: f64::from_bits(value) });
    }
    Ok(points)
}

/// Merge a new point into a bucket payload, keeping sort order.
pub fn merge_point(existing: Option<&[u8]>, point: TsPoint) -> Result<Vec<u8>> {
    let mut points = match existing {
        Some(bytes) => decompress(bytes)?,
        None => Vec::new(),
    };
    let pos = points.partition_point(|p| p.ts <= point.ts);
    points.insert(pos, point);
    Ok(compress(&points))
}

/// Key of the bucket a point belongs to.
pub fn bucket_key(collection: &str, series_key: &str, ts_ms: i64) -> Vec<u8> {
    ts_key(collection, series_key, bucket_id(ts_ms))
}

/// Scan a series over `[from, to]` (ms, inclusive) under a snapshot.
pub fn scan_series(
    view: &SnapshotView<'_>,
    collection: &str,
    series_key: &str,
    from_ms: i64,
    to_ms: i64,
) -> Result<Vec<TsPoint>> {
    let lower = ts_key(collection, series_key, bucket_id(from_ms));
    let upper = {
        // One past the last bucket.
        ts_key(collection, series_key, bucket_id(to_ms) + 1)
    };
    let mut out = Vec::new();
    let mut resume: Option<Vec<u8>> = None;
    loop {
        let batch = view.scan_batch(CF_TS, &lower, &upper, resume.as_deref(), SCAN_BATCH_SIZE)?;
        if batch.is_empty() {
            break;
        }
        for (_, value) in &batch {
            for point in decompress(value)? {
                if point.ts >= from_ms && point.ts <= to_ms {
                    out.push(point);
                }
            }
        }
        resume = Some(batch.last().unwrap().0.clone());
    }
    Ok(out)
}

/// All bucket keys of a series older than `before_ms` (retention sweep).
pub fn expired_buckets(
    view: &SnapshotView<'_>,
    collection: &str,
    series_key: &str,
    before_ms: i64,
) -> Result<Vec<Vec<u8>>> {
    let prefix = ts_series_prefix(collection, series_key);
    let upper = prefix_upper_bound(&prefix);
    let cutoff = bucket_id(before_ms);
    let mut out = Vec::new();
    let mut resume: Option<Vec<u8>> = None;
    loop {
        let batch = view.scan_batch(CF_TS, &prefix, &upper, resume.as_deref(), SCAN_BATCH_SIZE)?;
        if batch.is_empty() {
            break;
        }
        for (key, _) in &batch {
            let tail: [u8; 8] = key[key.len() - 8..]
                .try_into()
                .map_err(|_| ThemisError::IndexCorrupt("bad ts key".into()))?;
            if u64::from_be_bytes(tail) < cutoff {
                out.push(key.clone());
            }
        }
        resume = Some(batch.last().unwrap().0.clone());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(n: usize) -> Vec<TsPoint> {
        (0..n)
            .map(|i| TsPoint {
                ts: 1_700_000_000_000 + (i as i64) * 1000 + (i as i64 % 3),
                value: 20.0 + (i as f64 * 0.1).sin(),
            })
            .collect()
    }

    #[test]
    fn test_compress_roundtrip() {
        let points = series(500);
        let bytes = compress(&points);
        let restored = decompress(&bytes).unwrap();
        assert_eq!(restored, points);
    }

    #[test]
    fn test_compression_beats_raw() {
        let points = series(1000);
        let bytes = compress(&points);
        let raw = points.len() * 16;
        assert!(bytes.len() < raw / 2, "compressed {} raw {}", bytes.len(), raw);
    }

    #[test]
    fn test_roundtrip_constant_values() {
        let points: Vec<TsPoint> = (0..100)
            .map(|i| TsPoint { ts: 1000 * i, value: 42.0 })
            .collect();
        assert_eq!(decompress(&compress(&points)).unwrap(), points);
    }

    #[test]
    fn test_roundtrip_irregular_deltas() {
        let points = vec![
            TsPoint { ts: 0, value: 1.0 },
            TsPoint { ts: 5, value: -2.5 },
            TsPoint { ts: 100_000, value: f64::MAX },
            TsPoint { ts: 100_001, value: f64::MIN_POSITIVE },
        ];
        assert_eq!(decompress(&compress(&points)).unwrap(), points);
    }

    #[test]
    fn test_empty_bucket() {
        assert_eq!(decompress(&compress(&[])).unwrap(), vec![]);
    }

    #[test]
    fn test_merge_point_keeps_order() {
        let bytes = compress(&[
            TsPoint { ts: 10, value: 1.0 },
            TsPoint { ts: 30, value: 3.0 },
        ]);
        let merged = merge_point(Some(&bytes), TsPoint { ts: 20, value: 2.0 }).unwrap();
        let points = decompress(&merged).unwrap();
        assert_eq!(points.iter().map(|p| p.ts).collect::<Vec<_>>(), vec![10, 20, 30]);
    }

    #[test]
    fn test_bucket_id_span() {
        assert_eq!(bucket_id(0), 0);
        assert_eq!(bucket_id(BUCKET_SPAN_MS - 1), 0);
        assert_eq!(bucket_id(BUCKET_SPAN_MS), 1);
    }
}
