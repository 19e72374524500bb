use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoded size of a sample: 8-byte nanosecond epoch plus two 8-byte
/// byte counters.
pub const SAMPLE_SIZE: usize = 24;

/// Errors from the fixed-layout sample codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The stored value is not exactly [`SAMPLE_SIZE`] bytes.
    #[error("invalid buffer size: {0} bytes, want {SAMPLE_SIZE}")]
    InvalidBuffer(usize),
}

/// Resolution identifies one of the four time buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Minute,
    Hour,
    Day,
    Month,
}

impl Resolution {
    /// Returns the canonical bucket name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "min",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "mon",
        }
    }

    /// UTC label format for this resolution.
    const fn format(self) -> &'static str {
        match self {
            Self::Minute => "%m%d%Y%H%M",
            Self::Hour => "%m%d%Y%H",
            Self::Day => "%m%d%Y",
            Self::Month => "%m%Y",
        }
    }

    /// Format a timestamp into this resolution's bucket key.
    pub fn label(self, ts: DateTime<Utc>) -> String {
        ts.format(self.format()).to_string()
    }

    /// Return all resolutions, finest first.
    pub fn all() -> &'static [Resolution] {
        &[Self::Minute, Self::Hour, Self::Day, Self::Month]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurement is the capability set the bucket engine needs from a stored
/// value: ordering against the engine's high-water mark, folding into an
/// accumulator, the fixed binary codec, and timestamp access.
///
/// The `Default` bound supplies fresh accumulators for fold results; bucket
/// code must never fold into the inserted sample itself.
pub trait Measurement: Clone + Default + Send + Sync + 'static {
    /// True when this measurement's timestamp is at or after `ts`.
    fn at_or_after(&self, ts: DateTime<Utc>) -> bool;

    /// Fold `other` into this accumulator: component-wise byte sums, and
    /// the accumulator timestamp becomes the latest contributing timestamp.
    fn merge(&mut self, other: &Self);

    /// Encode to the fixed binary layout.
    fn encode(&self) -> Vec<u8>;

    /// Decode from the fixed binary layout. Rejects any buffer whose
    /// length is not exactly the encoded size.
    fn decode(buf: &[u8]) -> Result<Self, CodecError>;

    /// The measurement timestamp.
    fn ts(&self) -> DateTime<Utc>;

    /// Overwrite the measurement timestamp.
    fn set_ts(&mut self, ts: DateTime<Utc>);

    /// Bucket key for this measurement at the given resolution.
    fn time_label(&self, res: Resolution) -> String {
        res.label(self.ts())
    }
}

/// One timestamped bandwidth measurement.
///
/// Wire layout is exactly 24 bytes, all little-endian: i64 nanosecond epoch,
/// u64 upstream bytes, u64 downstream bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "Ts")]
    pub ts: DateTime<Utc>,
    #[serde(rename = "BytesUp")]
    pub bytes_up: u64,
    #[serde(rename = "BytesDown")]
    pub bytes_down: u64,
}

impl Sample {
    /// Create a sample from a timestamp and byte deltas.
    pub fn new(ts: DateTime<Utc>, bytes_up: u64, bytes_down: u64) -> Self {
        Self {
            ts,
            bytes_up,
            bytes_down,
        }
    }
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            ts: DateTime::UNIX_EPOCH,
            bytes_up: 0,
            bytes_down: 0,
        }
    }
}

impl Measurement for Sample {
    fn at_or_after(&self, ts: DateTime<Utc>) -> bool {
        self.ts >= ts
    }

    fn merge(&mut self, other: &Self) {
        self.bytes_up = self.bytes_up.wrapping_add(other.bytes_up);
        self.bytes_down = self.bytes_down.wrapping_add(other.bytes_down);
        if other.ts > self.ts {
            self.ts = other.ts;
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SAMPLE_SIZE);
        let nanos = self.ts.timestamp_nanos_opt().unwrap_or_default();
        buf.extend_from_slice(&nanos.to_le_bytes());
        buf.extend_from_slice(&self.bytes_up.to_le_bytes());
        buf.extend_from_slice(&self.bytes_down.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != SAMPLE_SIZE {
            return Err(CodecError::InvalidBuffer(buf.len()));
        }

        let mut word = [0u8; 8];

        word.copy_from_slice(&buf[0..8]);
        let nanos = i64::from_le_bytes(word);

        word.copy_from_slice(&buf[8..16]);
        let bytes_up = u64::from_le_bytes(word);

        word.copy_from_slice(&buf[16..24]);
        let bytes_down = u64::from_le_bytes(word);

        Ok(Self {
            ts: Utc.timestamp_nanos(nanos),
            bytes_up,
            bytes_down,
        })
    }

    fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    fn set_ts(&mut self, ts: DateTime<Utc>) {
        self.ts = ts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, nanos).single().expect("valid ts")
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let s = Sample::new(ts(1_451_610_000, 123_456_789), 42, 99);
        let buf = s.encode();
        assert_eq!(buf.len(), SAMPLE_SIZE);

        let decoded = Sample::decode(&buf).expect("decode");
        assert_eq!(decoded, s);
        assert_eq!(decoded.ts.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let err = Sample::decode(&[0u8; 23]).expect_err("short buffer");
        assert_eq!(err, CodecError::InvalidBuffer(23));
    }

    #[test]
    fn test_decode_rejects_long_buffer() {
        let err = Sample::decode(&[0u8; 25]).expect_err("long buffer");
        assert_eq!(err, CodecError::InvalidBuffer(25));
    }

    #[test]
    fn test_merge_sums_and_keeps_latest_ts() {
        let mut acc = Sample::new(ts(100, 0), 10, 20);
        acc.merge(&Sample::new(ts(50, 0), 1, 2));
        assert_eq!(acc.bytes_up, 11);
        assert_eq!(acc.bytes_down, 22);
        assert_eq!(acc.ts, ts(100, 0));

        acc.merge(&Sample::new(ts(200, 0), 4, 8));
        assert_eq!(acc.bytes_up, 15);
        assert_eq!(acc.bytes_down, 30);
        assert_eq!(acc.ts, ts(200, 0));
    }

    #[test]
    fn test_merge_into_default_accumulator() {
        let mut acc = Sample::default();
        acc.merge(&Sample::new(ts(1_000, 0), 7, 3));
        assert_eq!(acc.bytes_up, 7);
        assert_eq!(acc.bytes_down, 3);
        assert_eq!(acc.ts, ts(1_000, 0));
    }

    #[test]
    fn test_at_or_after() {
        let s = Sample::new(ts(100, 0), 0, 0);
        assert!(s.at_or_after(ts(100, 0)));
        assert!(s.at_or_after(ts(99, 0)));
        assert!(!s.at_or_after(ts(101, 0)));
    }

    #[test]
    fn test_labels() {
        // 2016-01-01 01:05:30 UTC.
        let t = ts(1_451_610_330, 0);
        assert_eq!(Resolution::Minute.label(t), "010120160105");
        assert_eq!(Resolution::Hour.label(t), "0101201601");
        assert_eq!(Resolution::Day.label(t), "01012016");
        assert_eq!(Resolution::Month.label(t), "012016");
    }

    #[test]
    fn test_resolution_names() {
        assert_eq!(Resolution::Minute.to_string(), "min");
        assert_eq!(Resolution::Hour.to_string(), "hour");
        assert_eq!(Resolution::Day.to_string(), "day");
        assert_eq!(Resolution::Month.to_string(), "mon");
        assert_eq!(Resolution::all().len(), 4);
    }
}
