//! Telemetry data model: time ranges, series segments, and frames.
//!
//! **Why**: The frame cache keys entries by time range, so two semantically
//! equal ranges must compare and hash identically. `TimeRange::make_valid()`
//! is the canonical form every cache operation goes through.
//!
//! **Used by**: FrameCache (range keys, byte accounting), query configs
//! (range-scoped retrieval).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Half-open time range `[start, end)` in integer nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Canonical form: bounds ordered so that `start <= end`.
    ///
    /// Inverted ranges are common at call sites (selection dragged right to
    /// left); without this, semantically equal ranges would hash to different
    /// cache keys and hits would silently regress to misses.
    pub fn make_valid(self) -> Self {
        if self.start <= self.end {
            self
        } else {
            Self { start: self.end, end: self.start }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Duration covered, in nanoseconds.
    pub fn span(&self) -> i64 {
        let v = self.make_valid();
        v.end - v.start
    }

    pub fn contains(&self, ts: i64) -> bool {
        let v = self.make_valid();
        ts >= v.start && ts < v.end
    }

    pub fn overlaps_with(&self, other: &TimeRange) -> bool {
        let a = self.make_valid();
        let b = other.make_valid();
        a.start < b.end && b.start < a.end
    }
}

/// Time-ordered segment of samples for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Time range this segment covers.
    pub time_range: TimeRange,
    /// Sample values, ordered by time.
    pub data: Vec<f64>,
}

impl Series {
    pub fn new(time_range: TimeRange, data: Vec<f64>) -> Self {
        Self { time_range: time_range.make_valid(), data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reported byte size, used for cache-pressure accounting.
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }
}

/// Mapping from channel key to the series segment retrieved for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    series: HashMap<String, Series>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from (channel key, series) pairs.
    pub fn from_series<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Series)>,
    {
        Self { series: pairs.into_iter().collect() }
    }

    pub fn insert(&mut self, key: impl Into<String>, series: Series) {
        self.series.insert(key.into(), series);
    }

    pub fn get(&self, key: &str) -> Option<&Series> {
        self.series.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.series.contains_key(key)
    }

    pub fn channels(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Series)> {
        self.series.iter()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Subset of this frame restricted to `keys`. Missing keys are skipped.
    pub fn filter(&self, keys: &[&str]) -> Frame {
        Frame {
            series: keys
                .iter()
                .filter_map(|k| self.series.get(*k).map(|s| (k.to_string(), s.clone())))
                .collect(),
        }
    }

    /// Total reported byte size of all segments.
    pub fn byte_size(&self) -> usize {
        self.series.values().map(Series::byte_size).sum()
    }

    /// Move all of `other`'s segments into this frame, replacing any segment
    /// already held for the same channel key.
    pub fn merge(&mut self, other: Frame) {
        for (k, s) in other.series {
            self.series.insert(k, s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_valid_swaps_inverted_bounds() {
        let inverted = TimeRange::new(100, 10);
        let canonical = inverted.make_valid();
        assert_eq!(canonical, TimeRange::new(10, 100));
        // Already-valid range unchanged
        assert_eq!(canonical.make_valid(), canonical);
    }

    #[test]
    fn test_contains_and_overlaps() {
        let r = TimeRange::new(10, 20);
        assert!(r.contains(10));
        assert!(r.contains(19));
        assert!(!r.contains(20)); // half-open
        assert!(r.overlaps_with(&TimeRange::new(15, 30)));
        assert!(!r.overlaps_with(&TimeRange::new(20, 30)));
        // Inverted representation still overlaps
        assert!(r.overlaps_with(&TimeRange::new(30, 15)));
    }

    #[test]
    fn test_series_byte_size() {
        let s = Series::new(TimeRange::new(0, 4), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.len(), 4);
        assert_eq!(s.byte_size(), 32);
    }

    #[test]
    fn test_frame_filter_and_merge() {
        let mut frame = Frame::new();
        frame.insert("a", Series::new(TimeRange::new(0, 2), vec![1.0, 2.0]));

        let subset = frame.filter(&["a", "b"]);
        assert!(subset.contains_key("a"));
        assert!(!subset.contains_key("b"));

        let mut other = Frame::new();
        other.insert("a", Series::new(TimeRange::new(0, 1), vec![9.0]));
        other.insert("b", Series::new(TimeRange::new(0, 1), vec![3.0]));
        frame.merge(other);

        // Segment for "a" was replaced wholesale, "b" added
        assert_eq!(frame.get("a").unwrap().data, vec![9.0]);
        assert_eq!(frame.get("b").unwrap().data, vec![3.0]);
    }
}
