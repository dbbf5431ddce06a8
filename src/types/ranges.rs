//! Buffered time ranges

use serde::{Deserialize, Serialize};

/// Gap below which two intervals are considered adjacent, in seconds.
const ADJACENCY_EPSILON: f64 = 1e-6;

/// A half-open `[start, end)` interval in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Inclusive containment with symmetric tolerance.
    pub fn contains(&self, time: f64, tolerance: f64) -> bool {
        time >= self.start - tolerance && time <= self.end + tolerance
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Sorted, non-overlapping, coalesced list of buffered intervals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferedRanges {
    ranges: Vec<TimeRange>,
}

impl BufferedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build coalesced ranges from arbitrary, possibly overlapping intervals.
    pub fn from_intervals<I>(intervals: I) -> Self
    where
        I: IntoIterator<Item = TimeRange>,
    {
        let mut sorted: Vec<TimeRange> =
            intervals.into_iter().filter(|r| r.end >= r.start && r.start.is_finite()).collect();
        sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut ranges: Vec<TimeRange> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match ranges.last_mut() {
                Some(last) if range.start <= last.end + ADJACENCY_EPSILON => {
                    last.end = last.end.max(range.end);
                }
                _ => ranges.push(range),
            }
        }
        Self { ranges }
    }

    /// Build ranges from `(timestamp, duration)` pairs in timescale units.
    ///
    /// A zero duration falls back to `frame_duration`.
    pub fn from_frames<I>(frames: I, timescale: u32, frame_duration: u64) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        if timescale == 0 {
            return Self::default();
        }
        let scale = timescale as f64;
        Self::from_intervals(frames.into_iter().map(|(timestamp, duration)| {
            let duration = if duration == 0 { frame_duration } else { duration };
            let start = timestamp as f64 / scale;
            TimeRange::new(start, start + duration as f64 / scale)
        }))
    }

    /// Whether `time` (± `tolerance`) falls inside any range.
    pub fn contains(&self, time: f64, tolerance: f64) -> bool {
        self.ranges.iter().any(|r| r.contains(time, tolerance))
    }

    /// Pairwise overlap of two range lists.
    pub fn intersect(&self, other: &BufferedRanges) -> BufferedRanges {
        let mut overlaps = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                let start = a.start.max(b.start);
                let end = a.end.min(b.end);
                if start < end {
                    overlaps.push(TimeRange::new(start, end));
                }
            }
        }
        BufferedRanges::from_intervals(overlaps)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn start(&self, index: usize) -> Option<f64> {
        self.ranges.get(index).map(|r| r.start)
    }

    pub fn end(&self, index: usize) -> Option<f64> {
        self.ranges.get(index).map(|r| r.end)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[TimeRange] {
        &self.ranges
    }
}
