//! Frame store notifications and the published query snapshot

use crate::types::BufferedRanges;

/// Update lifecycle notifications, in emission order per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEvent {
    /// A mutating operation started
    UpdateStart,
    /// Frames were committed or removed
    Update,
    /// The operation finished, successfully or not
    UpdateEnd,
    /// The in-flight operation was aborted
    Abort,
    /// A FULL frame fixed the timescale and frame duration
    Initialized,
    /// A batch is parked until a content key arrives
    WaitingForKey,
}

/// Read-only view of the store, published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferSnapshot {
    pub initialized: bool,
    /// Units per second of frame timestamps
    pub timescale: u32,
    /// Duration of one frame in timescale units
    pub frame_duration: u64,
    pub ranges: BufferedRanges,
    pub frame_count: usize,
}

impl BufferSnapshot {
    /// Whether `time` (± `tolerance`) is inside the buffered ranges.
    pub fn can_play(&self, time: f64, tolerance: f64) -> bool {
        self.initialized && self.ranges.contains(time, tolerance)
    }

    /// Nominal frame index for `time` seconds, `None` while uninitialized.
    pub fn frame_index(&self, time: f64) -> Option<f64> {
        if !self.initialized || self.frame_duration == 0 {
            return None;
        }
        Some(time * self.timescale as f64 / self.frame_duration as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeRange;

    #[test]
    fn uninitialized_snapshot_plays_nothing() {
        let snapshot = BufferSnapshot {
            ranges: BufferedRanges::from_intervals([TimeRange::new(0.0, 1.0)]),
            ..Default::default()
        };
        assert!(!snapshot.can_play(0.5, 0.0));
        assert_eq!(snapshot.frame_index(0.5), None);
    }

    #[test]
    fn frame_index_uses_timescale() {
        let snapshot = BufferSnapshot {
            initialized: true,
            timescale: 90000,
            frame_duration: 3000,
            ranges: BufferedRanges::from_intervals([TimeRange::new(1.0, 2.0)]),
            frame_count: 30,
        };
        assert_eq!(snapshot.frame_index(1.5), Some(45.0));
        assert!(snapshot.can_play(2.0, 0.0));
        assert!(snapshot.can_play(2.05, 0.1));
        assert!(!snapshot.can_play(2.5, 0.1));
    }
}
