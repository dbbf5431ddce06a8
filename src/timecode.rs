//! Embedded timecode readback
//!
//! Every composited video frame carries an N-bit rolling frame counter burnt
//! into a strip of pixels near its top-right corner, one fixed-width digit
//! per bit, most significant first. Reading it back gives the exact video
//! frame on screen; the counter only wraps every 2^N frames, so the high
//! bits come from the element's clock.
//!
//! ```text
//!  x = video_width - bits * digit_width - 1, y = 1
//!  ┌────────┬────────┬─────┬────────┐
//!  │ bit N-1│ bit N-2│ ... │ bit 0  │   one row, RGBA
//!  └────────┴────────┴─────┴────────┘
//!   sampled at byte digit_width / 2 of each digit, > 127 is a one
//! ```

use tracing::{debug, trace, warn};

use crate::buffer::BufferSnapshot;
use crate::config::{TimecodeConfig, WrapPolicy};
use crate::{PlayerError, Result};

/// Default counter width in bits.
pub const DEFAULT_BITS: u32 = 10;
/// Pixel values above this read as a one.
pub const BIT_THRESHOLD: u8 = 127;

/// Nominal-vs-read disagreement, in frames, worth a log line.
const DRIFT_WARNING_FRAMES: i64 = 3;

/// Geometry of the timecode strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimecodeLayout {
    pub bits: u32,
    /// Pixels per digit
    pub digit_width: u32,
    /// Bytes per pixel
    pub pixel_stride: u32,
}

impl Default for TimecodeLayout {
    fn default() -> Self {
        Self { bits: DEFAULT_BITS, digit_width: 16, pixel_stride: 4 }
    }
}

impl From<&TimecodeConfig> for TimecodeLayout {
    fn from(config: &TimecodeConfig) -> Self {
        Self { bits: config.bits, digit_width: config.digit_width, pixel_stride: config.pixel_stride }
    }
}

impl TimecodeLayout {
    /// Counter period, `2^bits`.
    pub fn modulus(&self) -> i64 {
        1i64 << self.bits
    }

    /// Strip width in pixels.
    pub fn region_width(&self) -> u32 {
        self.bits * self.digit_width
    }

    /// Bytes in one strip row.
    pub fn region_len(&self) -> usize {
        (self.region_width() * self.pixel_stride) as usize
    }

    fn digit_stride(&self) -> usize {
        (self.digit_width * self.pixel_stride) as usize
    }

    fn read_offset(&self) -> usize {
        (self.digit_width / 2) as usize
    }

    /// Top-left pixel of the strip, `None` when the video is too narrow.
    pub fn region_origin(&self, video_width: u32) -> Option<(u32, u32)> {
        let x = video_width.checked_sub(self.region_width() + 1)?;
        Some((x, 1))
    }

    /// Decode the counter from one strip row.
    pub fn read(&self, region: &[u8]) -> Result<u32> {
        if region.len() < self.region_len() {
            return Err(PlayerError::decode(
                "Timecode",
                format!("Region has {} bytes, {} needed", region.len(), self.region_len()),
            ));
        }
        let offset = self.read_offset();
        let code = (0..self.bits as usize)
            .map(|digit| region[digit * self.digit_stride() + offset])
            .fold(0u32, |code, value| (code << 1) | u32::from(value > BIT_THRESHOLD));
        Ok(code)
    }

    /// Paint `code` into a strip row, as the encoder does.
    pub fn encode(&self, code: u32) -> Vec<u8> {
        let mut region = vec![0u8; self.region_len()];
        for digit in 0..self.bits as usize {
            let bit = (code >> (self.bits as usize - 1 - digit)) & 1;
            if bit == 1 {
                let start = digit * self.digit_stride();
                region[start..start + self.digit_stride()].fill(255);
            }
        }
        region
    }

    /// Frame number by the bucket rule: the read code added to the
    /// 2^bits-aligned epoch of the clock's nominal frame index.
    pub fn resolve_bucket(&self, current_time: f64, timescale: u32, frame_duration: u64, code: u32) -> i64 {
        let nominal = nominal_index(current_time, timescale, frame_duration);
        let modulus = self.modulus();
        nominal.div_euclid(modulus) * modulus + i64::from(code)
    }

    /// Frame number from the epoch nearest the nominal index.
    pub fn resolve_nearest(&self, current_time: f64, timescale: u32, frame_duration: u64, code: u32) -> i64 {
        let nominal = nominal_index(current_time, timescale, frame_duration);
        let modulus = self.modulus();
        let bucket = nominal.div_euclid(modulus) * modulus + i64::from(code);
        [bucket - modulus, bucket, bucket + modulus]
            .into_iter()
            .filter(|candidate| *candidate >= 0)
            .min_by_key(|candidate| (candidate - nominal).abs())
            .unwrap_or(bucket)
    }
}

/// `round(t · timescale / frame_duration)`.
pub fn nominal_index(current_time: f64, timescale: u32, frame_duration: u64) -> i64 {
    if frame_duration == 0 {
        return 0;
    }
    (current_time * timescale as f64 / frame_duration as f64).round() as i64
}

/// Read a counter from a strip in the default layout.
pub fn read_timecode(region: &[u8]) -> Result<u32> {
    TimecodeLayout::default().read(region)
}

/// Absolute frame number for a 10-bit `code` by the bucket rule.
pub fn resolve_frame_number(current_time: f64, timescale: u32, frame_duration: u64, code: u32) -> i64 {
    TimecodeLayout::default().resolve_bucket(current_time, timescale, frame_duration, code)
}

/// Per-session timecode reader.
#[derive(Debug, Clone)]
pub struct TimecodeSync {
    layout: TimecodeLayout,
    policy: WrapPolicy,
    last_frame: Option<i64>,
}

impl TimecodeSync {
    pub fn new(config: &TimecodeConfig) -> Self {
        Self { layout: TimecodeLayout::from(config), policy: config.wrap_policy, last_frame: None }
    }

    pub fn layout(&self) -> &TimecodeLayout {
        &self.layout
    }

    pub fn policy(&self) -> WrapPolicy {
        self.policy
    }

    /// Last frame number produced by [`sync`](Self::sync).
    pub fn last_frame(&self) -> Option<i64> {
        self.last_frame
    }

    pub fn read(&self, region: &[u8]) -> Result<u32> {
        self.layout.read(region)
    }

    /// Wrap-corrected frame number under the configured policy.
    pub fn resolve(&self, current_time: f64, timescale: u32, frame_duration: u64, code: u32) -> i64 {
        let frame = match self.policy {
            WrapPolicy::Nearest => self.layout.resolve_nearest(current_time, timescale, frame_duration, code),
            WrapPolicy::Bucket => self.layout.resolve_bucket(current_time, timescale, frame_duration, code),
        };
        let drift = frame - nominal_index(current_time, timescale, frame_duration);
        if drift.abs() > DRIFT_WARNING_FRAMES {
            debug!(drift, code, current_time, frame, "Timecode drifted from the media clock");
        }
        frame
    }

    /// Mesh frame number for the video frame in `region`.
    ///
    /// `None` while the frame store is uninitialized or the strip is
    /// unreadable.
    pub fn sync(&mut self, region: &[u8], current_time: f64, snapshot: &BufferSnapshot) -> Option<i64> {
        if !snapshot.initialized {
            trace!("Timecode sync skipped, frame store not initialized");
            return None;
        }
        let code = match self.read(region) {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "Unreadable timecode strip");
                return None;
            }
        };
        let frame = self.resolve(current_time, snapshot.timescale, snapshot.frame_duration, code);
        self.last_frame = Some(frame);
        Some(frame)
    }
}

impl Default for TimecodeSync {
    fn default() -> Self {
        Self::new(&TimecodeConfig::default())
    }
}
