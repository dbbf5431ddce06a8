//! Player configuration
//!
//! [`PlayerConfig`] groups the tunables of each component. Every field has a
//! default, so a YAML file only needs to name what it changes:
//!
//! ```yaml
//! buffer:
//!   decode_mode: pooled
//!   workers: 2
//! quality:
//!   target_frame_rate: 30
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{PlayerError, Result};

/// Whether buffer quotas reject appends or only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPolicy {
    #[default]
    Enforce,
    Warn,
}

/// Where geometry payloads are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeModeKind {
    /// On the control task during `drain()`
    Inline,
    /// On a fixed pool of worker threads
    #[default]
    Pooled,
}

/// How the timecode wrap epoch is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapPolicy {
    /// Epoch whose result lies closest to the nominal frame index
    #[default]
    Nearest,
    /// Plain bucket of the nominal frame index
    Bucket,
}

fn default_init_segment_max_len() -> usize {
    740
}

fn default_max_frames() -> usize {
    300
}

fn default_max_buffer_bytes() -> u64 {
    40 << 20
}

fn default_workers() -> usize {
    4
}

fn default_key_poll_interval_ms() -> u64 {
    250
}

/// Frame store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Appends of at most this many bytes are treated as initialization segments
    #[serde(default = "default_init_segment_max_len")]
    pub init_segment_max_len: usize,
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: u64,
    pub quota_policy: QuotaPolicy,
    pub decode_mode: DecodeModeKind,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_key_poll_interval_ms")]
    pub key_poll_interval_ms: u64,
    /// Refuse `remove` while the media element is paused. Off by default:
    /// removal behind a paused position still frees frames.
    pub hold_frames_while_paused: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            init_segment_max_len: default_init_segment_max_len(),
            max_frames: default_max_frames(),
            max_buffer_bytes: default_max_buffer_bytes(),
            quota_policy: QuotaPolicy::default(),
            decode_mode: DecodeModeKind::default(),
            workers: default_workers(),
            key_poll_interval_ms: default_key_poll_interval_ms(),
            hold_frames_while_paused: false,
        }
    }
}

impl BufferConfig {
    pub fn key_poll_interval(&self) -> Duration {
        Duration::from_millis(self.key_poll_interval_ms)
    }
}

fn default_seek_poll_interval_ms() -> u64 {
    100
}

fn default_seek_timeout_ms() -> u64 {
    5000
}

fn default_seek_tolerance() -> f64 {
    0.1
}

/// Playback state machine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    #[serde(default = "default_seek_poll_interval_ms")]
    pub seek_poll_interval_ms: u64,
    #[serde(default = "default_seek_timeout_ms")]
    pub seek_timeout_ms: u64,
    /// Tolerance in seconds used by playability checks
    #[serde(default = "default_seek_tolerance")]
    pub tolerance: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            seek_poll_interval_ms: default_seek_poll_interval_ms(),
            seek_timeout_ms: default_seek_timeout_ms(),
            tolerance: default_seek_tolerance(),
        }
    }
}

impl PlaybackConfig {
    pub fn seek_poll_interval(&self) -> Duration {
        Duration::from_millis(self.seek_poll_interval_ms)
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }
}

fn default_max_texture_size() -> u32 {
    4096
}

/// Representation selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Pin every representation to this frame rate
    pub target_frame_rate: Option<f64>,
    /// Widest video texture the renderer accepts
    #[serde(default = "default_max_texture_size")]
    pub max_texture_size: u32,
    pub video_abr: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self { target_frame_rate: None, max_texture_size: default_max_texture_size(), video_abr: true }
    }
}

fn default_bits() -> u32 {
    10
}

fn default_digit_width() -> u32 {
    16
}

fn default_pixel_stride() -> u32 {
    4
}

/// Embedded timecode layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimecodeConfig {
    #[serde(default = "default_bits")]
    pub bits: u32,
    /// Pixels per digit
    #[serde(default = "default_digit_width")]
    pub digit_width: u32,
    /// Bytes per pixel
    #[serde(default = "default_pixel_stride")]
    pub pixel_stride: u32,
    pub wrap_policy: WrapPolicy,
}

impl Default for TimecodeConfig {
    fn default() -> Self {
        Self {
            bits: default_bits(),
            digit_width: default_digit_width(),
            pixel_stride: default_pixel_stride(),
            wrap_policy: WrapPolicy::default(),
        }
    }
}

/// Top-level player configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub buffer: BufferConfig,
    pub playback: PlaybackConfig,
    pub quality: QualityConfig,
    pub timecode: TimecodeConfig,
}

impl PlayerConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: PlayerConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| PlayerError::File { path: path.to_path_buf(), source })?;
        let config = Self::from_yaml_str(&contents)?;
        debug!(path = %path.display(), "Loaded player configuration");
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        let buffer = &self.buffer;
        if buffer.max_frames == 0 {
            return Err(PlayerError::config("buffer.max_frames must be positive"));
        }
        if buffer.max_buffer_bytes == 0 {
            return Err(PlayerError::config("buffer.max_buffer_bytes must be positive"));
        }
        if buffer.decode_mode == DecodeModeKind::Pooled && buffer.workers == 0 {
            return Err(PlayerError::config("buffer.workers must be positive in pooled mode"));
        }
        if buffer.key_poll_interval_ms == 0 {
            return Err(PlayerError::config("buffer.key_poll_interval_ms must be positive"));
        }

        let playback = &self.playback;
        if playback.seek_poll_interval_ms == 0 {
            return Err(PlayerError::config("playback.seek_poll_interval_ms must be positive"));
        }
        if playback.seek_timeout_ms < playback.seek_poll_interval_ms {
            return Err(PlayerError::config(format!(
                "playback.seek_timeout_ms ({}) is shorter than the poll interval ({})",
                playback.seek_timeout_ms, playback.seek_poll_interval_ms
            )));
        }
        if !(playback.tolerance >= 0.0 && playback.tolerance.is_finite()) {
            return Err(PlayerError::config("playback.tolerance must be a non-negative number"));
        }

        if let Some(fps) = self.quality.target_frame_rate
            && !(fps > 0.0 && fps.is_finite())
        {
            return Err(PlayerError::config(format!("quality.target_frame_rate {fps} is not a positive rate")));
        }
        if self.quality.max_texture_size == 0 {
            return Err(PlayerError::config("quality.max_texture_size must be positive"));
        }

        let timecode = &self.timecode;
        if timecode.bits == 0 || timecode.bits > 31 {
            return Err(PlayerError::config(format!("timecode.bits must be in 1..=31, got {}", timecode.bits)));
        }
        if timecode.digit_width < 2 || timecode.pixel_stride == 0 {
            return Err(PlayerError::config("timecode.digit_width must be at least 2 and pixel_stride positive"));
        }
        Ok(())
    }
}
