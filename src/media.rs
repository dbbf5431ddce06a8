//! Collaborator seams
//!
//! The player drives a video element and a streaming client it does not
//! own. These traits describe the slice of each that the sync components use;
//! implementations use interior mutability so they can be shared as `Arc`s.

use crate::Result;
use crate::types::{BufferedRanges, MediaType, Representation};

/// Read-only view of the media element's clock.
pub trait MediaClock: Send + Sync {
    /// Current playback position in seconds.
    fn current_time(&self) -> f64;

    fn is_paused(&self) -> bool;
}

/// The video element carrying the texture and embedded timecode.
#[async_trait::async_trait]
pub trait MediaElement: MediaClock {
    /// Video ranges buffered by the element.
    fn buffered(&self) -> BufferedRanges;

    /// Start playback. Resolves once the element accepted the request.
    async fn play(&self) -> Result<()>;

    fn pause(&self);

    /// Move the playback position to `time` seconds.
    fn seek(&self, time: f64);

    /// Width in pixels of the decoded video frame.
    fn video_width(&self) -> u32;
}

/// Lifecycle notifications raised by the media element.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LoadStart,
    CanPlay,
    Play,
    Pause,
    Seeking,
    Seeked,
    Waiting,
    Ended,
    Error(String),
}

/// Adaptive bitrate surface of the streaming client.
pub trait AbrControl: Send + Sync {
    /// Every representation the manifest offers for `media`.
    fn representations(&self, media: MediaType) -> Vec<Representation>;

    fn current_representation(&self, media: MediaType) -> Option<Representation>;

    /// Switch `media` to the representation with `id`.
    fn set_representation(&self, media: MediaType, id: &str) -> Result<()>;

    fn set_auto_switch(&self, media: MediaType, enabled: bool);
}
