//! Volumetric video playback core.
//!
//! Holosync keeps a stream of compressed mesh geometry in lock-step with the
//! video that textures it. The video carries a binary frame counter burned into
//! its pixels; each rendered video frame is matched to the mesh frame with the
//! same number.
//!
//! # Features
//!
//! - **Frame store**: fragmented MP4 in, reconstructed geometry frames out,
//!   with buffered ranges, quotas and removal behind the playback position
//! - **Geometry decode**: keyframes plus delta and interpolated sub-frames,
//!   optionally fanned out across a worker pool
//! - **Timecode sync**: frame numbers read from the video, disambiguated across
//!   counter wrap-around
//! - **Quality coordination**: mesh representations follow video switches
//! - **Playback state**: seeks and quality switches wait until mesh and video
//!   are both buffered
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use holosync::{BufferRegistry, MESH_MP4_MIME, PlayerConfig, PlaybackStateMachine, Segment};
//! use holosync::media::MediaElement;
//!
//! async fn play(video: Arc<dyn MediaElement>, init: Vec<u8>, media: Vec<u8>) -> holosync::Result<()> {
//!     let config = PlayerConfig::from_file("player.yaml")?;
//!     let registry = BufferRegistry::with_defaults();
//!     let mut store = registry.create(MESH_MP4_MIME, &config.buffer).expect("mesh MIME type is registered");
//!
//!     let playback = PlaybackStateMachine::new(video, store.watch_snapshot(), config.playback.clone());
//!     store.append_and_drain(Segment::new(init)).await?;
//!     store.append_and_drain(Segment::new(media)).await?;
//!
//!     playback.seek(1.0).await?;
//!     Ok(())
//! }
//! ```
//!
//! Resolving a frame number from a timecode:
//!
//! ```rust
//! use holosync::timecode::resolve_frame_number;
//!
//! // 30fps at a 90kHz timescale, 10-bit counter: frame 1030 reads as code 6
//! assert_eq!(resolve_frame_number(34.3, 90000, 3000, 6), 1030);
//! ```

// Core types and error handling
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Geometry pipeline
pub mod buffer;
pub mod codec;
pub mod container;

// Synchronization and control
pub mod media;
pub mod playback;
pub mod provider;
pub mod quality;
pub mod stream;
pub mod timecode;

// Ambient
pub mod config;
pub mod logging;

// Core exports
pub use error::*;
pub use types::*;

pub use buffer::{BufferEvent, BufferRegistry, BufferSnapshot, DecodeMode, FrameStore, MESH_FB_MIME, MESH_MP4_MIME};
pub use codec::{ContentKey, GeometryCodec, KeySlot};
pub use config::{BufferConfig, PlaybackConfig, PlayerConfig, QualityConfig, TimecodeConfig};
pub use playback::{PlaybackState, PlaybackStateMachine};
pub use provider::{KeyProvider, StaticKeyProvider, install_key};
pub use quality::{QualityCoordinator, QualityEvent, RepresentationChange};
pub use timecode::TimecodeSync;
