//! Core types for volumetric playback.
//!
//! This module provides the data structures that flow between the container
//! demuxer, the geometry codec, the frame store and the playback layer.
//!
//! ## Architecture
//!
//! - [`Segment`] and [`RawSample`] are container-level units with zero-copy
//!   payloads shared via `Arc`
//! - [`DecodedFrame`] holds reconstructed [`Geometry`] tagged with its
//!   [`FrameKind`]
//! - [`BufferedRanges`] is the coalesced availability view derived from the
//!   frame cache
//! - [`Representation`] describes one adaptive-streaming quality variant
//!
//! ## Usage Example
//!
//! ```rust
//! use holosync::types::{BufferedRanges, Representation};
//!
//! // 30 consecutive frames at 30fps in a 90kHz timescale
//! let frames = (0..30u64).map(|n| (n * 3000, 3000));
//! let ranges = BufferedRanges::from_frames(frames, 90000, 3000);
//! assert!(ranges.contains(0.5, 0.0));
//! assert!(!ranges.contains(2.0, 0.0));
//!
//! let video = Representation::video("1080p-30fps", 30.0, 1920, 1080);
//! assert!(video.pairs_with(&Representation::mesh("30fps")));
//! ```

mod geometry;
mod ranges;
mod representation;
mod sample;

pub use geometry::{DecodedFrame, FrameKind, Geometry, SKINNING_ITEM_SIZE};
pub use ranges::{BufferedRanges, TimeRange};
pub use representation::{MediaType, Representation, frame_rate_from_id, parse_frame_rate};
pub use sample::{RawSample, Segment};
