//! Fragmented ISO-BMFF container support
//!
//! Parses the initialization segment and `moof`/`mdat` pairs of one geometry
//! track into [`RawSample`](crate::types::RawSample) batches.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use holosync::container::Demuxer;
//!
//! fn feed(init: &[u8], media: &[u8]) -> holosync::Result<()> {
//!     let mut demuxer = Demuxer::new();
//!     let next = demuxer.append(0, init);
//!     demuxer.append(next, media);
//!
//!     while let Some(batch) = demuxer.next_batch()? {
//!         println!("fragment {} carries {} samples", batch.sequence_number, batch.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod boxes;
mod demuxer;

pub use boxes::{TrackDefaults, TrackInfo};
pub use demuxer::{Demuxer, SampleBatch};
