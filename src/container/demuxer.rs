//! Streaming demuxer for the geometry track

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::boxes::{
    BoxHeader, MDAT, MOOF, MOOV, MovieFragment, TrackFragment, TrackInfo, fourcc_str, parse_moof,
    parse_moov,
};
use crate::types::RawSample;
use crate::{PlayerError, Result};

/// Samples extracted from one `moof` + `mdat` pair.
#[derive(Debug, Clone, Default)]
pub struct SampleBatch {
    pub sequence_number: u32,
    pub samples: Vec<RawSample>,
}

impl SampleBatch {
    /// Whether any sample needs a key before it can be decoded.
    pub fn is_encrypted(&self) -> bool {
        self.samples.iter().any(|s| s.encrypted)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Incremental fragmented ISO-BMFF parser.
///
/// Bytes are appended at file positions; complete top-level boxes are parsed
/// as they become available. Extraction can be paused while a batch waits for
/// key material, leaving later boxes buffered.
#[derive(Debug, Default)]
pub struct Demuxer {
    buffer: Vec<u8>,
    /// File position of `buffer[0]`
    buffer_start: u64,
    track: Option<TrackInfo>,
    /// Most recent `moof` and its file position, waiting for its `mdat`
    fragment: Option<(u64, MovieFragment)>,
    paused: bool,
    /// Largest top-level box accepted; `None` for no limit
    max_box_len: Option<u64>,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject top-level boxes declaring more than `len` bytes.
    pub fn with_max_box_len(mut self, len: u64) -> Self {
        self.max_box_len = Some(len);
        self
    }

    /// Track parsed from the last initialization segment.
    pub fn track(&self) -> Option<&TrackInfo> {
        self.track.as_ref()
    }

    /// File position just past the last buffered byte.
    pub fn position(&self) -> u64 {
        self.buffer_start + self.buffer.len() as u64
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pause extraction; buffered bytes are kept.
    pub fn stop(&mut self) {
        self.paused = true;
    }

    /// Resume extraction.
    pub fn start(&mut self) {
        self.paused = false;
    }

    /// Forget all state, including the track description.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffer_start = 0;
        self.track = None;
        self.fragment = None;
        self.paused = false;
    }

    /// Buffer `data` at file position `offset` and return the next expected
    /// position.
    ///
    /// A discontinuous offset drops any partially buffered box and resyncs at
    /// `offset`.
    pub fn append(&mut self, offset: u64, data: &[u8]) -> u64 {
        if offset != self.position() {
            debug!(expected = self.position(), offset, dropped = self.buffer.len(), "Demuxer resync");
            self.buffer.clear();
            self.fragment = None;
            self.buffer_start = offset;
        }
        self.buffer.extend_from_slice(data);
        self.position()
    }

    /// Parse buffered boxes until a sample batch is complete.
    ///
    /// Returns `Ok(None)` when more bytes are needed or extraction is paused.
    /// On a parse error the buffered bytes are discarded so the next call
    /// starts clean.
    pub fn next_batch(&mut self) -> Result<Option<SampleBatch>> {
        loop {
            if self.paused {
                return Ok(None);
            }
            match self.parse_box() {
                Ok(Some(Some(batch))) => return Ok(Some(batch)),
                Ok(Some(None)) => continue,
                Ok(None) => return Ok(None),
                Err(e) => {
                    let position = self.position();
                    self.buffer.clear();
                    self.buffer_start = position;
                    self.fragment = None;
                    return Err(e);
                }
            }
        }
    }

    /// Parse one top-level box. `Ok(None)` means the box is incomplete.
    fn parse_box(&mut self) -> Result<Option<Option<SampleBatch>>> {
        let Some(header) = BoxHeader::peek(&self.buffer)? else {
            return Ok(None);
        };
        let Some(size) = header.size else {
            return Err(PlayerError::container(
                "Demuxer",
                format!("Unbounded '{}' box in a fragmented stream", fourcc_str(&header.kind)),
            ));
        };
        if let Some(limit) = self.max_box_len
            && size > limit
        {
            return Err(PlayerError::container(
                "Demuxer",
                format!("Box '{}' declares {} bytes, limit is {}", fourcc_str(&header.kind), size, limit),
            ));
        }
        if size > self.buffer.len() as u64 {
            return Ok(None);
        }
        let size = size as usize;
        let box_position = self.buffer_start;
        let payload = &self.buffer[header.header_len..size];

        let batch = match header.kind {
            MOOV => {
                let track = parse_moov(payload)?;
                info!(track_id = track.track_id, timescale = track.timescale, "Initialization segment parsed");
                self.track = Some(track);
                None
            }
            MOOF => {
                self.fragment = Some((box_position, parse_moof(payload)?));
                None
            }
            MDAT => match self.fragment.take() {
                Some((moof_position, fragment)) => {
                    let data_start = box_position + header.header_len as u64;
                    Some(extract_samples(self.track.as_ref(), moof_position, &fragment, data_start, payload)?)
                }
                None => {
                    warn!(position = box_position, "mdat without preceding moof, skipping");
                    None
                }
            },
            other => {
                trace!(kind = %fourcc_str(&other), size, "Skipping box");
                None
            }
        };

        self.buffer.drain(..size);
        self.buffer_start += size as u64;
        Ok(Some(batch))
    }
}

fn extract_samples(
    track: Option<&TrackInfo>,
    moof_position: u64,
    fragment: &MovieFragment,
    data_start: u64,
    mdat: &[u8],
) -> Result<SampleBatch> {
    let track = track.ok_or_else(|| {
        PlayerError::container("Media segment", "Fragment received before initialization segment")
    })?;

    let mut batch = SampleBatch { sequence_number: fragment.sequence_number, samples: Vec::new() };
    for traf in fragment.fragments.iter().filter(|t| t.track_id == track.track_id) {
        extract_traf(track, traf, moof_position, data_start, mdat, &mut batch.samples)?;
    }
    trace!(sequence = batch.sequence_number, samples = batch.samples.len(), "Extracted batch");
    Ok(batch)
}

fn extract_traf(
    track: &TrackInfo,
    traf: &TrackFragment,
    moof_position: u64,
    data_start: u64,
    mdat: &[u8],
    out: &mut Vec<RawSample>,
) -> Result<()> {
    let base = traf.base_data_offset.unwrap_or(moof_position);
    let data_end = data_start
        .checked_add(mdat.len() as u64)
        .ok_or_else(|| PlayerError::container("Media data", "mdat extends past the addressable range"))?;
    let encrypted = traf.is_encrypted();
    let mut cursor = base;
    let mut dts = traf.base_decode_time;
    let mut index = 0usize;

    for run in &traf.runs {
        if let Some(offset) = run.data_offset {
            cursor = base.checked_add_signed(offset as i64).ok_or_else(|| {
                PlayerError::container("Track run", format!("Data offset {} precedes the file start", offset))
            })?;
        }
        for sample in &run.samples {
            let duration = sample.duration.or(traf.default_duration).unwrap_or(track.defaults.sample_duration);
            let size = sample.size.or(traf.default_size).unwrap_or(track.defaults.sample_size) as u64;
            let end = cursor.checked_add(size).filter(|&end| cursor >= data_start && end <= data_end);
            let Some(end) = end else {
                return Err(PlayerError::container(
                    "Media data",
                    format!("Sample {} at {} (+{}) lies outside mdat {}..{}", index, cursor, size, data_start, data_end),
                ));
            };
            let relative = (cursor - data_start) as usize;
            let data: Arc<[u8]> = Arc::from(&mdat[relative..relative + size as usize]);
            out.push(RawSample {
                track_id: track.track_id,
                data,
                dts,
                duration: duration as u64,
                timescale: track.timescale,
                encrypted,
                iv: traf.ivs.get(index).cloned(),
            });
            cursor = end;
            dts = dts.checked_add(duration as u64).ok_or_else(|| {
                PlayerError::container("Track fragment", format!("Decode time overflows after sample {}", index))
            })?;
            index += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FragmentSpec, build_init_segment, build_media_segment};
    use anyhow::{Context, ensure};

    fn clear_fragment(sequence: u32, base: u64) -> FragmentSpec {
        FragmentSpec {
            sequence,
            track_id: 1,
            base_decode_time: base,
            sample_duration: 3000,
            samples: vec![vec![0xAA; 16], vec![0xBB; 24], vec![0xCC; 8]],
            ivs: None,
        }
    }

    #[test]
    fn extracts_samples_in_decode_order() -> anyhow::Result<()> {
        let mut demuxer = Demuxer::new();
        let init = build_init_segment(1, 90000);
        let next = demuxer.append(0, &init);
        ensure!(demuxer.next_batch()?.is_none(), "init segment alone yields no batch");
        assert_eq!(demuxer.track().context("track parsed from moov")?.timescale, 90000);

        let media = build_media_segment(&clear_fragment(1, 9000));
        demuxer.append(next, &media);
        let batch = demuxer.next_batch()?.context("fragment should be complete")?;
        assert_eq!(batch.sequence_number, 1);
        assert_eq!(batch.len(), 3);
        assert!(!batch.is_encrypted());
        let dts: Vec<u64> = batch.samples.iter().map(|s| s.dts).collect();
        assert_eq!(dts, vec![9000, 12000, 15000]);
        assert_eq!(&*batch.samples[1].data, &[0xBB; 24][..]);
        assert_eq!(demuxer.position(), (init.len() + media.len()) as u64);
        Ok(())
    }

    #[test]
    fn waits_for_split_boxes() {
        let mut demuxer = Demuxer::new();
        let init = build_init_segment(1, 90000);
        let mut position = demuxer.append(0, &init);
        let media = build_media_segment(&clear_fragment(1, 0));
        let (head, tail) = media.split_at(media.len() / 2);

        position = demuxer.append(position, head);
        assert!(demuxer.next_batch().unwrap().is_none());
        demuxer.append(position, tail);
        assert_eq!(demuxer.next_batch().unwrap().unwrap().len(), 3);
    }

    #[test]
    fn paused_demuxer_keeps_bytes() {
        let mut demuxer = Demuxer::new();
        let init = build_init_segment(1, 90000);
        let mut position = demuxer.append(0, &init);
        position = demuxer.append(position, &build_media_segment(&clear_fragment(1, 0)));
        demuxer.append(position, &build_media_segment(&clear_fragment(2, 9000)));

        assert_eq!(demuxer.next_batch().unwrap().unwrap().sequence_number, 1);
        demuxer.stop();
        assert!(demuxer.next_batch().unwrap().is_none());
        demuxer.start();
        assert_eq!(demuxer.next_batch().unwrap().unwrap().sequence_number, 2);
    }

    #[test]
    fn encrypted_fragment_carries_ivs() {
        let mut demuxer = Demuxer::new();
        let position = demuxer.append(0, &build_init_segment(1, 90000));
        let mut spec = clear_fragment(1, 0);
        spec.ivs = Some(vec![vec![1; 16], vec![2; 16], vec![3; 16]]);
        demuxer.append(position, &build_media_segment(&spec));

        let batch = demuxer.next_batch().unwrap().unwrap();
        assert!(batch.is_encrypted());
        assert_eq!(batch.samples[2].iv.as_deref(), Some(&[3u8; 16][..]));
    }

    #[test]
    fn media_before_init_is_an_error_and_resyncs() {
        let mut demuxer = Demuxer::new();
        let media = build_media_segment(&clear_fragment(1, 0));
        demuxer.append(0, &media);
        assert!(matches!(demuxer.next_batch(), Err(PlayerError::Container { .. })));
        assert_eq!(demuxer.position(), media.len() as u64);
        assert!(demuxer.next_batch().unwrap().is_none());
    }

    #[test]
    fn overflowing_decode_time_drops_the_batch() {
        let mut demuxer = Demuxer::new();
        let mut position = demuxer.append(0, &build_init_segment(1, 90000));
        position = demuxer.append(position, &build_media_segment(&clear_fragment(1, u64::MAX - 1000)));
        assert!(matches!(demuxer.next_batch(), Err(PlayerError::Container { .. })));

        demuxer.append(position, &build_media_segment(&clear_fragment(2, 0)));
        assert_eq!(demuxer.next_batch().unwrap().unwrap().sequence_number, 2);
    }

    #[test]
    fn oversized_box_is_rejected_instead_of_buffered() {
        let mut demuxer = Demuxer::new().with_max_box_len(4096);
        let position = demuxer.append(0, &build_init_segment(1, 90000));
        assert!(demuxer.next_batch().unwrap().is_none());

        let mut huge = (1u32 << 30).to_be_bytes().to_vec();
        huge.extend_from_slice(b"mdat");
        huge.extend_from_slice(&[0u8; 64]);
        let position = demuxer.append(position, &huge);
        assert!(matches!(demuxer.next_batch(), Err(PlayerError::Container { .. })));
        assert_eq!(demuxer.position(), position);

        demuxer.append(position, &build_media_segment(&clear_fragment(1, 0)));
        assert_eq!(demuxer.next_batch().unwrap().unwrap().len(), 3);
    }

    #[test]
    fn discontinuous_append_drops_partial_box() {
        let mut demuxer = Demuxer::new();
        let init = build_init_segment(1, 90000);
        demuxer.append(0, &init[..10]);
        let next = demuxer.append(500, &init);
        assert_eq!(next, 500 + init.len() as u64);
        assert!(demuxer.next_batch().unwrap().is_none());
        assert!(demuxer.track().is_some());
    }
}
