//! ISO-BMFF box structures and parsing
//!
//! Only the boxes needed to pull one geometry track out of a fragmented
//! stream are understood. Everything else is skipped by size.
//!
//! ## Box Layout
//!
//! Every box starts with a 32-bit big-endian size followed by a four
//! character type. A size of 1 means a 64-bit size follows the type, a size
//! of 0 means the box runs to the end of the enclosing data.
//!
//! ```text
//! moov ─ trak ─ tkhd            track id
//!      │      └ mdia ─ mdhd     timescale
//!      │             └ hdlr     handler type
//!      └ mvex ─ trex            per-track sample defaults
//! moof ─ mfhd                   sequence number
//!      └ traf ─ tfhd            track id, base offset, defaults
//!             ├ tfdt            base decode time
//!             ├ trun            sample durations, sizes, data offset
//!             └ senc            per-sample initialization vectors
//! ```

use crate::{PlayerError, Result};
use tracing::trace;

pub type FourCc = [u8; 4];

pub const FTYP: FourCc = *b"ftyp";
pub const MOOV: FourCc = *b"moov";
pub const TRAK: FourCc = *b"trak";
pub const TKHD: FourCc = *b"tkhd";
pub const MDIA: FourCc = *b"mdia";
pub const MDHD: FourCc = *b"mdhd";
pub const HDLR: FourCc = *b"hdlr";
pub const MVEX: FourCc = *b"mvex";
pub const TREX: FourCc = *b"trex";
pub const MOOF: FourCc = *b"moof";
pub const MFHD: FourCc = *b"mfhd";
pub const TRAF: FourCc = *b"traf";
pub const TFHD: FourCc = *b"tfhd";
pub const TFDT: FourCc = *b"tfdt";
pub const TRUN: FourCc = *b"trun";
pub const SENC: FourCc = *b"senc";
pub const MDAT: FourCc = *b"mdat";

// tfhd flags
const TFHD_BASE_DATA_OFFSET: u32 = 0x00_0001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
const TFHD_DEFAULT_DURATION: u32 = 0x00_0008;
const TFHD_DEFAULT_SIZE: u32 = 0x00_0010;
const TFHD_DEFAULT_FLAGS: u32 = 0x00_0020;

// trun flags
const TRUN_DATA_OFFSET: u32 = 0x00_0001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
const TRUN_SAMPLE_DURATION: u32 = 0x00_0100;
const TRUN_SAMPLE_SIZE: u32 = 0x00_0200;
const TRUN_SAMPLE_FLAGS: u32 = 0x00_0400;
const TRUN_SAMPLE_CTO: u32 = 0x00_0800;

/// Upper bound on samples in one `trun`; runs that lean on default sizes
/// carry no per-sample bytes to check the count against.
pub const MAX_RUN_SAMPLES: usize = 1 << 16;

// senc flags
const SENC_USE_SUBSAMPLES: u32 = 0x00_0002;

/// Bounds-checked big-endian cursor over box payload bytes.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self { data, pos: 0, context }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(PlayerError::container(
                self.context,
                format!(
                    "Insufficient data at offset {} (need {} bytes, have {})",
                    self.pos,
                    len,
                    self.remaining()
                ),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn fourcc(&mut self) -> Result<FourCc> {
        let b = self.bytes(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// Version byte and 24-bit flags of a full box.
    pub fn full_box_header(&mut self) -> Result<(u8, u32)> {
        let word = self.u32()?;
        Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
    }
}

/// Size and type of one box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCc,
    /// Header length in bytes (8 or 16)
    pub header_len: usize,
    /// Total box length including the header; `None` when it runs to the end
    pub size: Option<u64>,
}

impl BoxHeader {
    /// Parse a box header, returning `Ok(None)` when `data` is too short to
    /// contain one.
    pub fn peek(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 8 {
            return Ok(None);
        }
        let mut reader = ByteReader::new(data, "Box header");
        let size32 = reader.u32()?;
        let kind = reader.fourcc()?;
        let (size, header_len) = match size32 {
            0 => (None, 8),
            1 => {
                if data.len() < 16 {
                    return Ok(None);
                }
                (Some(reader.u64()?), 16)
            }
            n => (Some(n as u64), 8),
        };
        if let Some(size) = size
            && size < header_len as u64
        {
            return Err(PlayerError::container(
                "Box header",
                format!("Box '{}' declares size {} smaller than its header", fourcc_str(&kind), size),
            ));
        }
        Ok(Some(Self { kind, header_len, size }))
    }
}

/// Printable form of a box type.
pub fn fourcc_str(kind: &FourCc) -> String {
    kind.iter().map(|&b| if b.is_ascii_graphic() { b as char } else { '?' }).collect()
}

/// Iterate the child boxes of a container payload as `(type, payload)`.
pub fn children(data: &[u8]) -> impl Iterator<Item = Result<(FourCc, &[u8])>> {
    let mut pos = 0usize;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || pos >= data.len() {
            return None;
        }
        let rest = &data[pos..];
        let header = match BoxHeader::peek(rest) {
            Ok(Some(header)) => header,
            Ok(None) => {
                failed = true;
                return Some(Err(PlayerError::container("Child boxes", "Truncated box header")));
            }
            Err(e) => {
                failed = true;
                return Some(Err(e));
            }
        };
        let size = header.size.map_or(rest.len(), |s| s as usize);
        if size > rest.len() {
            failed = true;
            return Some(Err(PlayerError::container(
                "Child boxes",
                format!(
                    "Box '{}' extends beyond its parent ({} > {})",
                    fourcc_str(&header.kind),
                    size,
                    rest.len()
                ),
            )));
        }
        pos += size;
        Some(Ok((header.kind, &rest[header.header_len..size])))
    })
}

fn find_child(data: &[u8], kind: FourCc) -> Result<Option<&[u8]>> {
    for child in children(data) {
        let (child_kind, payload) = child?;
        if child_kind == kind {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

/// Per-track sample defaults from `trex`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackDefaults {
    pub sample_duration: u32,
    pub sample_size: u32,
}

/// Geometry track description from the initialization segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub track_id: u32,
    pub timescale: u32,
    pub handler: FourCc,
    pub defaults: TrackDefaults,
}

/// Parse the `moov` payload and return its first track.
pub fn parse_moov(payload: &[u8]) -> Result<TrackInfo> {
    let trak = find_child(payload, TRAK)?
        .ok_or_else(|| PlayerError::container("Movie box", "No track in initialization segment"))?;

    let tkhd = find_child(trak, TKHD)?
        .ok_or_else(|| PlayerError::container("Track box", "Missing tkhd"))?;
    let mut reader = ByteReader::new(tkhd, "Track header");
    let (version, _) = reader.full_box_header()?;
    reader.skip(if version == 1 { 16 } else { 8 })?;
    let track_id = reader.u32()?;

    let mdia = find_child(trak, MDIA)?
        .ok_or_else(|| PlayerError::container("Track box", "Missing mdia"))?;
    let mdhd = find_child(mdia, MDHD)?
        .ok_or_else(|| PlayerError::container("Media box", "Missing mdhd"))?;
    let mut reader = ByteReader::new(mdhd, "Media header");
    let (version, _) = reader.full_box_header()?;
    reader.skip(if version == 1 { 16 } else { 8 })?;
    let timescale = reader.u32()?;
    if timescale == 0 {
        return Err(PlayerError::container("Media header", "Timescale cannot be zero"));
    }

    let handler = match find_child(mdia, HDLR)? {
        Some(hdlr) => {
            let mut reader = ByteReader::new(hdlr, "Handler reference");
            reader.full_box_header()?;
            reader.skip(4)?;
            reader.fourcc()?
        }
        None => *b"\0\0\0\0",
    };

    let mut defaults = TrackDefaults::default();
    if let Some(mvex) = find_child(payload, MVEX)? {
        for child in children(mvex) {
            let (kind, trex) = child?;
            if kind != TREX {
                continue;
            }
            let mut reader = ByteReader::new(trex, "Track extends");
            reader.full_box_header()?;
            if reader.u32()? != track_id {
                continue;
            }
            reader.skip(4)?;
            defaults.sample_duration = reader.u32()?;
            defaults.sample_size = reader.u32()?;
        }
    }

    trace!(track_id, timescale, handler = %fourcc_str(&handler), "Parsed moov");
    Ok(TrackInfo { track_id, timescale, handler, defaults })
}

/// One sample entry of a `trun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub composition_offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRun {
    pub data_offset: Option<i32>,
    pub samples: Vec<RunSample>,
}

/// Parsed `traf`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackFragment {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub default_duration: Option<u32>,
    pub default_size: Option<u32>,
    pub base_decode_time: u64,
    pub runs: Vec<TrackRun>,
    /// Per-sample initialization vectors; empty when the fragment is clear
    pub ivs: Vec<Vec<u8>>,
}

impl TrackFragment {
    pub fn sample_count(&self) -> usize {
        self.runs.iter().map(|r| r.samples.len()).sum()
    }

    pub fn is_encrypted(&self) -> bool {
        !self.ivs.is_empty()
    }
}

/// Parsed `moof`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovieFragment {
    pub sequence_number: u32,
    pub fragments: Vec<TrackFragment>,
}

/// Parse the `moof` payload.
pub fn parse_moof(payload: &[u8]) -> Result<MovieFragment> {
    let mut fragment = MovieFragment::default();
    for child in children(payload) {
        let (kind, body) = child?;
        match kind {
            MFHD => {
                let mut reader = ByteReader::new(body, "Movie fragment header");
                reader.full_box_header()?;
                fragment.sequence_number = reader.u32()?;
            }
            TRAF => fragment.fragments.push(parse_traf(body)?),
            _ => {}
        }
    }
    trace!(sequence = fragment.sequence_number, trafs = fragment.fragments.len(), "Parsed moof");
    Ok(fragment)
}

fn parse_traf(payload: &[u8]) -> Result<TrackFragment> {
    let mut traf = TrackFragment::default();
    let mut senc: Option<&[u8]> = None;
    for child in children(payload) {
        let (kind, body) = child?;
        match kind {
            TFHD => {
                let mut reader = ByteReader::new(body, "Track fragment header");
                let (_, flags) = reader.full_box_header()?;
                traf.track_id = reader.u32()?;
                if flags & TFHD_BASE_DATA_OFFSET != 0 {
                    traf.base_data_offset = Some(reader.u64()?);
                }
                if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
                    reader.skip(4)?;
                }
                if flags & TFHD_DEFAULT_DURATION != 0 {
                    traf.default_duration = Some(reader.u32()?);
                }
                if flags & TFHD_DEFAULT_SIZE != 0 {
                    traf.default_size = Some(reader.u32()?);
                }
                if flags & TFHD_DEFAULT_FLAGS != 0 {
                    reader.skip(4)?;
                }
            }
            TFDT => {
                let mut reader = ByteReader::new(body, "Track fragment decode time");
                let (version, _) = reader.full_box_header()?;
                traf.base_decode_time = if version == 1 { reader.u64()? } else { reader.u32()? as u64 };
            }
            TRUN => traf.runs.push(parse_trun(body)?),
            SENC => senc = Some(body),
            _ => {}
        }
    }
    if let Some(body) = senc {
        traf.ivs = parse_senc(body)?;
    }
    Ok(traf)
}

fn parse_trun(payload: &[u8]) -> Result<TrackRun> {
    let mut reader = ByteReader::new(payload, "Track run");
    let (_, flags) = reader.full_box_header()?;
    let count = reader.u32()? as usize;
    let data_offset = if flags & TRUN_DATA_OFFSET != 0 { Some(reader.i32()?) } else { None };
    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        reader.skip(4)?;
    }

    if count > MAX_RUN_SAMPLES {
        return Err(PlayerError::container(
            "Track run",
            format!("Sample count {} exceeds the limit of {}", count, MAX_RUN_SAMPLES),
        ));
    }

    let per_sample = [TRUN_SAMPLE_DURATION, TRUN_SAMPLE_SIZE, TRUN_SAMPLE_FLAGS, TRUN_SAMPLE_CTO]
        .iter()
        .filter(|f| flags & **f != 0)
        .count()
        * 4;
    if per_sample > 0 && count > reader.remaining() / per_sample {
        return Err(PlayerError::container(
            "Track run",
            format!("Sample count {} exceeds box payload ({} bytes left)", count, reader.remaining()),
        ));
    }

    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        let duration = if flags & TRUN_SAMPLE_DURATION != 0 { Some(reader.u32()?) } else { None };
        let size = if flags & TRUN_SAMPLE_SIZE != 0 { Some(reader.u32()?) } else { None };
        if flags & TRUN_SAMPLE_FLAGS != 0 {
            reader.skip(4)?;
        }
        let composition_offset = if flags & TRUN_SAMPLE_CTO != 0 { reader.i32()? } else { 0 };
        samples.push(RunSample { duration, size, composition_offset });
    }
    Ok(TrackRun { data_offset, samples })
}

/// Parse `senc` into per-sample IVs.
///
/// The IV size lives in `tenc`, which this parser does not read. Without
/// subsample maps it follows from the payload length; with them, 8 and 16
/// byte IVs are tried in turn.
fn parse_senc(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = ByteReader::new(payload, "Sample encryption");
    let (_, flags) = reader.full_box_header()?;
    let count = reader.u32()? as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let entries = &payload[reader.position()..];

    if flags & SENC_USE_SUBSAMPLES == 0 {
        if entries.len() < count || entries.len() % count != 0 {
            return Err(PlayerError::container(
                "Sample encryption",
                format!("{} bytes cannot hold {} equally sized IVs", entries.len(), count),
            ));
        }
        let iv_size = entries.len() / count;
        return Ok(entries.chunks(iv_size).map(<[u8]>::to_vec).collect());
    }

    for iv_size in [8usize, 16] {
        if let Ok(ivs) = read_subsample_entries(entries, count, iv_size) {
            return Ok(ivs);
        }
    }
    Err(PlayerError::container("Sample encryption", "Could not determine IV size"))
}

fn read_subsample_entries(entries: &[u8], count: usize, iv_size: usize) -> Result<Vec<Vec<u8>>> {
    let mut reader = ByteReader::new(entries, "Sample encryption entries");
    let mut ivs = Vec::with_capacity(count);
    for _ in 0..count {
        ivs.push(reader.bytes(iv_size)?.to_vec());
        let subsamples = reader.u16()? as usize;
        reader.skip(subsamples * 6)?;
    }
    if reader.remaining() != 0 {
        return Err(PlayerError::container("Sample encryption entries", "Trailing bytes"));
    }
    Ok(ivs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FragmentSpec, build_init_segment, build_media_segment};

    #[test]
    fn reader_rejects_out_of_bounds() {
        let mut reader = ByteReader::new(&[0, 1, 2], "test");
        assert_eq!(reader.u16().unwrap(), 1);
        let err = reader.u32().unwrap_err();
        assert!(matches!(err, PlayerError::Container { .. }));
    }

    #[test]
    fn box_header_handles_large_and_short_sizes() {
        let mut large = vec![0, 0, 0, 1];
        large.extend_from_slice(b"mdat");
        large.extend_from_slice(&32u64.to_be_bytes());
        let header = BoxHeader::peek(&large).unwrap().unwrap();
        assert_eq!(header.header_len, 16);
        assert_eq!(header.size, Some(32));

        assert_eq!(BoxHeader::peek(&[0, 0, 0]).unwrap(), None);

        let mut bogus = 4u32.to_be_bytes().to_vec();
        bogus.extend_from_slice(b"free");
        assert!(BoxHeader::peek(&bogus).is_err());
    }

    #[test]
    fn parses_generated_init_segment() {
        let init = build_init_segment(7, 90000);
        assert!(init.len() <= 740);
        let header = BoxHeader::peek(&init).unwrap().unwrap();
        assert_eq!(header.kind, FTYP);

        let moov = children(&init)
            .map(Result::unwrap)
            .find(|(kind, _)| *kind == MOOV)
            .map(|(_, payload)| payload)
            .unwrap();
        let track = parse_moov(moov).unwrap();
        assert_eq!(track.track_id, 7);
        assert_eq!(track.timescale, 90000);
        assert_eq!(&track.handler, b"meta");
        assert_eq!(track.defaults.sample_duration, 3000);
    }

    #[test]
    fn parses_generated_fragment_with_ivs() {
        let spec = FragmentSpec {
            sequence: 3,
            track_id: 1,
            base_decode_time: 6000,
            sample_duration: 3000,
            samples: vec![vec![1u8; 10], vec![2u8; 20]],
            ivs: Some(vec![vec![9u8; 8], vec![8u8; 8]]),
        };
        let segment = build_media_segment(&spec);
        let moof = children(&segment)
            .map(Result::unwrap)
            .find(|(kind, _)| *kind == MOOF)
            .map(|(_, payload)| payload)
            .unwrap();
        let fragment = parse_moof(moof).unwrap();
        assert_eq!(fragment.sequence_number, 3);
        let traf = &fragment.fragments[0];
        assert_eq!(traf.base_decode_time, 6000);
        assert_eq!(traf.sample_count(), 2);
        assert_eq!(traf.runs[0].samples[1].size, Some(20));
        assert!(traf.is_encrypted());
        assert_eq!(traf.ivs[1], vec![8u8; 8]);
    }

    #[test]
    fn run_sample_count_is_bounded_without_per_sample_fields() {
        let mut trun = 0u32.to_be_bytes().to_vec();
        trun.extend_from_slice(&0x4000_0000u32.to_be_bytes());
        let err = parse_trun(&trun).unwrap_err();
        assert!(matches!(err, PlayerError::Container { .. }));

        let mut small = 0u32.to_be_bytes().to_vec();
        small.extend_from_slice(&3u32.to_be_bytes());
        let run = parse_trun(&small).unwrap();
        assert_eq!(run.samples.len(), 3);
        assert_eq!(run.samples[0].size, None);
    }

    #[test]
    fn oversized_child_is_reported() {
        let mut data = 64u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"trak");
        let results: Vec<_> = children(&data).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
