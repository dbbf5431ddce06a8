//! Test utilities: segment and payload builders plus mock collaborators
//!
//! The builders emit minimal fragmented ISO-BMFF around small grid meshes,
//! so tests and benches can run without fixture files.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::decrypt::apply_keystream;
use crate::codec::{ContentKey, PackedGeometryWriter};
use crate::media::{AbrControl, MediaClock, MediaElement};
use crate::types::{BufferedRanges, MediaType, RawSample, Representation, TimeRange};
use crate::{PlayerError, Result};

/// Timescale used by the generated tracks.
pub const TIMESCALE: u32 = 90000;
/// Frame duration of the generated tracks, 30 fps at [`TIMESCALE`].
pub const FRAME_DURATION: u32 = 3000;

/// Plain box around `payload`.
pub fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

/// Full box with version and flags around `payload`.
pub fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    body.extend_from_slice(&(((version as u32) << 24) | (flags & 0x00FF_FFFF)).to_be_bytes());
    body.extend_from_slice(payload);
    boxed(kind, &body)
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Initialization segment with one `meta` track whose `trex` default sample
/// duration is [`FRAME_DURATION`].
pub fn build_init_segment(track_id: u32, timescale: u32) -> Vec<u8> {
    let mut ftyp = b"iso6".to_vec();
    ftyp.extend_from_slice(&0u32.to_be_bytes());
    ftyp.extend_from_slice(b"iso6mp41");

    let mut mvhd = words(&[0, 0, timescale, 0, 0x0001_0000]);
    mvhd.extend_from_slice(&[0x01, 0x00, 0, 0]);
    mvhd.extend_from_slice(&[0u8; 8 + 36 + 24]);
    mvhd.extend_from_slice(&(track_id + 1).to_be_bytes());

    let mut tkhd = words(&[0, 0, track_id, 0, 0]);
    tkhd.extend_from_slice(&[0u8; 60]);

    let mut mdhd = words(&[0, 0, timescale, 0]);
    mdhd.extend_from_slice(&[0x55, 0xC4, 0, 0]);

    let mut hdlr = 0u32.to_be_bytes().to_vec();
    hdlr.extend_from_slice(b"meta");
    hdlr.extend_from_slice(&[0u8; 12]);
    hdlr.extend_from_slice(b"GeometryHandler\0");

    let mdia = [full_box(b"mdhd", 0, 0, &mdhd), full_box(b"hdlr", 0, 0, &hdlr)].concat();
    let trak = [full_box(b"tkhd", 0, 3, &tkhd), boxed(b"mdia", &mdia)].concat();
    let trex = full_box(b"trex", 0, 0, &words(&[track_id, 1, FRAME_DURATION, 0, 0]));
    let moov = [full_box(b"mvhd", 0, 0, &mvhd), boxed(b"trak", &trak), boxed(b"mvex", &trex)].concat();

    [boxed(b"ftyp", &ftyp), boxed(b"moov", &moov)].concat()
}

/// Description of one generated media segment.
#[derive(Debug, Clone)]
pub struct FragmentSpec {
    pub sequence: u32,
    pub track_id: u32,
    pub base_decode_time: u64,
    pub sample_duration: u32,
    pub samples: Vec<Vec<u8>>,
    /// Per-sample IVs; `Some` adds a `senc` box
    pub ivs: Option<Vec<Vec<u8>>>,
}

/// `moof` + `mdat` for `spec`, sample offsets relative to the `moof`.
pub fn build_media_segment(spec: &FragmentSpec) -> Vec<u8> {
    let build_moof = |data_offset: i32| {
        let tfhd = full_box(b"tfhd", 0, 0x02_0000, &spec.track_id.to_be_bytes());
        let tfdt = full_box(b"tfdt", 1, 0, &spec.base_decode_time.to_be_bytes());

        let mut trun = (spec.samples.len() as u32).to_be_bytes().to_vec();
        trun.extend_from_slice(&data_offset.to_be_bytes());
        for sample in &spec.samples {
            trun.extend_from_slice(&spec.sample_duration.to_be_bytes());
            trun.extend_from_slice(&(sample.len() as u32).to_be_bytes());
        }
        let mut traf = [tfhd, tfdt, full_box(b"trun", 0, 0x00_0301, &trun)].concat();

        if let Some(ivs) = &spec.ivs {
            let mut senc = (ivs.len() as u32).to_be_bytes().to_vec();
            for iv in ivs {
                senc.extend_from_slice(iv);
            }
            traf.extend(full_box(b"senc", 0, 0, &senc));
        }

        let mfhd = full_box(b"mfhd", 0, 0, &spec.sequence.to_be_bytes());
        boxed(b"moof", &[mfhd, boxed(b"traf", &traf)].concat())
    };

    let moof_len = build_moof(0).len();
    let moof = build_moof(moof_len as i32 + 8);
    let mdat = boxed(b"mdat", &spec.samples.concat());
    [moof, mdat].concat()
}

/// Vertices per side of the generated grid meshes.
pub const GRID_SIDE: usize = 8;

fn grid_indices() -> Vec<u32> {
    let side = GRID_SIDE as u32;
    let mut indices = Vec::with_capacity((GRID_SIDE - 1) * (GRID_SIDE - 1) * 6);
    for row in 0..side - 1 {
        for col in 0..side - 1 {
            let i = row * side + col;
            indices.extend_from_slice(&[i, i + 1, i + side, i + 1, i + side + 1, i + side]);
        }
    }
    indices
}

fn grid_uvs() -> Vec<f32> {
    let scale = (GRID_SIDE - 1) as f32;
    (0..GRID_SIDE * GRID_SIDE)
        .flat_map(|i| [(i % GRID_SIDE) as f32 / scale, (i / GRID_SIDE) as f32 / scale])
        .collect()
}

/// Flat grid of `GRID_SIDE`² vertices whose first vertex sits at `seed` on
/// every axis. One payload is well over the init-segment threshold, like a
/// real geometry sample.
pub fn full_payload(seed: f32) -> Vec<u8> {
    let positions: Vec<f32> = (0..GRID_SIDE * GRID_SIDE)
        .flat_map(|i| [seed + (i % GRID_SIDE) as f32, seed + (i / GRID_SIDE) as f32, seed])
        .collect();
    let normals: Vec<f32> = (0..GRID_SIDE * GRID_SIDE).flat_map(|_| [0.0, 0.0, 1.0]).collect();
    PackedGeometryWriter::new()
        .positions(positions)
        .normals(normals)
        .uvs(grid_uvs())
        .indices(grid_indices())
        .finish()
        .expect("packed grid payload")
}

/// Payload with a FULL frame at the origin followed by `deltas` DELTA frames
/// one [`FRAME_DURATION`] apart, each moving every vertex by `step`.
pub fn delta_payload(first_timestamp: u64, deltas: usize, step: f32) -> Vec<u8> {
    let timestamps: Vec<i32> =
        (0..=deltas).map(|i| (first_timestamp + i as u64 * FRAME_DURATION as u64) as i32).collect();
    let delta_frames: Vec<i32> = (1..=deltas as i32).collect();
    let components = GRID_SIDE * GRID_SIDE * 3;
    let mut writer = PackedGeometryWriter::new()
        .timestamps(&timestamps)
        .delta_frames(&delta_frames)
        .positions(vec![0.0; components])
        .uvs(grid_uvs())
        .indices(grid_indices());
    for _ in 0..deltas {
        writer = writer.delta_positions(vec![step; components]);
    }
    writer.finish().expect("packed delta payload")
}

/// Clear sample on track 1 at [`TIMESCALE`].
pub fn raw_sample(data: Vec<u8>, dts: u64, duration: u64) -> RawSample {
    RawSample { track_id: 1, data: data.into(), dts, duration, timescale: TIMESCALE, encrypted: false, iv: None }
}

/// Media segment of `count` FULL frames starting at frame `first_frame`.
pub fn keyframe_fragment(sequence: u32, first_frame: u64, count: usize) -> FragmentSpec {
    FragmentSpec {
        sequence,
        track_id: 1,
        base_decode_time: first_frame * FRAME_DURATION as u64,
        sample_duration: FRAME_DURATION,
        samples: (0..count).map(|i| full_payload((first_frame + i as u64) as f32)).collect(),
        ivs: None,
    }
}

/// Encrypt every sample of `spec` in place with 8-byte IVs.
pub fn encrypt_fragment(spec: &mut FragmentSpec, key: &ContentKey) {
    let mut ivs = Vec::with_capacity(spec.samples.len());
    for (index, sample) in spec.samples.iter_mut().enumerate() {
        let iv = vec![index as u8 + 1; 8];
        apply_keystream(key, &iv, sample).expect("valid iv");
        ivs.push(iv);
    }
    spec.ivs = Some(ivs);
}

#[derive(Debug)]
struct ElementState {
    time: f64,
    paused: bool,
    buffered: BufferedRanges,
    width: u32,
    seeks: Vec<f64>,
    plays: usize,
    pauses: usize,
    /// Whether a seek moves `time` immediately
    seek_lands: bool,
    /// Seconds the clock runs on while pausing
    pause_drift: f64,
    /// Drop the buffered ranges on the next seek
    flush_next_seek: bool,
}

/// Scriptable media element.
#[derive(Debug)]
pub struct MockElement {
    state: Mutex<ElementState>,
}

impl MockElement {
    pub fn new(width: u32) -> Self {
        Self {
            state: Mutex::new(ElementState {
                time: 0.0,
                paused: true,
                buffered: BufferedRanges::new(),
                width,
                seeks: Vec::new(),
                plays: 0,
                pauses: 0,
                seek_lands: true,
                pause_drift: 0.0,
                flush_next_seek: false,
            }),
        }
    }

    /// Element with video buffered over `[start, end)`.
    pub fn buffered_over(width: u32, start: f64, end: f64) -> Self {
        let element = Self::new(width);
        element.set_buffered(BufferedRanges::from_intervals([TimeRange::new(start, end)]));
        element
    }

    pub fn set_buffered(&self, ranges: BufferedRanges) {
        self.state.lock().unwrap().buffered = ranges;
    }

    pub fn set_time(&self, time: f64) {
        self.state.lock().unwrap().time = time;
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().unwrap().paused = paused;
    }

    /// Keep the clock still on seek, as if the element were stalled.
    pub fn stall_seeks(&self) {
        self.state.lock().unwrap().seek_lands = false;
    }

    /// Advance the clock by `drift` seconds whenever the element is paused.
    pub fn set_pause_drift(&self, drift: f64) {
        self.state.lock().unwrap().pause_drift = drift;
    }

    /// Empty the buffered ranges on the next seek only.
    pub fn flush_next_seek(&self) {
        self.state.lock().unwrap().flush_next_seek = true;
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().unwrap().seeks.clone()
    }

    pub fn play_count(&self) -> usize {
        self.state.lock().unwrap().plays
    }

    pub fn pause_count(&self) -> usize {
        self.state.lock().unwrap().pauses
    }
}

impl MediaClock for MockElement {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }
}

#[async_trait::async_trait]
impl MediaElement for MockElement {
    fn buffered(&self) -> BufferedRanges {
        self.state.lock().unwrap().buffered.clone()
    }

    async fn play(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.paused = false;
        state.plays += 1;
        Ok(())
    }

    fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = true;
        state.pauses += 1;
        let drift = state.pause_drift;
        state.time += drift;
    }

    fn seek(&self, time: f64) {
        let mut state = self.state.lock().unwrap();
        state.seeks.push(time);
        if std::mem::take(&mut state.flush_next_seek) {
            state.buffered = BufferedRanges::new();
        }
        if state.seek_lands {
            state.time = time;
        }
    }

    fn video_width(&self) -> u32 {
        self.state.lock().unwrap().width
    }
}

/// Streaming client stand-in recording representation switches.
#[derive(Debug)]
pub struct MockAbr {
    representations: Vec<Representation>,
    current: Mutex<HashMap<MediaType, String>>,
    auto_switch: Mutex<HashMap<MediaType, bool>>,
    switches: Mutex<Vec<(MediaType, String)>>,
}

impl MockAbr {
    /// The first representation of each media type starts selected.
    pub fn new(representations: Vec<Representation>) -> Self {
        let mut current = HashMap::new();
        for rep in &representations {
            current.entry(rep.media_type).or_insert_with(|| rep.id.clone());
        }
        Self {
            representations,
            current: Mutex::new(current),
            auto_switch: Mutex::new(HashMap::from([(MediaType::Video, true), (MediaType::Mesh, true)])),
            switches: Mutex::new(Vec::new()),
        }
    }

    pub fn switches(&self) -> Vec<(MediaType, String)> {
        self.switches.lock().unwrap().clone()
    }

    pub fn auto_switch(&self, media: MediaType) -> bool {
        self.auto_switch.lock().unwrap().get(&media).copied().unwrap_or(false)
    }
}

impl AbrControl for MockAbr {
    fn representations(&self, media: MediaType) -> Vec<Representation> {
        self.representations.iter().filter(|r| r.media_type == media).cloned().collect()
    }

    fn current_representation(&self, media: MediaType) -> Option<Representation> {
        let current = self.current.lock().unwrap();
        let id = current.get(&media)?;
        self.representations.iter().find(|r| r.media_type == media && &r.id == id).cloned()
    }

    fn set_representation(&self, media: MediaType, id: &str) -> Result<()> {
        if !self.representations.iter().any(|r| r.media_type == media && r.id == id) {
            return Err(PlayerError::collaborator(format!("no {media:?} representation '{id}'")));
        }
        self.current.lock().unwrap().insert(media, id.to_string());
        self.switches.lock().unwrap().push((media, id.to_string()));
        Ok(())
    }

    fn set_auto_switch(&self, media: MediaType, enabled: bool) {
        self.auto_switch.lock().unwrap().insert(media, enabled);
    }
}
