//! Frame store: a source buffer for geometry segments
//!
//! [`FrameStore`] accepts fragmented ISO-BMFF segments carrying compressed
//! geometry, decodes them (inline or on a [`DecodePool`]) and caches the
//! reconstructed frames by frame number for the renderer.
//!
//! ## Update lifecycle
//!
//! Mutations follow source-buffer rules: one operation in flight at a time.
//! [`FrameStore::append`] validates and stages a segment synchronously and
//! emits [`BufferEvent::UpdateStart`]. [`FrameStore::drain`] parses, decodes
//! and commits it, then emits `Update` and `UpdateEnd`. Calling `append` or
//! `remove` in between fails with [`PlayerError::InvalidState`].
//!
//! ```no_run
//! # async fn example(segment: holosync::Segment) -> holosync::Result<()> {
//! use holosync::{BufferConfig, FrameStore};
//!
//! let mut store = FrameStore::new(BufferConfig::default());
//! let mut snapshots = store.watch_snapshot();
//! store.append(segment)?;
//! store.drain().await;
//! if snapshots.borrow_and_update().can_play(0.0, 0.0) {
//!     let _frame = store.frame(0);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Encrypted content
//!
//! A batch with encrypted samples is parked while no key is held and the
//! demuxer pauses behind it. Once a key is installed the parked batches are
//! decoded first, in arrival order, by the next `append` or by
//! [`FrameStore::wait_for_key`].

pub mod events;
mod pool;
pub mod registry;


use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::decrypt::decrypt_sample;
use crate::codec::{ContentKey, GeometryCodec, KeySlot, PackedGeometryCodec, decode_sample};
use crate::config::{BufferConfig, DecodeModeKind, QuotaPolicy};
use crate::container::{Demuxer, SampleBatch};
use crate::media::MediaClock;
use crate::stream::{PollOutcome, poll_until};
use crate::types::{BufferedRanges, DecodedFrame, FrameKind, RawSample, Segment};
use crate::{PlayerError, Result};

pub use events::{BufferEvent, BufferSnapshot};
pub use pool::{DecodeOutput, DecodePool};
pub use registry::{BufferFactory, BufferRegistry, MESH_FB_MIME, MESH_MP4_MIME};

const EVENT_CAPACITY: usize = 64;

/// Where a store decodes its samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// On the control task, yielding between samples
    Inline,
    /// Round-robin over a fixed set of worker threads
    Pooled { workers: usize },
}

enum Decoder {
    Inline,
    Pooled(DecodePool),
}

impl Decoder {
    fn from_config(config: &BufferConfig, codec: &Arc<dyn GeometryCodec>) -> Self {
        match config.decode_mode {
            DecodeModeKind::Inline => Decoder::Inline,
            DecodeModeKind::Pooled => match DecodePool::spawn(config.workers, Arc::clone(codec)) {
                Ok(pool) => Decoder::Pooled(pool),
                Err(e) => {
                    warn!(error = %e, "Decode pool unavailable, decoding inline");
                    Decoder::Inline
                }
            },
        }
    }

    fn mode(&self) -> DecodeMode {
        match self {
            Decoder::Inline => DecodeMode::Inline,
            Decoder::Pooled(pool) => DecodeMode::Pooled { workers: pool.workers() },
        }
    }
}

/// Handle for waiting on a content key without borrowing the store.
///
/// Resolves `false` when the store is reset, aborted or destroyed first.
#[derive(Debug, Clone)]
pub struct KeyWait {
    slot: KeySlot,
    cancel: CancellationToken,
    period: Duration,
}

impl KeyWait {
    pub async fn wait(self) -> bool {
        let slot = self.slot;
        let outcome = poll_until(self.period, None, &self.cancel, || slot.is_set()).await;
        match outcome {
            PollOutcome::Ready(attempts) => {
                debug!(attempts, "Content key available");
                true
            }
            PollOutcome::TimedOut | PollOutcome::Cancelled => false,
        }
    }
}

/// Decoded geometry frames keyed by frame number.
pub struct FrameStore {
    config: BufferConfig,
    codec: Arc<dyn GeometryCodec>,
    decoder: Decoder,
    demuxer: Demuxer,
    frames: HashMap<u64, Arc<DecodedFrame>>,
    cached_bytes: u64,
    /// Decoded but not committed, held until a keyframe initializes the store
    pending_frames: Vec<DecodedFrame>,
    /// Batches waiting for a content key, in arrival order
    queued: VecDeque<SampleBatch>,
    staged: Option<Segment>,
    key: KeySlot,
    key_cancel: CancellationToken,
    clock: Option<Arc<dyn MediaClock>>,
    updating: bool,
    initialized: bool,
    destroyed: bool,
    timescale: u32,
    frame_duration: u64,
    ranges: BufferedRanges,
    file_cursor: u64,
    bytes_received: u64,
    timestamp_offset: f64,
    append_window: (f64, f64),
    events: broadcast::Sender<BufferEvent>,
    snapshot: watch::Sender<BufferSnapshot>,
}

impl FrameStore {
    /// Create a store decoding the packed geometry format.
    pub fn new(config: BufferConfig) -> Self {
        Self::with_codec(config, Arc::new(PackedGeometryCodec::new()))
    }

    /// Create a store that owns `codec`.
    pub fn with_codec(config: BufferConfig, codec: Arc<dyn GeometryCodec>) -> Self {
        let decoder = Decoder::from_config(&config, &codec);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, _) = watch::channel(BufferSnapshot::default());
        let demuxer = Demuxer::new().with_max_box_len(config.max_buffer_bytes);
        debug!(codec = codec.name(), mode = ?decoder.mode(), "Frame store created");

        Self {
            config,
            codec,
            decoder,
            demuxer,
            frames: HashMap::new(),
            cached_bytes: 0,
            pending_frames: Vec::new(),
            queued: VecDeque::new(),
            staged: None,
            key: KeySlot::new(),
            key_cancel: CancellationToken::new(),
            clock: None,
            updating: false,
            initialized: false,
            destroyed: false,
            timescale: 0,
            frame_duration: 0,
            ranges: BufferedRanges::new(),
            file_cursor: 0,
            bytes_received: 0,
            timestamp_offset: 0.0,
            append_window: (0.0, f64::INFINITY),
            events,
            snapshot,
        }
    }

    /// Share a session-wide key slot.
    pub fn with_key_slot(mut self, slot: KeySlot) -> Self {
        self.key = slot;
        self
    }

    /// Attach the media clock consulted by `remove`.
    pub fn with_clock(mut self, clock: Arc<dyn MediaClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn attach_clock(&mut self, clock: Arc<dyn MediaClock>) {
        self.clock = Some(clock);
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.decoder.mode()
    }

    /// Stage `segment` and start an update.
    ///
    /// Call [`drain`](Self::drain) to complete it.
    pub fn append(&mut self, segment: Segment) -> Result<()> {
        if self.destroyed {
            return Err(PlayerError::invalid_state("append on a destroyed buffer"));
        }
        if self.updating {
            return Err(PlayerError::invalid_state("append"));
        }
        self.check_quota()?;

        trace!(bytes = segment.len(), offset = ?segment.offset, "Append staged");
        self.staged = Some(segment);
        self.updating = true;
        self.emit(BufferEvent::UpdateStart);
        Ok(())
    }

    /// Append and complete the update in one call.
    pub async fn append_and_drain(&mut self, segment: Segment) -> Result<()> {
        self.append(segment)?;
        self.drain().await;
        Ok(())
    }

    /// Complete the in-flight update, if any.
    ///
    /// Malformed data and undecodable samples are dropped with a warning.
    pub async fn drain(&mut self) {
        if !self.updating {
            return;
        }
        if let Some(segment) = self.staged.take() {
            self.ingest(segment);
        }
        self.process().await;
        let changed = self.finalize();
        self.finish_update(changed);
    }

    /// Remove frames covering `[start, end)` seconds.
    ///
    /// Ignored, with the update lifecycle still emitted, while the store is
    /// uninitialized or when the range holds the current playback position.
    pub fn remove(&mut self, start: f64, end: f64) -> Result<()> {
        if self.updating {
            return Err(PlayerError::invalid_state("remove"));
        }
        self.updating = true;
        self.emit(BufferEvent::UpdateStart);

        let current = self.clock.as_ref().map(|c| (c.current_time(), c.is_paused()));
        if !self.initialized {
            debug!(start, end, "Remove ignored, buffer not initialized");
        } else if self.config.hold_frames_while_paused && matches!(current, Some((_, true))) {
            debug!(start, end, "Remove ignored while paused");
        } else if let Some((time, _)) = current
            && start <= time
            && time <= end
        {
            debug!(start, end, current_time = time, "Remove ignored, range holds the playback position");
        } else {
            let scale = self.timescale as f64 / self.frame_duration as f64;
            let first = (start * scale).floor() as u64;
            let last = (end * scale).floor() as u64;
            let before = self.frames.len();
            let mut freed = 0u64;
            self.frames.retain(|number, frame| {
                let keep = !(first..last).contains(number);
                if !keep {
                    freed += frame.byte_size() as u64;
                }
                keep
            });
            self.cached_bytes = self.cached_bytes.saturating_sub(freed);
            debug!(start, end, first, last, removed = before - self.frames.len(), "Frames removed");
        }

        self.refresh_ranges();
        self.updating = false;
        self.emit(BufferEvent::Update);
        self.emit(BufferEvent::UpdateEnd);
        Ok(())
    }

    /// Frame with number `frame_number`, if cached.
    pub fn frame(&self, frame_number: u64) -> Option<Arc<DecodedFrame>> {
        self.frames.get(&frame_number).cloned()
    }

    /// Whether `time` (± `tolerance`) seconds is buffered.
    pub fn can_play(&self, time: f64, tolerance: f64) -> bool {
        self.initialized && self.ranges.contains(time, tolerance)
    }

    /// Drop all media state. The content key is kept.
    ///
    /// A second reset in a row does nothing.
    pub fn reset(&mut self) {
        if self.is_pristine() {
            trace!("Reset skipped, buffer already empty");
            return;
        }
        self.clear_media();
        debug!("Frame store reset");
    }

    /// Cancel the in-flight update.
    pub fn abort(&mut self) {
        if !self.updating {
            return;
        }
        self.staged = None;
        self.clear_media();
        self.updating = false;
        info!("Update aborted");
        self.emit(BufferEvent::Abort);
        self.emit(BufferEvent::UpdateEnd);
    }

    /// Install the content key for this store and every store sharing its slot.
    pub fn set_key(&self, key: ContentKey) {
        self.key.set(key);
    }

    pub fn key_slot(&self) -> KeySlot {
        self.key.clone()
    }

    /// Number of batches parked until a key arrives.
    pub fn queued_batches(&self) -> usize {
        self.queued.len()
    }

    /// Waiter for the content key, `None` when nothing is parked.
    pub fn key_waiter(&self) -> Option<KeyWait> {
        if self.queued.is_empty() {
            return None;
        }
        Some(KeyWait {
            slot: self.key.clone(),
            cancel: self.key_cancel.clone(),
            period: self.config.key_poll_interval(),
        })
    }

    /// Wait for the content key, then decode the parked batches.
    ///
    /// Returns whether parked batches were processed.
    pub async fn wait_for_key(&mut self) -> Result<bool> {
        let Some(waiter) = self.key_waiter() else {
            return Ok(false);
        };
        if !waiter.wait().await {
            return Ok(false);
        }
        self.resume().await?;
        Ok(true)
    }

    /// Decode parked batches now that a key is available.
    pub async fn resume(&mut self) -> Result<()> {
        if self.updating {
            return Err(PlayerError::invalid_state("resume"));
        }
        self.updating = true;
        self.emit(BufferEvent::UpdateStart);
        self.process().await;
        let changed = self.finalize();
        self.finish_update(changed);
        Ok(())
    }

    /// Event stream for this store.
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Snapshot receiver, updated after every change.
    pub fn watch_snapshot(&self) -> watch::Receiver<BufferSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn buffered(&self) -> BufferedRanges {
        self.ranges.clone()
    }

    pub fn is_updating(&self) -> bool {
        self.updating
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Total bytes accepted since creation.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn frame_duration(&self) -> u64 {
        self.frame_duration
    }

    pub fn timestamp_offset(&self) -> f64 {
        self.timestamp_offset
    }

    pub fn set_timestamp_offset(&mut self, offset: f64) {
        debug!(offset, "Timestamp offset set");
        self.timestamp_offset = offset;
    }

    pub fn append_window(&self) -> (f64, f64) {
        self.append_window
    }

    /// Frames starting outside `[start, end)` seconds are dropped at commit.
    pub fn set_append_window(&mut self, start: f64, end: f64) -> Result<()> {
        if self.updating {
            return Err(PlayerError::invalid_state("set_append_window"));
        }
        if !(start >= 0.0 && end > start) {
            return Err(PlayerError::config(format!("append window [{start}, {end}) is empty or negative")));
        }
        self.append_window = (start, end);
        Ok(())
    }

    /// Stop workers and cancel waits. Further appends fail.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.key_cancel.cancel();
        self.demuxer.stop();
        self.staged = None;
        self.queued.clear();
        self.pending_frames.clear();
        self.updating = false;
        if let Decoder::Pooled(pool) = &mut self.decoder {
            pool.shutdown();
        }
        self.decoder = Decoder::Inline;
        info!(frames = self.frames.len(), "Frame store destroyed");
    }

    fn is_pristine(&self) -> bool {
        !self.initialized
            && self.frames.is_empty()
            && self.pending_frames.is_empty()
            && self.queued.is_empty()
            && self.file_cursor == 0
            && self.demuxer.position() == 0
    }

    fn clear_media(&mut self) {
        self.demuxer.reset();
        self.frames.clear();
        self.cached_bytes = 0;
        self.pending_frames.clear();
        self.queued.clear();
        self.file_cursor = 0;
        self.initialized = false;
        self.timescale = 0;
        self.frame_duration = 0;
        self.key_cancel.cancel();
        self.key_cancel = CancellationToken::new();
        if let Decoder::Pooled(pool) = &mut self.decoder {
            pool.cancel_in_flight();
        }
        self.refresh_ranges();
    }

    fn check_quota(&self) -> Result<()> {
        let breach = if self.frames.len() >= self.config.max_frames {
            Some(("frames", self.config.max_frames as u64, self.frames.len() as u64))
        } else if self.cached_bytes >= self.config.max_buffer_bytes {
            Some(("bytes", self.config.max_buffer_bytes, self.cached_bytes))
        } else {
            None
        };
        let Some((resource, limit, actual)) = breach else {
            return Ok(());
        };
        match self.config.quota_policy {
            QuotaPolicy::Enforce => Err(PlayerError::quota_exceeded(resource, limit, actual)),
            QuotaPolicy::Warn => {
                warn!(resource, limit, actual, "Frame store over quota");
                Ok(())
            }
        }
    }

    fn ingest(&mut self, segment: Segment) {
        let len = segment.len();
        if len <= self.config.init_segment_max_len {
            debug!(bytes = len, "Initialization segment, restarting parser");
            self.clear_media();
        }

        let offset = segment.offset.unwrap_or(self.file_cursor);
        if offset != self.file_cursor {
            info!(expected = self.file_cursor, offset, "Gap at {}", self.file_cursor);
        }
        self.file_cursor = self.demuxer.append(offset, &segment.data);
        self.bytes_received += len as u64;
    }

    /// Decode parked batches if a key arrived, then everything the demuxer
    /// can extract.
    async fn process(&mut self) {
        if !self.queued.is_empty() && self.key.is_set() {
            debug!(batches = self.queued.len(), "Key available, decoding queued batches");
            while let Some(batch) = self.queued.pop_front() {
                self.decode_batch(batch).await;
            }
            self.demuxer.start();
        }

        loop {
            match self.demuxer.next_batch() {
                Ok(Some(batch)) if batch.is_encrypted() && !self.key.is_set() => {
                    debug!(sequence = batch.sequence_number, samples = batch.len(), "Encrypted batch waiting for key");
                    self.queued.push_back(batch);
                    self.demuxer.stop();
                    self.emit(BufferEvent::WaitingForKey);
                    break;
                }
                Ok(Some(batch)) => self.decode_batch(batch).await,
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Dropping unparseable segment data"),
            }
        }
    }

    async fn decode_batch(&mut self, batch: SampleBatch) {
        let key = self.key.get();
        let samples: Vec<RawSample> = batch
            .samples
            .into_iter()
            .filter_map(|sample| {
                if !sample.encrypted {
                    return Some(sample);
                }
                let key = key.as_deref()?;
                decrypt_sample(key, &sample)
                    .inspect_err(|e| warn!(dts = sample.dts, error = %e, "Dropping undecryptable sample"))
                    .ok()
            })
            .collect();

        match &mut self.decoder {
            Decoder::Inline => {
                for sample in &samples {
                    collect_frames(&mut self.pending_frames, sample.dts, decode_sample(self.codec.as_ref(), sample));
                    tokio::task::yield_now().await;
                }
            }
            Decoder::Pooled(pool) => {
                for sample in samples {
                    if let Err(e) = pool.submit(sample.clone()) {
                        warn!(error = %e, "Decode pool rejected sample, decoding inline");
                        collect_frames(&mut self.pending_frames, sample.dts, decode_sample(self.codec.as_ref(), &sample));
                    }
                }
                for output in pool.collect().await {
                    collect_frames(&mut self.pending_frames, output.dts, output.frames);
                }
            }
        }
    }

    /// Commit pending frames. Returns whether the cache changed.
    fn finalize(&mut self) -> bool {
        if self.pending_frames.is_empty() {
            return false;
        }
        self.pending_frames.sort_by_key(|f| f.timestamp);

        for frame in self.pending_frames.iter().filter(|f| f.kind == FrameKind::Full) {
            self.timescale = frame.timescale;
            self.frame_duration = frame.duration;
            if !self.initialized {
                self.initialized = true;
                info!(timescale = frame.timescale, frame_duration = frame.duration, "Frame store initialized");
                let _ = self.events.send(BufferEvent::Initialized);
            }
        }
        if !self.initialized {
            debug!(held = self.pending_frames.len(), "Holding frames until a keyframe arrives");
            return false;
        }

        let (window_start, window_end) = self.append_window;
        let mut committed = 0usize;
        for frame in self.pending_frames.drain(..) {
            let start = frame.start_time();
            if start < window_start || start >= window_end {
                trace!(start, "Frame outside append window");
                continue;
            }
            let bytes = frame.byte_size() as u64;
            if let Some(previous) = self.frames.insert(frame.frame_number(), Arc::new(frame)) {
                self.cached_bytes = self.cached_bytes.saturating_sub(previous.byte_size() as u64);
            }
            self.cached_bytes += bytes;
            committed += 1;
        }
        trace!(committed, total = self.frames.len(), "Frames committed");
        self.refresh_ranges();
        true
    }

    fn finish_update(&mut self, changed: bool) {
        self.updating = false;
        if changed {
            self.emit(BufferEvent::Update);
        }
        self.emit(BufferEvent::UpdateEnd);
    }

    fn refresh_ranges(&mut self) {
        self.ranges = BufferedRanges::from_frames(
            self.frames.values().map(|f| (f.timestamp, f.duration)),
            self.timescale,
            self.frame_duration,
        );
        self.snapshot.send_replace(BufferSnapshot {
            initialized: self.initialized,
            timescale: self.timescale,
            frame_duration: self.frame_duration,
            ranges: self.ranges.clone(),
            frame_count: self.frames.len(),
        });
    }

    fn emit(&self, event: BufferEvent) {
        trace!(?event, "Buffer event");
        let _ = self.events.send(event);
    }
}

fn collect_frames(pending: &mut Vec<DecodedFrame>, dts: u64, frames: Result<Vec<DecodedFrame>>) {
    match frames {
        Ok(frames) => pending.extend(frames),
        Err(e) => warn!(dts, error = %e, "Dropping undecodable sample"),
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        self.key_cancel.cancel();
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("mode", &self.decoder.mode())
            .field("initialized", &self.initialized)
            .field("updating", &self.updating)
            .field("frames", &self.frames.len())
            .field("queued_batches", &self.queued.len())
            .field("ranges", &self.ranges)
            .finish()
    }
}
