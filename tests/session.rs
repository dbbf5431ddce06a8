//! Session-level tests through the public API
//!
//! Wires configuration, quality coordination, playback and timecode sync
//! together the way an embedding player does, with minimal stand-ins for the
//! video element and streaming client.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, ensure};
use holosync::media::{AbrControl, MediaClock, MediaElement};
use holosync::{
    BufferSnapshot, BufferedRanges, MediaType, PlaybackState, PlaybackStateMachine, PlayerConfig, PlayerError,
    QualityCoordinator, QualityEvent, RepresentationChange, Representation, TimeRange, TimecodeSync,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
buffer:
  max_frames: 120
  decode_mode: inline
playback:
  seek_poll_interval_ms: 50
  seek_timeout_ms: 1000
quality:
  max_texture_size: 2048
timecode:
  wrap_policy: bucket
"#;

struct Video {
    time: Mutex<f64>,
    paused: Mutex<bool>,
    pauses: AtomicUsize,
    buffered: BufferedRanges,
}

impl Video {
    fn new(end: f64) -> Self {
        Self {
            time: Mutex::new(0.0),
            paused: Mutex::new(true),
            pauses: AtomicUsize::new(0),
            buffered: BufferedRanges::from_intervals([TimeRange::new(0.0, end)]),
        }
    }
}

impl MediaClock for Video {
    fn current_time(&self) -> f64 {
        *self.time.lock().unwrap()
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl MediaElement for Video {
    fn buffered(&self) -> BufferedRanges {
        self.buffered.clone()
    }

    async fn play(&self) -> holosync::Result<()> {
        *self.paused.lock().unwrap() = false;
        Ok(())
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        *self.paused.lock().unwrap() = true;
    }

    fn seek(&self, time: f64) {
        *self.time.lock().unwrap() = time;
    }

    fn video_width(&self) -> u32 {
        1920
    }
}

struct Client {
    reps: Vec<Representation>,
    current: Mutex<HashMap<MediaType, String>>,
    auto: Mutex<HashMap<MediaType, bool>>,
}

impl Client {
    fn new(reps: Vec<Representation>) -> Self {
        let current = HashMap::from([(MediaType::Video, reps[0].id.clone())]);
        Self { reps, current: Mutex::new(current), auto: Mutex::new(HashMap::new()) }
    }
}

impl AbrControl for Client {
    fn representations(&self, media: MediaType) -> Vec<Representation> {
        self.reps.iter().filter(|r| r.media_type == media).cloned().collect()
    }

    fn current_representation(&self, media: MediaType) -> Option<Representation> {
        let id = self.current.lock().unwrap().get(&media)?.clone();
        self.reps.iter().find(|r| r.id == id).cloned()
    }

    fn set_representation(&self, media: MediaType, id: &str) -> holosync::Result<()> {
        self.current.lock().unwrap().insert(media, id.to_string());
        Ok(())
    }

    fn set_auto_switch(&self, media: MediaType, enabled: bool) {
        self.auto.lock().unwrap().insert(media, enabled);
    }
}

fn load_config() -> Result<PlayerConfig> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(CONFIG.as_bytes())?;
    let config = PlayerConfig::from_file(file.path()).context("config file should load")?;
    config.validate()?;
    Ok(config)
}

fn snapshot(end: f64) -> BufferSnapshot {
    BufferSnapshot {
        initialized: true,
        timescale: 90000,
        frame_duration: 3000,
        ranges: BufferedRanges::from_intervals([TimeRange::new(0.0, end)]),
        frame_count: (end * 30.0) as usize,
    }
}

#[test]
fn config_file_drives_components() -> Result<()> {
    let config = load_config()?;
    assert_eq!(config.buffer.max_frames, 120);
    assert_eq!(config.quality.max_texture_size, 2048);
    assert_eq!(config.playback.seek_timeout().as_millis(), 1000);

    let mut sync = TimecodeSync::new(&config.timecode);
    let region = sync.layout().encode(6);
    let frame = sync.sync(&region, 34.3, &snapshot(40.0)).context("initialized store resolves frames")?;
    ensure!(frame == 1030, "bucket rule should place code 6 after the first wrap, got {frame}");
    Ok(())
}

#[tokio::test]
async fn quality_switch_pauses_and_resumes_playback() -> Result<()> {
    let config = load_config()?;
    let client = Arc::new(Client::new(vec![
        Representation::video("720p-30fps", 30.0, 1280, 720),
        Representation::video("1080p-60fps", 60.0, 1920, 1080),
        Representation::mesh("30fps"),
        Representation::mesh("60fps"),
    ]));
    let video = Arc::new(Video::new(10.0));
    let (_mesh_tx, mesh_rx) = watch::channel(snapshot(10.0));

    let mut quality = QualityCoordinator::new(client.clone(), config.quality.clone());
    let playback = Arc::new(PlaybackStateMachine::new(video.clone(), mesh_rx, config.playback.clone()));
    let cancel = CancellationToken::new();
    let listener = playback.spawn_quality_listener(quality.subscribe(), cancel.clone());

    quality.on_initialized()?;
    assert_eq!(client.current_representation(MediaType::Mesh).map(|r| r.id), Some("30fps".into()));
    playback.on_player_initialized()?;
    video.play().await?;
    playback.set_state(PlaybackState::Playing)?;

    quality.handle_change(RepresentationChange::rendered(Representation::video("1080p-60fps", 60.0, 1920, 1080)))?;
    assert_eq!(quality.frame_rate(), 60.0);
    assert_eq!(client.current_representation(MediaType::Mesh).map(|r| r.id), Some("60fps".into()));

    while video.pauses.load(Ordering::SeqCst) == 0 || video.is_paused() {
        tokio::task::yield_now().await;
    }
    assert_eq!(playback.state(), PlaybackState::Playing);

    cancel.cancel();
    listener.await?;
    Ok(())
}

#[tokio::test]
async fn unpaired_representation_is_fatal() -> Result<()> {
    let config = load_config()?;
    let client = Arc::new(Client::new(vec![
        Representation::video("1080p-30fps", 30.0, 1920, 1080),
        Representation::mesh("60fps"),
    ]));
    let mut quality = QualityCoordinator::new(client, config.quality);
    let mut events = quality.subscribe();

    let err = quality.on_initialized().unwrap_err();
    assert!(matches!(err, PlayerError::Configuration { .. }));
    assert!(err.is_fatal());
    ensure!(
        !matches!(events.try_recv(), Ok(QualityEvent::QualityChanged(_))),
        "no quality change should be published"
    );
    Ok(())
}

#[tokio::test]
async fn seek_round_trip() -> Result<()> {
    let config = load_config()?;
    let video = Arc::new(Video::new(10.0));
    let (mesh_tx, mesh_rx) = watch::channel(snapshot(2.0));
    let playback = PlaybackStateMachine::new(video.clone(), mesh_rx, config.playback);
    playback.on_player_initialized()?;

    assert!(matches!(playback.seek(3.0).await, Err(PlayerError::Unplayable { .. })));
    assert_eq!(playback.state(), PlaybackState::Paused);

    mesh_tx.send_replace(snapshot(10.0));
    playback.seek(3.0).await?;
    assert_eq!(playback.state(), PlaybackState::Paused);
    assert_eq!(video.current_time(), 3.0);
    Ok(())
}
