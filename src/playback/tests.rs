use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::buffer::BufferSnapshot;
use crate::media::MediaClock;
use crate::test_utils::{FRAME_DURATION, MockElement, TIMESCALE};
use crate::types::{BufferedRanges, Representation, TimeRange};

fn mesh_over(start: f64, end: f64) -> BufferSnapshot {
    BufferSnapshot {
        initialized: true,
        timescale: TIMESCALE,
        frame_duration: FRAME_DURATION as u64,
        ranges: BufferedRanges::from_intervals([TimeRange::new(start, end)]),
        frame_count: ((end - start) * 30.0) as usize,
    }
}

struct Harness {
    element: Arc<MockElement>,
    mesh: watch::Sender<BufferSnapshot>,
    machine: Arc<PlaybackStateMachine>,
}

fn harness(snapshot: BufferSnapshot) -> Harness {
    let element = Arc::new(MockElement::buffered_over(1920, 0.0, 10.0));
    let (mesh, mesh_rx) = watch::channel(snapshot);
    let machine = Arc::new(PlaybackStateMachine::new(element.clone(), mesh_rx, PlaybackConfig::default()));
    Harness { element, mesh, machine }
}

impl Harness {
    /// Drive the machine into Playing as the element would.
    fn start_playing(&self) {
        self.element.set_paused(false);
        self.machine.handle_media_event(&MediaEvent::Play).unwrap();
    }
}

#[tokio::test]
async fn lifecycle_events_drive_state() {
    let _ = tracing_subscriber::fmt::try_init();
    let h = harness(mesh_over(0.0, 10.0));
    let mut states = h.machine.state_changes();
    assert_eq!(states.next().await, Some(PlaybackState::None));

    h.machine.handle_media_event(&MediaEvent::CanPlay).unwrap();
    assert_eq!(h.machine.state(), PlaybackState::None);

    h.machine.handle_media_event(&MediaEvent::LoadStart).unwrap();
    assert_eq!(states.next().await, Some(PlaybackState::Initializing));
    h.machine.handle_media_event(&MediaEvent::CanPlay).unwrap();
    assert_eq!(states.next().await, Some(PlaybackState::Initialized));
    h.machine.on_player_initialized().unwrap();
    assert_eq!(states.next().await, Some(PlaybackState::Paused));
    h.machine.handle_media_event(&MediaEvent::Play).unwrap();
    assert_eq!(states.next().await, Some(PlaybackState::Playing));
    h.machine.handle_media_event(&MediaEvent::Waiting).unwrap();
    h.machine.handle_media_event(&MediaEvent::Pause).unwrap();
    assert_eq!(states.next().await, Some(PlaybackState::Paused));
}

#[test]
fn play_and_pause_do_not_interrupt_seeking() {
    let h = harness(mesh_over(0.0, 10.0));
    h.machine.set_state(PlaybackState::Seeking).unwrap();
    h.machine.handle_media_event(&MediaEvent::Pause).unwrap();
    h.machine.handle_media_event(&MediaEvent::Play).unwrap();
    assert_eq!(h.machine.state(), PlaybackState::Seeking);

    h.machine.set_state(PlaybackState::Buffering).unwrap();
    h.machine.handle_media_event(&MediaEvent::Play).unwrap();
    assert_eq!(h.machine.state(), PlaybackState::Buffering);
}

#[test]
fn same_state_is_not_republished() {
    let h = harness(mesh_over(0.0, 10.0));
    let mut rx = h.machine.subscribe();
    h.machine.set_state(PlaybackState::Paused).unwrap();
    assert!(rx.has_changed().unwrap());
    rx.borrow_and_update();
    h.machine.set_state(PlaybackState::Paused).unwrap();
    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn failed_is_terminal_until_reset() {
    let h = harness(mesh_over(0.0, 10.0));
    h.machine.handle_media_event(&MediaEvent::Error("decoder crashed".into())).unwrap();
    assert_eq!(h.machine.state(), PlaybackState::Failed);

    // Re-failing is a same-state no-op
    h.machine.fail("again").unwrap();

    let err = h.machine.handle_media_event(&MediaEvent::Play).unwrap_err();
    assert!(matches!(err, PlayerError::InvalidTransition { from: PlaybackState::Failed, to: PlaybackState::Playing }));
    assert!(matches!(h.machine.seek(1.0).await, Err(PlayerError::InvalidTransition { .. })));

    h.machine.reset();
    assert_eq!(h.machine.state(), PlaybackState::None);
    h.machine.handle_media_event(&MediaEvent::LoadStart).unwrap();
    assert_eq!(h.machine.state(), PlaybackState::Initializing);
}

#[tokio::test(start_paused = true)]
async fn seek_to_unbuffered_time_is_rejected() {
    let h = harness(mesh_over(0.0, 2.0));
    h.machine.set_state(PlaybackState::Paused).unwrap();

    let err = h.machine.seek(3.0).await.unwrap_err();
    assert!(matches!(err, PlayerError::Unplayable { time } if time == 3.0));
    assert_eq!(h.machine.state(), PlaybackState::Paused);
    assert!(h.element.seeks().is_empty());
    assert_eq!(h.element.pause_count(), 0);

    // Mesh covers it but the video does not
    h.mesh.send_replace(mesh_over(0.0, 20.0));
    assert!(h.machine.seek(15.0).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn seek_while_paused_stays_paused() {
    let h = harness(mesh_over(0.0, 10.0));
    h.machine.set_state(PlaybackState::Paused).unwrap();
    let mut states = h.machine.state_changes();
    states.next().await;

    h.machine.seek(3.0).await.unwrap();

    assert_eq!(states.next().await, Some(PlaybackState::Paused));
    assert_eq!(h.machine.state(), PlaybackState::Paused);
    assert_eq!(h.element.seeks(), vec![3.0]);
    assert_eq!(h.element.current_time(), 3.0);
    assert_eq!(h.element.play_count(), 0);
    assert!(!h.machine.has_pending_poll());
}

#[tokio::test(start_paused = true)]
async fn seek_while_playing_resumes() {
    let h = harness(mesh_over(0.0, 10.0));
    h.start_playing();
    h.element.stall_seeks();

    h.machine.seek(3.0).await.unwrap();

    assert_eq!(h.machine.state(), PlaybackState::Playing);
    assert_eq!(h.element.pause_count(), 1);
    assert_eq!(h.element.play_count(), 1);
    assert!(!h.element.is_paused());
    // The element clock has not caught up, but the target itself is buffered
    assert_eq!(h.element.current_time(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn seek_times_out_back_to_paused() {
    let h = harness(mesh_over(0.0, 10.0));
    h.start_playing();
    h.element.flush_next_seek();

    let started = tokio::time::Instant::now();
    let err = h.machine.seek(3.0).await.unwrap_err();

    assert!(matches!(err, PlayerError::SeekTimeout { time, .. } if time == 3.0));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(h.machine.state(), PlaybackState::Paused);
    assert_eq!(h.element.play_count(), 0);
    assert!(!h.machine.has_pending_poll());
}

#[tokio::test(start_paused = true)]
async fn new_seek_supersedes_outstanding_poll() {
    let h = harness(mesh_over(0.0, 10.0));
    h.start_playing();
    h.element.flush_next_seek();

    let first = h.machine.seek(3.0);
    let second = async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(h.machine.has_pending_poll());
        assert_eq!(h.machine.state(), PlaybackState::Seeking);
        h.element.set_buffered(BufferedRanges::from_intervals([TimeRange::new(0.0, 10.0)]));
        h.machine.seek(4.0).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first, Err(PlayerError::Superseded { time }) if time == 3.0));
    second.unwrap();
    // The element was paused by the first seek; the second inherits "was playing"
    assert_eq!(h.machine.state(), PlaybackState::Playing);
    assert_eq!(h.element.play_count(), 1);
    assert_eq!(h.element.seeks(), vec![3.0, 4.0]);
    assert!(!h.machine.has_pending_poll());
}

#[tokio::test(start_paused = true)]
async fn seek_completes_once_buffers_catch_up() {
    let h = harness(mesh_over(0.0, 10.0));
    h.machine.set_state(PlaybackState::Paused).unwrap();
    h.element.flush_next_seek();

    let seek = h.machine.seek(3.0);
    let refill = async {
        tokio::time::sleep(Duration::from_millis(450)).await;
        h.element.set_buffered(BufferedRanges::from_intervals([TimeRange::new(2.0, 6.0)]));
    };
    let (result, ()) = tokio::join!(seek, refill);
    result.unwrap();
    assert_eq!(h.machine.state(), PlaybackState::Paused);
}

#[tokio::test(start_paused = true)]
async fn quality_change_without_clock_advance_skips_poll() {
    let h = harness(mesh_over(0.0, 10.0));
    h.start_playing();
    h.element.set_buffered(BufferedRanges::new());

    h.machine.on_quality_change().await.unwrap();

    assert_eq!(h.machine.state(), PlaybackState::Playing);
    assert_eq!(h.element.pause_count(), 1);
    assert_eq!(h.element.play_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn quality_change_polls_when_clock_moved() {
    let h = harness(mesh_over(0.0, 10.0));
    h.start_playing();
    h.element.set_time(2.0);
    h.element.set_pause_drift(0.05);
    h.element.set_buffered(BufferedRanges::new());

    let switch = h.machine.on_quality_change();
    let refill = async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.machine.state(), PlaybackState::Buffering);
        h.element.set_buffered(BufferedRanges::from_intervals([TimeRange::new(0.0, 10.0)]));
    };
    let (result, ()) = tokio::join!(switch, refill);
    result.unwrap();

    assert_eq!(h.machine.state(), PlaybackState::Playing);
    assert_eq!(h.element.play_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn quality_change_while_paused_does_not_resume() {
    let h = harness(mesh_over(0.0, 10.0));
    h.machine.set_state(PlaybackState::Paused).unwrap();

    h.machine.on_quality_change().await.unwrap();

    assert_eq!(h.machine.state(), PlaybackState::Paused);
    assert_eq!(h.element.pause_count(), 0);
    assert_eq!(h.element.play_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn quality_change_timeout_falls_back_to_paused() {
    let h = harness(mesh_over(0.0, 10.0));
    h.start_playing();
    h.element.set_pause_drift(0.05);
    h.element.set_buffered(BufferedRanges::new());

    let err = h.machine.on_quality_change().await.unwrap_err();
    assert!(matches!(err, PlayerError::SeekTimeout { .. }));
    assert_eq!(h.machine.state(), PlaybackState::Paused);
    assert_eq!(h.element.play_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn uninitialized_mesh_resolves_poll_immediately() {
    let h = harness(BufferSnapshot::default());
    h.start_playing();
    h.element.set_pause_drift(0.05);
    h.element.set_buffered(BufferedRanges::new());

    let started = tokio::time::Instant::now();
    h.machine.on_quality_change().await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(h.machine.state(), PlaybackState::Playing);
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_outstanding_poll() {
    let h = harness(mesh_over(0.0, 10.0));
    h.machine.set_state(PlaybackState::Paused).unwrap();
    h.element.flush_next_seek();

    let seek = h.machine.seek(3.0);
    let reset = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.reset();
    };
    let (result, ()) = tokio::join!(seek, reset);

    assert!(matches!(result, Err(PlayerError::Superseded { .. })));
    assert_eq!(h.machine.state(), PlaybackState::None);
}

#[tokio::test(start_paused = true)]
async fn quality_listener_buffers_and_resumes() {
    let _ = tracing_subscriber::fmt::try_init();
    let h = harness(mesh_over(0.0, 10.0));
    h.start_playing();

    let (tx, rx) = broadcast::channel(8);
    let cancel = CancellationToken::new();
    let listener = h.machine.spawn_quality_listener(rx, cancel.clone());

    tx.send(QualityEvent::FrameRateChanged(30.0)).unwrap();
    tx.send(QualityEvent::QualityChanged(Representation::video("1080p-30fps", 30.0, 1920, 1080))).unwrap();
    while h.element.play_count() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.element.pause_count(), 1);
    assert_eq!(h.machine.state(), PlaybackState::Playing);

    cancel.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn quality_listener_stops_when_sender_drops() {
    let h = harness(mesh_over(0.0, 10.0));
    let (tx, rx) = broadcast::channel::<QualityEvent>(8);
    let listener = h.machine.spawn_quality_listener(rx, CancellationToken::new());
    drop(tx);
    listener.await.unwrap();
}

#[test]
fn states_display_lowercase() {
    assert_eq!(PlaybackState::Buffering.to_string(), "buffering");
    assert_eq!(PlaybackState::default(), PlaybackState::None);
    assert!(PlaybackState::Seeking.is_transitional());
    assert!(!PlaybackState::Paused.is_transitional());
}
