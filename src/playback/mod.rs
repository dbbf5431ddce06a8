//! Playback state machine
//!
//! Joins the media element and the frame store into one playback state. The
//! machine only reads the store through its published [`BufferSnapshot`] and
//! only hears about quality switches through [`QualityEvent`]s, so neither
//! component holds a reference back into it.
//!
//! Seeks and quality switches pause the element, then poll until the target
//! time is buffered by both the mesh and the video before resuming. At most
//! one poll is outstanding; starting another cancels the previous one, whose
//! caller gets [`PlayerError::Superseded`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::BufferSnapshot;
use crate::config::PlaybackConfig;
use crate::media::{MediaElement, MediaEvent};
use crate::quality::QualityEvent;
use crate::stream::{PollOutcome, poll_until};
use crate::{PlayerError, Result};

#[cfg(test)]
mod tests;

/// Where playback currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    None,
    /// Terminal; no further transitions are accepted
    Failed,
    Initializing,
    Initialized,
    Seeking,
    Buffering,
    Playing,
    Paused,
}

impl PlaybackState {
    /// States owned by an in-progress seek or quality switch.
    pub fn is_transitional(self) -> bool {
        matches!(self, PlaybackState::Seeking | PlaybackState::Buffering)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::None => "none",
            PlaybackState::Failed => "failed",
            PlaybackState::Initializing => "initializing",
            PlaybackState::Initialized => "initialized",
            PlaybackState::Seeking => "seeking",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct PendingPoll {
    id: u64,
    time: f64,
    was_paused: bool,
    cancel: CancellationToken,
}

pub struct PlaybackStateMachine {
    config: PlaybackConfig,
    media: Arc<dyn MediaElement>,
    mesh: watch::Receiver<BufferSnapshot>,
    state: watch::Sender<PlaybackState>,
    pending: Mutex<Option<PendingPoll>>,
    next_poll: AtomicU64,
}

impl PlaybackStateMachine {
    /// `mesh` is the frame store's snapshot channel.
    pub fn new(media: Arc<dyn MediaElement>, mesh: watch::Receiver<BufferSnapshot>, config: PlaybackConfig) -> Self {
        let (state, _) = watch::channel(PlaybackState::None);
        Self { config, media, mesh, state, pending: Mutex::new(None), next_poll: AtomicU64::new(0) }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Stream of states, starting with the current one.
    pub fn state_changes(&self) -> WatchStream<PlaybackState> {
        WatchStream::new(self.state.subscribe())
    }

    /// Whether a seek or quality-switch poll is outstanding.
    pub fn has_pending_poll(&self) -> bool {
        self.pending().is_some()
    }

    /// Move to `next`. Setting the current state is a no-op; leaving
    /// [`PlaybackState::Failed`] is rejected.
    pub fn set_state(&self, next: PlaybackState) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if *current == PlaybackState::Failed {
                rejected = Some(*current);
                return false;
            }
            info!(from = %current, to = %next, "Playback state changed");
            *current = next;
            true
        });
        match rejected {
            Some(from) => Err(PlayerError::InvalidTransition { from, to: next }),
            None => Ok(()),
        }
    }

    /// Whether `time` is buffered by both the mesh and the video.
    pub fn check_playback(&self, time: f64) -> bool {
        let tolerance = self.config.tolerance;
        self.mesh.borrow().can_play(time, tolerance) && self.media.buffered().contains(time, tolerance)
    }

    /// Seek to `time` seconds.
    ///
    /// Rejects with [`PlayerError::Unplayable`] without touching the state when
    /// `time` is not buffered. Otherwise pauses, seeks and waits until the
    /// target is playable, resuming if playback was running beforehand. On
    /// timeout the state falls back to [`PlaybackState::Paused`].
    pub async fn seek(&self, time: f64) -> Result<()> {
        if !self.check_playback(time) {
            warn!(time, "Cannot seek to time that is not buffered");
            return Err(PlayerError::Unplayable { time });
        }

        let was_paused = self
            .pending_was_paused()
            .unwrap_or_else(|| self.state() != PlaybackState::Playing || self.media.is_paused());
        debug!(time, was_paused, "Seeking");

        self.set_state(PlaybackState::Seeking)?;
        self.media.pause();
        self.media.seek(time);

        self.await_playable(time, was_paused).await?;
        self.set_state(PlaybackState::Paused)?;
        if !was_paused {
            self.resume().await?;
        }
        Ok(())
    }

    /// Hold playback while a new quality renders, then resume.
    ///
    /// Only polls when the element clock moved on while pausing.
    pub async fn on_quality_change(&self) -> Result<()> {
        let was_paused = self.pending_was_paused().unwrap_or_else(|| self.media.is_paused());
        self.set_state(PlaybackState::Buffering)?;

        let time = self.media.current_time();
        if !was_paused {
            self.media.pause();
        }
        trace!(time, now = self.media.current_time(), was_paused, "Quality change");

        if self.media.current_time() - time > 0.0 {
            self.await_playable(time, was_paused).await?;
        } else {
            trace!(time, "Clock did not advance, skipping poll");
        }

        self.set_state(PlaybackState::Paused)?;
        if !was_paused {
            self.resume().await?;
        }
        Ok(())
    }

    pub fn handle_media_event(&self, event: &MediaEvent) -> Result<()> {
        match event {
            MediaEvent::LoadStart => self.set_state(PlaybackState::Initializing),
            MediaEvent::CanPlay if self.state() == PlaybackState::Initializing => {
                self.set_state(PlaybackState::Initialized)
            }
            MediaEvent::Play if !self.state().is_transitional() => self.set_state(PlaybackState::Playing),
            MediaEvent::Pause if !self.state().is_transitional() => self.set_state(PlaybackState::Paused),
            MediaEvent::Error(reason) => self.fail(reason),
            other => {
                trace!(event = ?other, state = %self.state(), "Media event ignored");
                Ok(())
            }
        }
    }

    /// The streaming client finished initializing.
    pub fn on_player_initialized(&self) -> Result<()> {
        debug!("Player initialized");
        self.set_state(PlaybackState::Paused)
    }

    /// Enter the terminal [`PlaybackState::Failed`] state.
    pub fn fail(&self, reason: &str) -> Result<()> {
        error!(reason, "Playback failed");
        self.cancel_pending();
        self.set_state(PlaybackState::Failed)
    }

    /// Cancel any outstanding poll and return to [`PlaybackState::None`],
    /// including from [`PlaybackState::Failed`].
    pub fn reset(&self) {
        info!("Resetting playback state");
        self.cancel_pending();
        self.state.send_if_modified(|current| {
            let changed = *current != PlaybackState::None;
            *current = PlaybackState::None;
            changed
        });
    }

    /// React to quality events until `cancel` fires or the sender is gone.
    pub async fn run(&self, mut quality_events: broadcast::Receiver<QualityEvent>, cancel: CancellationToken) {
        info!("Playback quality listener started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Playback quality listener cancelled");
                    break;
                }
                event = quality_events.recv() => event,
            };

            match event {
                Ok(QualityEvent::QualityChanged(rep)) => {
                    debug!(id = %rep.id, "Quality changed, buffering");
                    // Cancellation ends the listener, not the pending switch.
                    let switch = self.on_quality_change();
                    tokio::pin!(switch);
                    let result = tokio::select! {
                        _ = cancel.cancelled() => {
                            self.cancel_pending();
                            break;
                        }
                        result = &mut switch => result,
                    };
                    if let Err(e) = result {
                        debug!(error = %e, "Quality change did not complete");
                    }
                }
                Ok(QualityEvent::FrameRateChanged(fps)) => trace!(fps, "Frame rate changed"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Playback quality listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Quality events closed");
                    break;
                }
            }
        }
        info!("Playback quality listener stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn_quality_listener(
        self: &Arc<Self>,
        quality_events: broadcast::Receiver<QualityEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let machine = Arc::clone(self);
        tokio::spawn(async move { machine.run(quality_events, cancel).await })
    }

    async fn resume(&self) -> Result<()> {
        debug!("Resuming playback");
        self.media.play().await?;
        self.set_state(PlaybackState::Playing)
    }

    /// Poll for `time`, falling back to Paused on timeout.
    async fn await_playable(&self, time: f64, was_paused: bool) -> Result<()> {
        match self.poll_for_time(time, was_paused).await {
            Err(err @ PlayerError::SeekTimeout { .. }) => {
                warn!(time, timeout = ?self.config.seek_timeout(), "Target time never became playable");
                self.set_state(PlaybackState::Paused)?;
                Err(err)
            }
            Err(err) => {
                debug!(time, error = %err, "Poll abandoned");
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn poll_for_time(&self, time: f64, was_paused: bool) -> Result<()> {
        if !self.mesh.borrow().initialized {
            trace!(time, "Mesh not initialized, nothing to wait for");
            return Ok(());
        }

        let id = self.next_poll.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.pending().replace(PendingPoll { id, time, was_paused, cancel: cancel.clone() });
        if let Some(previous) = previous {
            debug!(previous = previous.time, time, "Superseding outstanding poll");
            previous.cancel.cancel();
        }

        debug!(time, was_paused, "Polling for playable time");
        let outcome =
            poll_until(self.config.seek_poll_interval(), Some(self.config.seek_timeout()), &cancel, || {
                self.check_playback(time)
            })
            .await;
        self.clear_pending(id);

        match outcome {
            PollOutcome::Ready(attempts) => {
                debug!(time, attempts, "Time became playable");
                Ok(())
            }
            PollOutcome::TimedOut => Err(PlayerError::SeekTimeout { time, timeout: self.config.seek_timeout() }),
            PollOutcome::Cancelled => Err(PlayerError::Superseded { time }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingPoll>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_was_paused(&self) -> Option<bool> {
        self.pending().as_ref().map(|poll| poll.was_paused)
    }

    fn clear_pending(&self, id: u64) {
        let mut pending = self.pending();
        if pending.as_ref().is_some_and(|poll| poll.id == id) {
            *pending = None;
        }
    }

    fn cancel_pending(&self) {
        if let Some(poll) = self.pending().take() {
            debug!(time = poll.time, "Cancelling outstanding poll");
            poll.cancel.cancel();
        }
    }
}

impl fmt::Debug for PlaybackStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackStateMachine")
            .field("state", &self.state())
            .field("pending", &*self.pending())
            .field("config", &self.config)
            .finish()
    }
}
