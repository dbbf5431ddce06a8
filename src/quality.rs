//! Keeps video and mesh representations in lock-step
//!
//! Video quality is switched by the streaming client's ABR logic; the mesh
//! track never switches on its own. Whenever a video representation change
//! is rendered, the coordinator selects the mesh representation whose id is
//! a suffix of the video id (`"1080p-30fps"` pairs with `"30fps"`) so both
//! tracks run at the same frame rate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::QualityConfig;
use crate::media::AbrControl;
use crate::types::{MediaType, Representation};
use crate::{PlayerError, Result};

const EVENT_CAPACITY: usize = 16;
const FRAME_RATE_EPSILON: f64 = 1e-3;

/// Notifications published by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum QualityEvent {
    /// A video representation change was rendered and the mesh follows it
    QualityChanged(Representation),
    FrameRateChanged(f64),
}

/// Stage of a representation switch reported by the streaming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    Requested,
    Rendered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepresentationChange {
    pub media_type: MediaType,
    pub representation: Representation,
    pub phase: ChangePhase,
}

impl RepresentationChange {
    pub fn rendered(representation: Representation) -> Self {
        Self { media_type: representation.media_type, representation, phase: ChangePhase::Rendered }
    }

    pub fn requested(representation: Representation) -> Self {
        Self { media_type: representation.media_type, representation, phase: ChangePhase::Requested }
    }
}

fn same_rate(a: f64, b: f64) -> bool {
    (a - b).abs() < FRAME_RATE_EPSILON
}

/// Drives mesh representation selection from video changes.
pub struct QualityCoordinator {
    abr: Arc<dyn AbrControl>,
    config: QualityConfig,
    target_frame_rate: Option<f64>,
    frame_rate: f64,
    current: HashMap<MediaType, String>,
    events: broadcast::Sender<QualityEvent>,
}

impl QualityCoordinator {
    /// Take over mesh selection from the streaming client.
    pub fn new(abr: Arc<dyn AbrControl>, config: QualityConfig) -> Self {
        abr.set_auto_switch(MediaType::Mesh, false);
        abr.set_auto_switch(MediaType::Video, config.video_abr);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            abr,
            target_frame_rate: config.target_frame_rate,
            config,
            frame_rate: 0.0,
            current: HashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QualityEvent> {
        self.events.subscribe()
    }

    /// Frame rate of the active mesh representation, `0.0` before selection.
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn target_frame_rate(&self) -> Option<f64> {
        self.target_frame_rate
    }

    /// Id of the last rendered representation for `media`.
    pub fn current_id(&self, media: MediaType) -> Option<&str> {
        self.current.get(&media).map(String::as_str)
    }

    /// Record the starting representations and align the mesh with the video.
    pub fn on_initialized(&mut self) -> Result<()> {
        for media in [MediaType::Video, MediaType::Mesh] {
            let Some(rep) = self.abr.current_representation(media) else {
                warn!(?media, "No current representation after initialization");
                continue;
            };
            self.current.insert(media, rep.id.clone());
            if media == MediaType::Video {
                self.select_mesh_for_video(&rep)?;
            }
        }
        Ok(())
    }

    /// React to a representation switch. Only rendered switches act.
    pub fn handle_change(&mut self, change: RepresentationChange) -> Result<()> {
        match change.phase {
            ChangePhase::Requested => {
                trace!(media = ?change.media_type, id = %change.representation.id, "Representation change requested");
                Ok(())
            }
            ChangePhase::Rendered => match change.media_type {
                MediaType::Video => self.on_video_representation_changed(change.representation),
                MediaType::Mesh => self.on_mesh_representation_changed(change.representation),
            },
        }
    }

    pub fn on_video_representation_changed(&mut self, rep: Representation) -> Result<()> {
        debug!(id = %rep.id, "Video representation rendered");
        self.current.insert(MediaType::Video, rep.id.clone());
        self.select_mesh_for_video(&rep)?;
        let _ = self.events.send(QualityEvent::QualityChanged(rep));
        Ok(())
    }

    pub fn on_mesh_representation_changed(&mut self, rep: Representation) -> Result<()> {
        debug!(id = %rep.id, "Mesh representation rendered");
        self.current.insert(MediaType::Mesh, rep.id.clone());
        match rep.effective_frame_rate() {
            Some(fps) => self.set_current_frame_rate(fps),
            None => warn!(id = %rep.id, "Mesh representation has no frame rate"),
        }
        Ok(())
    }

    /// Switch the mesh track to the representation pairing with `video`.
    ///
    /// Fails with [`PlayerError::Configuration`] when the manifest has no
    /// pairing mesh representation.
    pub fn select_mesh_for_video(&mut self, video: &Representation) -> Result<Representation> {
        if video.media_type != MediaType::Video {
            return Err(PlayerError::configuration(format!("Expected a video representation, got {:?}", video.media_type)));
        }

        if let Some(current) = self.abr.current_representation(MediaType::Mesh)
            && video.pairs_with(&current)
        {
            trace!(video = %video.id, mesh = %current.id, "Mesh representation already selected");
            self.publish_frame_rate(video, &current);
            return Ok(current);
        }

        let mesh = self
            .abr
            .representations(MediaType::Mesh)
            .into_iter()
            .find(|mesh| video.pairs_with(mesh))
            .ok_or_else(|| PlayerError::configuration(format!("No mesh representation found for {}", video.id)))?;

        info!(video = %video.id, mesh = %mesh.id, "Selecting mesh representation");
        self.publish_frame_rate(video, &mesh);
        self.abr.set_representation(MediaType::Mesh, &mesh.id)?;
        self.current.insert(MediaType::Mesh, mesh.id.clone());
        Ok(mesh)
    }

    /// Switch the video track to a representation pairing with `mesh`.
    pub fn select_video_for_mesh(&mut self, mesh: &Representation) -> Result<Representation> {
        if mesh.media_type != MediaType::Mesh {
            return Err(PlayerError::configuration(format!("Expected a mesh representation, got {:?}", mesh.media_type)));
        }

        if let Some(current) = self.abr.current_representation(MediaType::Video)
            && current.pairs_with(mesh)
        {
            trace!(mesh = %mesh.id, video = %current.id, "Video representation already selected");
            return Ok(current);
        }

        let video = self
            .eligible_representations(MediaType::Video)
            .into_iter()
            .find(|video| video.pairs_with(mesh))
            .ok_or_else(|| PlayerError::configuration(format!("No video representation found for {}", mesh.id)))?;

        info!(mesh = %mesh.id, video = %video.id, "Selecting video representation");
        self.abr.set_representation(MediaType::Video, &video.id)?;
        self.current.insert(MediaType::Video, video.id.clone());
        Ok(video)
    }

    /// Pin representations to `fps`, or unpin with `None`.
    ///
    /// Returns the frame rate actually used, which is the closest available
    /// rate when `fps` itself is not offered.
    pub fn set_target_frame_rate(&mut self, fps: Option<f64>) -> Option<f64> {
        self.target_frame_rate = fps;
        self.resolve_target_frame_rate()
    }

    /// Snap the pinned frame rate to what the video track offers.
    pub fn resolve_target_frame_rate(&mut self) -> Option<f64> {
        let target = self.target_frame_rate?;
        let available = self.available_frame_rates();
        if available.is_empty() || available.iter().any(|&fps| same_rate(fps, target)) {
            debug!(target, ?available, "Target frame rate available");
            return Some(target);
        }
        let closest = closest_rate(&available, target)?;
        warn!(target, closest, ?available, "Target frame rate not offered, using closest");
        self.target_frame_rate = Some(closest);
        Some(closest)
    }

    /// Whether `rep` may be selected under the texture and frame-rate limits.
    pub fn filter_representation(&self, rep: &Representation) -> bool {
        if rep.media_type == MediaType::Video
            && let Some(width) = rep.width
            && width > self.config.max_texture_size
        {
            trace!(id = %rep.id, width, "Representation wider than the maximum texture");
            return false;
        }
        match (self.target_frame_rate, rep.effective_frame_rate()) {
            (Some(target), Some(fps)) => same_rate(target, fps),
            _ => true,
        }
    }

    /// Selectable representations for `media`, lowest bandwidth first.
    ///
    /// When the pinned frame rate leaves nothing, representations at the
    /// closest offered frame rate are returned instead.
    pub fn eligible_representations(&self, media: MediaType) -> Vec<Representation> {
        let mut candidates: Vec<Representation> = self
            .abr
            .representations(media)
            .into_iter()
            .filter(|rep| {
                !(rep.media_type == MediaType::Video && rep.width.is_some_and(|w| w > self.config.max_texture_size))
            })
            .collect();
        candidates.sort_by_key(|rep| rep.bandwidth);

        let eligible: Vec<Representation> =
            candidates.iter().filter(|rep| self.filter_representation(rep)).cloned().collect();
        if !eligible.is_empty() {
            return eligible;
        }
        let Some(target) = self.target_frame_rate else {
            return eligible;
        };

        let rates: Vec<f64> = candidates.iter().filter_map(Representation::effective_frame_rate).collect();
        let Some(closest) = closest_rate(&rates, target) else {
            return eligible;
        };
        warn!(?media, target, closest, "No representation at the target frame rate, using closest");
        candidates.into_iter().filter(|rep| rep.effective_frame_rate().is_some_and(|fps| same_rate(fps, closest))).collect()
    }

    pub fn enable_video_abr(&self) {
        info!("Enabling video ABR");
        self.abr.set_auto_switch(MediaType::Video, true);
    }

    pub fn disable_video_abr(&self) {
        info!("Disabling video ABR");
        self.abr.set_auto_switch(MediaType::Video, false);
    }

    fn available_frame_rates(&self) -> Vec<f64> {
        let mut rates: Vec<f64> = Vec::new();
        for fps in self.abr.representations(MediaType::Video).iter().filter_map(Representation::effective_frame_rate) {
            if !rates.iter().any(|&r| same_rate(r, fps)) {
                rates.push(fps);
            }
        }
        rates
    }

    fn publish_frame_rate(&mut self, video: &Representation, mesh: &Representation) {
        let Some(fps) = mesh.effective_frame_rate().or_else(|| video.effective_frame_rate()) else {
            warn!(video = %video.id, mesh = %mesh.id, "Frame rate unknown for pairing");
            return;
        };
        if let Some(video_fps) = video.effective_frame_rate()
            && !same_rate(video_fps, fps)
        {
            warn!(video = %video.id, video_fps, mesh_fps = fps, "Paired representations disagree on frame rate");
        }
        self.set_current_frame_rate(fps);
    }

    fn set_current_frame_rate(&mut self, fps: f64) {
        if !same_rate(self.frame_rate, fps) {
            debug!(previous = self.frame_rate, fps, "Frame rate changed");
        }
        self.frame_rate = fps;
        let _ = self.events.send(QualityEvent::FrameRateChanged(fps));
    }
}

impl std::fmt::Debug for QualityCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityCoordinator")
            .field("frame_rate", &self.frame_rate)
            .field("target_frame_rate", &self.target_frame_rate)
            .field("current", &self.current)
            .finish()
    }
}

fn closest_rate(rates: &[f64], target: f64) -> Option<f64> {
    rates.iter().copied().min_by(|a, b| (a - target).abs().total_cmp(&(b - target).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockAbr;
    use crate::types::parse_frame_rate;

    fn manifest() -> Vec<Representation> {
        vec![
            Representation::video("720p-30fps", 30.0, 1280, 720).with_bandwidth(2_000_000),
            Representation::video("1080p-30fps", 30.0, 1920, 1080).with_bandwidth(4_000_000),
            Representation::video("1080p-60fps", 60.0, 1920, 1080).with_bandwidth(6_000_000),
            Representation::video("2160p-60fps", 60.0, 3840, 2160).with_bandwidth(12_000_000),
            Representation::mesh("30fps"),
            Representation::mesh("60fps"),
        ]
    }

    fn setup(reps: Vec<Representation>, config: QualityConfig) -> (Arc<MockAbr>, QualityCoordinator) {
        let abr = Arc::new(MockAbr::new(reps));
        let coordinator = QualityCoordinator::new(abr.clone(), config);
        (abr, coordinator)
    }

    #[test]
    fn construction_disables_mesh_abr() {
        let (abr, coordinator) = setup(manifest(), QualityConfig { video_abr: false, ..Default::default() });
        assert!(!abr.auto_switch(MediaType::Mesh));
        assert!(!abr.auto_switch(MediaType::Video));
        coordinator.enable_video_abr();
        assert!(abr.auto_switch(MediaType::Video));
        assert!(!abr.auto_switch(MediaType::Mesh));
    }

    #[tokio::test]
    async fn rendered_video_change_switches_mesh() {
        let (abr, mut coordinator) = setup(manifest(), QualityConfig::default());
        let mut events = coordinator.subscribe();

        let video = Representation::video("1080p-60fps", 60.0, 1920, 1080);
        coordinator.handle_change(RepresentationChange::rendered(video.clone())).unwrap();

        assert_eq!(abr.switches(), vec![(MediaType::Mesh, "60fps".to_string())]);
        assert_eq!(coordinator.frame_rate(), 60.0);
        assert_eq!(coordinator.current_id(MediaType::Mesh), Some("60fps"));
        assert_eq!(events.recv().await.unwrap(), QualityEvent::FrameRateChanged(60.0));
        assert_eq!(events.recv().await.unwrap(), QualityEvent::QualityChanged(video));
    }

    #[test]
    fn requested_changes_only_log() {
        let (abr, mut coordinator) = setup(manifest(), QualityConfig::default());
        let video = Representation::video("1080p-60fps", 60.0, 1920, 1080);
        coordinator.handle_change(RepresentationChange::requested(video)).unwrap();
        assert!(abr.switches().is_empty());
        assert_eq!(coordinator.frame_rate(), 0.0);
    }

    #[test]
    fn matching_mesh_only_publishes_frame_rate() {
        let (abr, mut coordinator) = setup(manifest(), QualityConfig::default());
        let mut events = coordinator.subscribe();
        let mesh = coordinator.select_mesh_for_video(&Representation::video("720p-30fps", 30.0, 1280, 720)).unwrap();
        assert_eq!(mesh.id, "30fps");
        assert!(abr.switches().is_empty());
        assert_eq!(events.try_recv().unwrap(), QualityEvent::FrameRateChanged(30.0));
    }

    #[test]
    fn missing_mesh_is_configuration_error() {
        let reps = vec![Representation::video("1080p-30fps", 30.0, 1920, 1080), Representation::mesh("60fps")];
        let (abr, mut coordinator) = setup(reps, QualityConfig::default());
        let err = coordinator
            .on_video_representation_changed(Representation::video("1080p-30fps", 30.0, 1920, 1080))
            .unwrap_err();
        assert!(matches!(err, PlayerError::Configuration { .. }));
        assert!(err.is_fatal());
        assert!(abr.switches().is_empty());
    }

    #[test]
    fn video_follows_mesh_selection() {
        let (abr, mut coordinator) = setup(manifest(), QualityConfig::default());
        let video = coordinator.select_video_for_mesh(&Representation::mesh("60fps")).unwrap();
        assert_eq!(video.id, "1080p-60fps");
        assert_eq!(abr.switches(), vec![(MediaType::Video, "1080p-60fps".to_string())]);
        assert!(coordinator.select_video_for_mesh(&Representation::mesh("24fps")).is_err());
    }

    #[test]
    fn initialization_aligns_mesh_with_video() {
        let reps = vec![
            Representation::video("1080p-60fps", 60.0, 1920, 1080),
            Representation::mesh("30fps"),
            Representation::mesh("60fps"),
        ];
        let (abr, mut coordinator) = setup(reps, QualityConfig::default());
        coordinator.on_initialized().unwrap();
        assert_eq!(abr.switches(), vec![(MediaType::Mesh, "60fps".to_string())]);
        assert_eq!(coordinator.current_id(MediaType::Video), Some("1080p-60fps"));
        assert_eq!(coordinator.frame_rate(), 60.0);
    }

    #[test]
    fn filtering_honours_texture_size_and_target() {
        let config = QualityConfig { max_texture_size: 2048, target_frame_rate: Some(30.0), ..Default::default() };
        let (_, coordinator) = setup(manifest(), config);
        let ids: Vec<String> =
            coordinator.eligible_representations(MediaType::Video).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["720p-30fps", "1080p-30fps"]);
        assert!(!coordinator.filter_representation(&Representation::video("2160p-30fps", 30.0, 3840, 2160)));
        assert!(coordinator.filter_representation(&Representation::mesh("30fps")));
        assert!(!coordinator.filter_representation(&Representation::mesh("60fps")));
    }

    #[test]
    fn unavailable_target_falls_back_to_closest() {
        let (_, mut coordinator) = setup(manifest(), QualityConfig::default());
        assert_eq!(coordinator.set_target_frame_rate(Some(50.0)), Some(60.0));
        assert_eq!(coordinator.target_frame_rate(), Some(60.0));
        assert_eq!(coordinator.set_target_frame_rate(None), None);

        let reps = vec![Representation::video("1080p-25fps", 25.0, 1920, 1080), Representation::mesh("25fps")];
        let config = QualityConfig { target_frame_rate: Some(parse_frame_rate("30/1").unwrap()), ..Default::default() };
        let (_, coordinator) = setup(reps, config);
        let ids: Vec<String> =
            coordinator.eligible_representations(MediaType::Video).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["1080p-25fps"]);
    }

    #[test]
    fn mesh_change_publishes_frame_rate() {
        let (_, mut coordinator) = setup(manifest(), QualityConfig::default());
        coordinator.handle_change(RepresentationChange::rendered(Representation::mesh("30fps"))).unwrap();
        assert_eq!(coordinator.frame_rate(), 30.0);
        assert_eq!(coordinator.current_id(MediaType::Mesh), Some("30fps"));
    }
}
