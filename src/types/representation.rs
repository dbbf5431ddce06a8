//! Adaptive-streaming representation descriptors

use serde::{Deserialize, Serialize};

/// Track a representation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Mesh,
}

/// One selectable quality variant of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub id: String,
    pub media_type: MediaType,
    /// Nominal frames per second; `0.0` when the manifest omits it
    #[serde(default)]
    pub frame_rate: f64,
    #[serde(default)]
    pub bandwidth: u64,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub codecs: Option<String>,
}

impl Representation {
    /// Video representation, e.g. `Representation::video("1080p-30fps", 30.0, 1920, 1080)`.
    pub fn video(id: impl Into<String>, frame_rate: f64, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            media_type: MediaType::Video,
            frame_rate,
            bandwidth: 0,
            width: Some(width),
            height: Some(height),
            codecs: None,
        }
    }

    /// Mesh representation whose frame rate is derived from its id.
    pub fn mesh(id: impl Into<String>) -> Self {
        let id = id.into();
        let frame_rate = frame_rate_from_id(&id).unwrap_or(0.0);
        Self { id, media_type: MediaType::Mesh, frame_rate, bandwidth: 0, width: None, height: None, codecs: None }
    }

    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Declared frame rate, falling back to the `NNfps` suffix of the id.
    pub fn effective_frame_rate(&self) -> Option<f64> {
        if self.frame_rate > 0.0 { Some(self.frame_rate) } else { frame_rate_from_id(&self.id) }
    }

    /// Whether `mesh` pairs with this video representation by id suffix.
    pub fn pairs_with(&self, mesh: &Representation) -> bool {
        !mesh.id.is_empty() && self.id.ends_with(&mesh.id)
    }
}

/// Parse a manifest frame-rate attribute: `"30"`, `"29.97"` or `"30000/1001"`.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let value = value.trim();
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Frame rate encoded in a representation id such as `"30fps"` or `"1080p-30fps"`.
pub fn frame_rate_from_id(id: &str) -> Option<f64> {
    let tail = id.rsplit(['-', '_']).next()?;
    parse_frame_rate(tail.strip_suffix("fps")?)
}
