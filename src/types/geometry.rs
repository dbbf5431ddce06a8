//! Decoded geometry frames

use std::sync::Arc;

/// Components per vertex for skinning weights and bindings.
pub const SKINNING_ITEM_SIZE: usize = 4;

/// How a frame's geometry was transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Self-contained keyframe
    Full,
    /// Cumulative offset from the FULL frame of the same payload
    Delta,
    /// Not transmitted; interpolated between two anchors
    Interpolated,
}

/// Vertex data for one frame.
///
/// Index and uv buffers are shared with the FULL frame of the payload. Every
/// other attribute is owned because reconstruction writes to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub indices: Arc<[u32]>,
    pub uvs: Arc<[f32]>,
    pub positions: Vec<f32>,
    pub normals: Option<Vec<f32>>,
    pub weights: Vec<f32>,
    pub bindings: Vec<f32>,
    /// Cumulative position delta relative to the FULL frame (DELTA frames only)
    pub delta: Option<Vec<f32>>,
    /// Cumulative normal delta relative to the FULL frame (DELTA frames only)
    pub delta_normals: Option<Vec<f32>>,
}

impl Geometry {
    /// Number of vertices, derived from the 3-component position attribute.
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    /// Clone this geometry for another sub-sample of the same payload.
    ///
    /// Shared buffers are reference-counted; per-frame attributes are copied and
    /// auxiliary delta attributes are cleared.
    pub fn derive(&self) -> Self {
        Self {
            indices: Arc::clone(&self.indices),
            uvs: Arc::clone(&self.uvs),
            positions: self.positions.clone(),
            normals: self.normals.clone(),
            weights: self.weights.clone(),
            bindings: self.bindings.clone(),
            delta: None,
            delta_normals: None,
        }
    }

    /// Approximate heap footprint in bytes, used for quota accounting.
    pub fn byte_size(&self) -> usize {
        let floats = self.positions.len()
            + self.normals.as_ref().map_or(0, Vec::len)
            + self.weights.len()
            + self.bindings.len()
            + self.delta.as_ref().map_or(0, Vec::len)
            + self.delta_normals.as_ref().map_or(0, Vec::len)
            + self.uvs.len();
        (floats + self.indices.len()) * 4
    }
}

/// A geometry sample after decode and reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub kind: FrameKind,
    pub geometry: Geometry,
    /// Presentation timestamp in track timescale units
    pub timestamp: u64,
    /// Duration in track timescale units
    pub duration: u64,
    /// Units per second of `timestamp` and `duration`
    pub timescale: u32,
}

impl DecodedFrame {
    /// Frame number, `floor(timestamp / duration)`.
    pub fn frame_number(&self) -> u64 {
        if self.duration == 0 { self.timestamp } else { self.timestamp / self.duration }
    }

    /// Presentation start in seconds.
    pub fn start_time(&self) -> f64 {
        if self.timescale == 0 { 0.0 } else { self.timestamp as f64 / self.timescale as f64 }
    }

    /// Approximate heap footprint in bytes.
    pub fn byte_size(&self) -> usize {
        self.geometry.byte_size()
    }
}
