//! Geometry sample decoding
//!
//! A compressed geometry payload decodes into one FULL keyframe plus
//! attribute arrays for the DELTA and INTERPOLATED sub-samples that share its
//! metadata block. [`decode_sample`] turns one [`RawSample`] into the
//! reconstructed [`DecodedFrame`]s it carries.
//!
//! ## Architecture
//!
//! - [`GeometryCodec`] is the seam for payload formats. Each `FrameStore`
//!   owns its codec instance.
//! - [`PackedGeometryCodec`] decodes this crate's packed payload format and
//!   [`PackedGeometryWriter`] produces it.
//! - [`reconstruct`] expands a decoded payload into per-frame geometry.
//! - [`decrypt`] holds the content key and the AES-128-CTR transform applied
//!   before decode.

pub mod decrypt;
mod packed;
pub mod reconstruct;

use std::collections::HashMap;
use std::fmt::Debug;

use crate::{PlayerError, Result};
use crate::types::{DecodedFrame, RawSample};

pub use decrypt::{ContentKey, KeySlot};
pub use packed::{PackedGeometryCodec, PackedGeometryWriter};

/// Name of the per-vertex position attribute.
pub const POSITION: &str = "position";
/// Name of the per-vertex normal attribute.
pub const NORMAL: &str = "normal";
/// Name of the per-vertex texture coordinate attribute.
pub const UV: &str = "uv";

/// Decoder for one compressed geometry payload format.
pub trait GeometryCodec: Send + Sync + Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Decode a clear (already decrypted) payload.
    fn decode(&self, payload: &[u8]) -> Result<DecodedPayload>;
}

/// Typed values of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeData {
    F32(Vec<f32>),
    U32(Vec<u32>),
    I32(Vec<i32>),
}

impl AttributeData {
    pub fn len(&self) -> usize {
        match self {
            AttributeData::F32(v) => v.len(),
            AttributeData::U32(v) => v.len(),
            AttributeData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values converted to `f32`, as consumed by the render sink.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            AttributeData::F32(v) => v.clone(),
            AttributeData::U32(v) => v.iter().map(|&x| x as f32).collect(),
            AttributeData::I32(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            AttributeData::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// One named vertex attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    /// Components per vertex
    pub item_size: u8,
    pub data: AttributeData,
}

impl Attribute {
    pub fn f32(name: impl Into<String>, item_size: u8, data: Vec<f32>) -> Self {
        Self { name: name.into(), item_size, data: AttributeData::F32(data) }
    }

    pub fn i32(name: impl Into<String>, item_size: u8, data: Vec<i32>) -> Self {
        Self { name: name.into(), item_size, data: AttributeData::I32(data) }
    }
}

/// Metadata entry value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    String(String),
    Int(i32),
    IntArray(Vec<i32>),
}

/// Structured metadata carried by each payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadMetadata {
    pub version: Option<String>,
    /// Per-sub-sample timestamps in track timescale units
    pub timestamps: Option<Vec<i64>>,
    pub delta_frames: Vec<usize>,
    pub interpolated_frames: Vec<usize>,
    /// Attribute ids holding raw position deltas, one per DELTA frame
    pub delta_ids: Vec<usize>,
    /// Attribute ids holding raw normal deltas, one per DELTA frame
    pub delta_normal_ids: Vec<usize>,
    pub weights_att: Option<usize>,
    pub bindings_att: Option<usize>,
    pub encrypted: bool,
}

impl PayloadMetadata {
    /// Build from raw entries. Unknown names are ignored; known names with
    /// the wrong kind are an error.
    pub fn from_entries(entries: &HashMap<String, MetadataValue>) -> Result<Self> {
        let mut metadata = PayloadMetadata::default();
        for (name, value) in entries {
            match (name.as_str(), value) {
                ("version", MetadataValue::String(v)) => metadata.version = Some(v.clone()),
                ("timestamp", MetadataValue::IntArray(v)) => {
                    metadata.timestamps = Some(v.iter().map(|&t| t as i64).collect())
                }
                ("deltaFrames", MetadataValue::IntArray(v)) => metadata.delta_frames = to_indices(name, v)?,
                ("interpolatedFrames", MetadataValue::IntArray(v)) => {
                    metadata.interpolated_frames = to_indices(name, v)?
                }
                ("deltaIds", MetadataValue::IntArray(v)) => metadata.delta_ids = to_indices(name, v)?,
                ("deltaNormalIds", MetadataValue::IntArray(v)) => {
                    metadata.delta_normal_ids = to_indices(name, v)?
                }
                ("weightsAtt", MetadataValue::Int(v)) => metadata.weights_att = Some(to_index(name, *v)?),
                ("bindingsAtt", MetadataValue::Int(v)) => metadata.bindings_att = Some(to_index(name, *v)?),
                ("encrypted", MetadataValue::Int(v)) => metadata.encrypted = *v != 0,
                (
                    "version" | "timestamp" | "deltaFrames" | "interpolatedFrames" | "deltaIds"
                    | "deltaNormalIds" | "weightsAtt" | "bindingsAtt" | "encrypted",
                    other,
                ) => {
                    return Err(PlayerError::decode(
                        "Payload metadata",
                        format!("Field '{}' has unexpected kind {:?}", name, other),
                    ));
                }
                _ => {}
            }
        }
        Ok(metadata)
    }

    /// Number of sub-samples described by this payload.
    pub fn sample_count(&self) -> usize {
        self.timestamps.as_ref().map_or(1, |t| t.len().max(1))
    }
}

fn to_index(name: &str, value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        PlayerError::decode("Payload metadata", format!("Field '{}' holds negative index {}", name, value))
    })
}

fn to_indices(name: &str, values: &[i32]) -> Result<Vec<usize>> {
    values.iter().map(|&v| to_index(name, v)).collect()
}

/// Output of [`GeometryCodec::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub metadata: PayloadMetadata,
    pub attributes: Vec<Attribute>,
    pub indices: Vec<u32>,
}

impl DecodedPayload {
    /// Attribute by list position.
    pub fn attribute_at(&self, id: usize) -> Option<&Attribute> {
        self.attributes.get(id)
    }

    /// First attribute with the given name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Decode one raw sample into its reconstructed frames.
///
/// The sample must already be decrypted.
pub fn decode_sample(codec: &dyn GeometryCodec, raw: &RawSample) -> Result<Vec<DecodedFrame>> {
    let payload = codec.decode(&raw.data)?;
    reconstruct::expand(payload, raw)
}
