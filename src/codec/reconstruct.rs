//! Delta and interpolated frame reconstruction
//!
//! One payload carries a FULL keyframe at sub-sample 0 and any number of
//! DELTA and INTERPOLATED sub-samples. Reconstruction runs in two passes:
//!
//! 1. DELTA frames in ascending order accumulate their raw deltas into a
//!    cumulative delta, stored on the frame, and add it to the keyframe
//!    positions (and normals when normal deltas are present).
//! 2. INTERPOLATED frames blend between the nearest preceding DELTA or FULL
//!    frame and the nearest following DELTA frame.

use std::sync::Arc;

use tracing::warn;

use super::{DecodedPayload, NORMAL, POSITION, UV};
use crate::types::{DecodedFrame, FrameKind, Geometry, RawSample, SKINNING_ITEM_SIZE};
use crate::{PlayerError, Result};

/// Expand a decoded payload into per-sub-sample frames.
pub fn expand(payload: DecodedPayload, raw: &RawSample) -> Result<Vec<DecodedFrame>> {
    let metadata = &payload.metadata;
    let count = metadata.sample_count();

    let positions = payload
        .attribute(POSITION)
        .ok_or_else(|| PlayerError::decode("Reconstruction", "Payload has no position attribute"))?
        .data
        .to_f32();
    if positions.len() % 3 != 0 {
        return Err(PlayerError::decode(
            "Reconstruction",
            format!("Position attribute length {} is not a multiple of 3", positions.len()),
        ));
    }
    let vertex_count = positions.len() / 3;
    let normals = payload.attribute(NORMAL).map(|a| a.data.to_f32());
    if let Some(normals) = &normals
        && normals.len() != positions.len()
    {
        return Err(PlayerError::decode("Reconstruction", "Normal attribute does not match position count"));
    }
    let uvs: Arc<[f32]> = payload.attribute(UV).map(|a| a.data.to_f32()).unwrap_or_default().into();

    let skinning = |id: Option<usize>, name: &str| -> Result<Vec<f32>> {
        let attribute = match id {
            Some(id) => payload.attribute_at(id),
            None => payload.attribute(name),
        };
        let values = attribute.map_or_else(|| vec![0.0; vertex_count * SKINNING_ITEM_SIZE], |a| a.data.to_f32());
        if values.len() != vertex_count * SKINNING_ITEM_SIZE {
            return Err(PlayerError::decode(
                "Reconstruction",
                format!("Skinning attribute '{}' has {} values for {} vertices", name, values.len(), vertex_count),
            ));
        }
        Ok(values)
    };
    let weights = skinning(metadata.weights_att, "weightsAtt")?;
    let bindings = skinning(metadata.bindings_att, "bindingsAtt")?;

    let kinds = frame_kinds(count, &metadata.delta_frames, &metadata.interpolated_frames)?;
    let delta_count = kinds.iter().filter(|k| **k == FrameKind::Delta).count();

    let position_deltas = delta_arrays(&payload, &metadata.delta_ids, delta_count, positions.len(), "deltaIds")?;
    let has_normal_deltas = normals.is_some()
        && !metadata.delta_normal_ids.is_empty()
        && metadata.delta_normal_ids.iter().all(|&id| payload.attribute_at(id).is_some());
    let normal_deltas = if has_normal_deltas {
        Some(delta_arrays(&payload, &metadata.delta_normal_ids, delta_count, positions.len(), "deltaNormalIds")?)
    } else {
        None
    };

    let full = Geometry {
        indices: Arc::from(payload.indices.as_slice()),
        uvs,
        positions,
        normals,
        weights,
        bindings,
        delta: None,
        delta_normals: None,
    };

    let duration = raw.duration / count as u64;
    let mut frames = Vec::with_capacity(count);
    for (index, kind) in kinds.iter().enumerate() {
        let timestamp = match &metadata.timestamps {
            Some(timestamps) if !timestamps.is_empty() => u64::try_from(timestamps[index]).map_err(|_| {
                PlayerError::decode("Reconstruction", format!("Negative timestamp {}", timestamps[index]))
            })?,
            _ => raw.dts,
        };
        let geometry = if index == 0 { full.clone() } else { full.derive() };
        frames.push(DecodedFrame { kind: *kind, geometry, timestamp, duration, timescale: raw.timescale });
    }

    apply_deltas(&mut frames, &position_deltas, normal_deltas.as_deref())?;
    Ok(interpolate(frames))
}

fn frame_kinds(count: usize, delta: &[usize], interpolated: &[usize]) -> Result<Vec<FrameKind>> {
    let mut kinds = vec![FrameKind::Full; count];
    for (list, kind) in [(delta, FrameKind::Delta), (interpolated, FrameKind::Interpolated)] {
        for &index in list {
            if index == 0 || index >= count {
                return Err(PlayerError::decode(
                    "Reconstruction",
                    format!("{:?} index {} outside 1..{}", kind, index, count),
                ));
            }
            kinds[index] = kind;
        }
    }
    Ok(kinds)
}

fn delta_arrays(
    payload: &DecodedPayload,
    ids: &[usize],
    needed: usize,
    len: usize,
    field: &str,
) -> Result<Vec<Vec<f32>>> {
    if ids.len() < needed {
        return Err(PlayerError::decode(
            "Reconstruction",
            format!("{} lists {} attributes for {} delta frames", field, ids.len(), needed),
        ));
    }
    ids.iter()
        .take(needed)
        .map(|&id| {
            let values = payload
                .attribute_at(id)
                .ok_or_else(|| PlayerError::decode("Reconstruction", format!("{} names missing attribute {}", field, id)))?
                .data
                .to_f32();
            if values.len() != len {
                return Err(PlayerError::decode(
                    "Reconstruction",
                    format!("Delta attribute {} has {} values, expected {}", id, values.len(), len),
                ));
            }
            Ok(values)
        })
        .collect()
}

/// Apply raw deltas to the DELTA frames of a batch anchored on `frames[0]`.
///
/// `position_deltas[k]` is the raw delta of the k-th DELTA frame in index
/// order. Each frame ends up with `positions = base + cumulative` and
/// `delta = Some(cumulative)`.
pub fn apply_deltas(
    frames: &mut [DecodedFrame],
    position_deltas: &[Vec<f32>],
    normal_deltas: Option<&[Vec<f32>]>,
) -> Result<()> {
    let Some(first) = frames.first() else {
        return Ok(());
    };
    if first.kind != FrameKind::Full {
        return Err(PlayerError::decode("Reconstruction", "First sub-sample is not a FULL frame"));
    }

    let mut previous: Option<Vec<f32>> = None;
    let mut previous_normals: Option<Vec<f32>> = None;
    for (k, frame) in frames.iter_mut().filter(|f| f.kind == FrameKind::Delta).enumerate() {
        let raw = position_deltas
            .get(k)
            .ok_or_else(|| PlayerError::decode("Reconstruction", format!("Missing delta for DELTA frame {}", k)))?;
        let cumulative = accumulate(raw, previous.as_deref());
        for (p, d) in frame.geometry.positions.iter_mut().zip(&cumulative) {
            *p += d;
        }

        if let Some(normal_deltas) = normal_deltas
            && let Some(raw_normals) = normal_deltas.get(k)
            && let Some(normals) = frame.geometry.normals.as_mut()
        {
            let cumulative_normals = accumulate(raw_normals, previous_normals.as_deref());
            for (n, d) in normals.iter_mut().zip(&cumulative_normals) {
                *n += d;
            }
            frame.geometry.delta_normals = Some(cumulative_normals.clone());
            previous_normals = Some(cumulative_normals);
        }

        frame.geometry.delta = Some(cumulative.clone());
        previous = Some(cumulative);
    }
    Ok(())
}

fn accumulate(raw: &[f32], previous: Option<&[f32]>) -> Vec<f32> {
    match previous {
        Some(previous) => raw.iter().zip(previous).map(|(r, p)| r + p).collect(),
        None => raw.to_vec(),
    }
}

/// Blend between two anchors of the same payload.
///
/// `backward_delta` is `None` when the backward anchor is the FULL frame.
/// The result equals the backward anchor exactly at `t = 0` and the forward
/// anchor exactly at `t = 1`.
pub fn interpolate_between(base: &[f32], backward_delta: Option<&[f32]>, forward_delta: &[f32], t: f32) -> Vec<f32> {
    base.iter()
        .enumerate()
        .map(|(i, &b)| {
            let backward = match backward_delta {
                Some(delta) => b + delta[i],
                None => b,
            };
            let forward = b + forward_delta[i];
            (1.0 - t) * backward + t * forward
        })
        .collect()
}

/// Fill INTERPOLATED frames; those without a forward DELTA anchor are dropped.
pub fn interpolate(mut frames: Vec<DecodedFrame>) -> Vec<DecodedFrame> {
    let mut dropped = Vec::new();

    for index in 0..frames.len() {
        if frames[index].kind != FrameKind::Interpolated {
            continue;
        }
        let Some(backward) = (0..index).rev().find(|&i| matches!(frames[i].kind, FrameKind::Delta | FrameKind::Full))
        else {
            dropped.push(index);
            continue;
        };
        let Some(forward) = (index + 1..frames.len()).find(|&i| frames[i].kind == FrameKind::Delta) else {
            warn!(index, "Interpolated frame has no forward anchor, dropping");
            dropped.push(index);
            continue;
        };

        let t = (index - backward) as f32 / (forward - backward) as f32;
        let full = &frames[0].geometry;
        let back = &frames[backward].geometry;
        let fwd = &frames[forward].geometry;
        let Some(forward_delta) = fwd.delta.as_deref() else {
            dropped.push(index);
            continue;
        };

        let positions = interpolate_between(&full.positions, back.delta.as_deref(), forward_delta, t);
        let normals = match (&full.normals, fwd.delta_normals.as_deref()) {
            (Some(base), Some(forward_normals)) => {
                Some(interpolate_between(base, back.delta_normals.as_deref(), forward_normals, t))
            }
            _ => None,
        };

        let target = &mut frames[index].geometry;
        target.positions = positions;
        if let Some(normals) = normals {
            target.normals = Some(normals);
        }
    }

    if dropped.is_empty() {
        return frames;
    }
    frames.into_iter().enumerate().filter(|(i, _)| !dropped.contains(i)).map(|(_, f)| f).collect()
}
