//! Packed geometry payload format
//!
//! ```text
//! magic "VGEO" | version u16 | flags u16 | body
//! body       := metadata attributes indices      (zlib-deflated when flags bit 0 is set)
//! metadata   := u16 count { u8 name_len name u8 kind value }
//!               kind 0 string (u16 len + utf8), 1 int (i32), 2 int array (u32 n + n x i32)
//! attributes := u16 count { u8 name_len name u8 component u8 item_size u32 item_count data }
//!               component 0 f32, 1 u32, 2 i32
//! indices    := u32 count, count x u32
//! ```
//!
//! All integers and floats are little-endian.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::trace;

use super::{Attribute, AttributeData, DecodedPayload, GeometryCodec, MetadataValue, PayloadMetadata};
use crate::{PlayerError, Result};

const MAGIC: &[u8; 4] = b"VGEO";
const FORMAT_VERSION: u16 = 1;
const FLAG_DEFLATE: u16 = 0x0001;
const HEADER_SIZE: usize = 8;

/// Default cap on an inflated payload body.
pub const DEFAULT_INFLATE_LIMIT: u64 = 64 << 20;

const KIND_STRING: u8 = 0;
const KIND_INT: u8 = 1;
const KIND_INT_ARRAY: u8 = 2;

const COMPONENT_F32: u8 = 0;
const COMPONENT_U32: u8 = 1;
const COMPONENT_I32: u8 = 2;

/// Decoder for the packed geometry format.
#[derive(Debug, Clone)]
pub struct PackedGeometryCodec {
    inflate_limit: u64,
}

impl Default for PackedGeometryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PackedGeometryCodec {
    pub fn new() -> Self {
        Self { inflate_limit: DEFAULT_INFLATE_LIMIT }
    }

    /// Reject deflated bodies that inflate past `limit` bytes.
    pub fn with_inflate_limit(mut self, limit: u64) -> Self {
        self.inflate_limit = limit;
        self
    }
}

impl GeometryCodec for PackedGeometryCodec {
    fn name(&self) -> &'static str {
        "packed"
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedPayload> {
        if payload.len() < HEADER_SIZE {
            return Err(PlayerError::decode(
                "Payload header",
                format!("Payload of {} bytes is shorter than the {} byte header", payload.len(), HEADER_SIZE),
            ));
        }
        if &payload[..4] != MAGIC {
            return Err(PlayerError::decode("Payload header", "Bad magic"));
        }
        let version = u16::from_le_bytes([payload[4], payload[5]]);
        if version != FORMAT_VERSION {
            return Err(PlayerError::decode(
                "Payload header",
                format!("Unsupported format version {} (expected {})", version, FORMAT_VERSION),
            ));
        }
        let flags = u16::from_le_bytes([payload[6], payload[7]]);

        let inflated;
        let body = if flags & FLAG_DEFLATE != 0 {
            let mut decoder = ZlibDecoder::new(&payload[HEADER_SIZE..]).take(self.inflate_limit.saturating_add(1));
            let mut buffer = Vec::new();
            decoder
                .read_to_end(&mut buffer)
                .map_err(|e| PlayerError::decode("Payload body", format!("Inflate failed: {}", e)))?;
            if buffer.len() as u64 > self.inflate_limit {
                return Err(PlayerError::decode(
                    "Payload body",
                    format!("Inflated body exceeds {} bytes", self.inflate_limit),
                ));
            }
            inflated = buffer;
            &inflated[..]
        } else {
            &payload[HEADER_SIZE..]
        };

        let mut reader = PayloadReader::new(body);
        let entries = read_metadata(&mut reader)?;
        let metadata = PayloadMetadata::from_entries(&entries)?;
        let attributes = read_attributes(&mut reader)?;
        let index_count = reader.u32()? as usize;
        let indices = reader.u32_array(index_count)?;

        trace!(
            attributes = attributes.len(),
            indices = indices.len(),
            samples = metadata.sample_count(),
            "Decoded packed payload"
        );
        Ok(DecodedPayload { metadata, attributes, indices })
    }
}

fn read_metadata(reader: &mut PayloadReader<'_>) -> Result<HashMap<String, MetadataValue>> {
    let count = reader.u16()? as usize;
    let mut entries = HashMap::with_capacity(count);
    for _ in 0..count {
        let name = reader.short_string()?;
        let value = match reader.u8()? {
            KIND_STRING => {
                let len = reader.u16()? as usize;
                let bytes = reader.bytes(len)?;
                MetadataValue::String(String::from_utf8_lossy(bytes).into_owned())
            }
            KIND_INT => MetadataValue::Int(reader.i32()?),
            KIND_INT_ARRAY => {
                let len = reader.u32()? as usize;
                MetadataValue::IntArray(reader.i32_array(len)?)
            }
            other => {
                return Err(PlayerError::decode(
                    "Payload metadata",
                    format!("Unknown kind {} for field '{}'", other, name),
                ));
            }
        };
        entries.insert(name, value);
    }
    Ok(entries)
}

fn read_attributes(reader: &mut PayloadReader<'_>) -> Result<Vec<Attribute>> {
    let count = reader.u16()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let name = reader.short_string()?;
        let component = reader.u8()?;
        let item_size = reader.u8()?;
        if item_size == 0 {
            return Err(PlayerError::decode("Payload attributes", format!("Attribute '{}' has item size 0", name)));
        }
        let item_count = reader.u32()? as usize;
        let len = item_count.checked_mul(item_size as usize).ok_or_else(|| {
            PlayerError::decode("Payload attributes", format!("Attribute '{}' length overflows", name))
        })?;
        let data = match component {
            COMPONENT_F32 => AttributeData::F32(reader.f32_array(len)?),
            COMPONENT_U32 => AttributeData::U32(reader.u32_array(len)?),
            COMPONENT_I32 => AttributeData::I32(reader.i32_array(len)?),
            other => {
                return Err(PlayerError::decode(
                    "Payload attributes",
                    format!("Unknown component type {} for attribute '{}'", other, name),
                ));
            }
        };
        attributes.push(Attribute { name, item_size, data });
    }
    Ok(attributes)
}

/// Bounds-checked little-endian cursor.
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(PlayerError::decode(
                "Payload body",
                format!("Insufficient data at offset {} (need {} bytes, have {})", self.pos, len, remaining),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn short_string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }

    fn words(&mut self, count: usize) -> Result<impl Iterator<Item = [u8; 4]> + 'a> {
        let len = count.checked_mul(4).ok_or_else(|| PlayerError::decode("Payload body", "Array length overflows"))?;
        let bytes = self.bytes(len)?;
        Ok(bytes.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]))
    }

    fn u32_array(&mut self, count: usize) -> Result<Vec<u32>> {
        Ok(self.words(count)?.map(u32::from_le_bytes).collect())
    }

    fn i32_array(&mut self, count: usize) -> Result<Vec<i32>> {
        Ok(self.words(count)?.map(i32::from_le_bytes).collect())
    }

    fn f32_array(&mut self, count: usize) -> Result<Vec<f32>> {
        Ok(self.words(count)?.map(f32::from_le_bytes).collect())
    }
}

/// Encoder for the packed geometry format.
///
/// ```rust
/// use holosync::codec::{GeometryCodec, PackedGeometryCodec, PackedGeometryWriter};
///
/// let payload = PackedGeometryWriter::new()
///     .timestamps(&[0, 3000])
///     .delta_frames(&[1])
///     .positions(vec![0.0; 9])
///     .delta_positions(vec![0.5; 9])
///     .indices(vec![0, 1, 2])
///     .finish()
///     .unwrap();
///
/// let decoded = PackedGeometryCodec::new().decode(&payload).unwrap();
/// assert_eq!(decoded.metadata.sample_count(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PackedGeometryWriter {
    metadata: Vec<(String, MetadataValue)>,
    attributes: Vec<Attribute>,
    indices: Vec<u32>,
    deflate: bool,
}

impl PackedGeometryWriter {
    pub fn new() -> Self {
        Self { metadata: vec![("version".to_string(), MetadataValue::String("1".to_string()))], ..Self::default() }
    }

    /// Add or replace a metadata entry.
    pub fn metadata(mut self, name: &str, value: MetadataValue) -> Self {
        self.metadata.retain(|(n, _)| n != name);
        self.metadata.push((name.to_string(), value));
        self
    }

    pub fn timestamps(self, timestamps: &[i32]) -> Self {
        self.metadata("timestamp", MetadataValue::IntArray(timestamps.to_vec()))
    }

    pub fn delta_frames(self, frames: &[i32]) -> Self {
        self.metadata("deltaFrames", MetadataValue::IntArray(frames.to_vec()))
    }

    pub fn interpolated_frames(self, frames: &[i32]) -> Self {
        self.metadata("interpolatedFrames", MetadataValue::IntArray(frames.to_vec()))
    }

    /// Append an attribute and return the writer; its id is its list position.
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn positions(self, positions: Vec<f32>) -> Self {
        self.attribute(Attribute::f32(super::POSITION, 3, positions))
    }

    pub fn normals(self, normals: Vec<f32>) -> Self {
        self.attribute(Attribute::f32(super::NORMAL, 3, normals))
    }

    pub fn uvs(self, uvs: Vec<f32>) -> Self {
        self.attribute(Attribute::f32(super::UV, 2, uvs))
    }

    /// Append a raw position delta and register it in `deltaIds`.
    pub fn delta_positions(self, delta: Vec<f32>) -> Self {
        self.registered("deltaIds", "delta", delta)
    }

    /// Append a raw normal delta and register it in `deltaNormalIds`.
    pub fn delta_normals(self, delta: Vec<f32>) -> Self {
        self.registered("deltaNormalIds", "deltaNormal", delta)
    }

    pub fn weights(mut self, weights: Vec<f32>) -> Self {
        let id = self.attributes.len() as i32;
        self = self.attribute(Attribute::f32("weightsAtt", 4, weights));
        self.metadata("weightsAtt", MetadataValue::Int(id))
    }

    pub fn bindings(mut self, bindings: Vec<i32>) -> Self {
        let id = self.attributes.len() as i32;
        self = self.attribute(Attribute::i32("bindingsAtt", 4, bindings));
        self.metadata("bindingsAtt", MetadataValue::Int(id))
    }

    pub fn indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = indices;
        self
    }

    /// Deflate the body with zlib.
    pub fn deflate(mut self, deflate: bool) -> Self {
        self.deflate = deflate;
        self
    }

    fn registered(mut self, list: &str, name: &str, data: Vec<f32>) -> Self {
        let id = self.attributes.len() as i32;
        let mut ids = match self.metadata.iter().find(|(n, _)| n == list) {
            Some((_, MetadataValue::IntArray(ids))) => ids.clone(),
            _ => Vec::new(),
        };
        ids.push(id);
        self = self.attribute(Attribute::f32(format!("{}{}", name, ids.len() - 1), 3, data));
        self.metadata(list, MetadataValue::IntArray(ids))
    }

    /// Serialize the payload.
    pub fn finish(self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        put_u16(&mut body, self.metadata.len())?;
        for (name, value) in &self.metadata {
            put_short_string(&mut body, name)?;
            match value {
                MetadataValue::String(s) => {
                    body.push(KIND_STRING);
                    put_u16(&mut body, s.len())?;
                    body.extend_from_slice(s.as_bytes());
                }
                MetadataValue::Int(v) => {
                    body.push(KIND_INT);
                    body.extend_from_slice(&v.to_le_bytes());
                }
                MetadataValue::IntArray(values) => {
                    body.push(KIND_INT_ARRAY);
                    body.extend_from_slice(&(values.len() as u32).to_le_bytes());
                    values.iter().for_each(|v| body.extend_from_slice(&v.to_le_bytes()));
                }
            }
        }

        put_u16(&mut body, self.attributes.len())?;
        for attribute in &self.attributes {
            put_short_string(&mut body, &attribute.name)?;
            let item_size = attribute.item_size.max(1) as usize;
            let (component, words): (u8, Vec<[u8; 4]>) = match &attribute.data {
                AttributeData::F32(v) => (COMPONENT_F32, v.iter().map(|x| x.to_le_bytes()).collect()),
                AttributeData::U32(v) => (COMPONENT_U32, v.iter().map(|x| x.to_le_bytes()).collect()),
                AttributeData::I32(v) => (COMPONENT_I32, v.iter().map(|x| x.to_le_bytes()).collect()),
            };
            if words.len() % item_size != 0 {
                return Err(PlayerError::decode(
                    "Payload encoding",
                    format!("Attribute '{}' length {} is not a multiple of {}", attribute.name, words.len(), item_size),
                ));
            }
            body.push(component);
            body.push(item_size as u8);
            body.extend_from_slice(&((words.len() / item_size) as u32).to_le_bytes());
            words.iter().for_each(|w| body.extend_from_slice(w));
        }

        body.extend_from_slice(&(self.indices.len() as u32).to_le_bytes());
        self.indices.iter().for_each(|i| body.extend_from_slice(&i.to_le_bytes()));

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        if self.deflate {
            out.extend_from_slice(&FLAG_DEFLATE.to_le_bytes());
            let mut encoder = ZlibEncoder::new(out, Compression::default());
            encoder
                .write_all(&body)
                .map_err(|e| PlayerError::decode("Payload encoding", format!("Deflate failed: {}", e)))?;
            return encoder
                .finish()
                .map_err(|e| PlayerError::decode("Payload encoding", format!("Deflate failed: {}", e)));
        }
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn put_u16(out: &mut Vec<u8>, value: usize) -> Result<()> {
    let value = u16::try_from(value)
        .map_err(|_| PlayerError::decode("Payload encoding", format!("Count {} exceeds u16", value)))?;
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_short_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| PlayerError::decode("Payload encoding", format!("Name '{}' is too long", value)))?;
    out.push(len);
    out.extend_from_slice(value.as_bytes());
    Ok(())
}
