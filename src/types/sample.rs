//! Container-level units: appended segments and extracted samples

use std::sync::Arc;

/// Raw bytes for one fragment of the geometry track.
#[derive(Debug, Clone)]
pub struct Segment {
    /// File position of the first byte; `None` continues at the buffer cursor
    pub offset: Option<u64>,
    /// Segment bytes (zero-copy via Arc)
    pub data: Arc<[u8]>,
}

impl Segment {
    /// Segment continuing at the current cursor.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { offset: None, data: data.into() }
    }

    /// Segment at an explicit file position.
    pub fn at(offset: u64, data: impl Into<Arc<[u8]>>) -> Self {
        Self { offset: Some(offset), data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One sample extracted from the container, prior to decode.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub track_id: u32,
    pub data: Arc<[u8]>,
    /// Decode timestamp in track timescale units
    pub dts: u64,
    /// Duration in track timescale units
    pub duration: u64,
    pub timescale: u32,
    /// Whether `data` must be decrypted before decode
    pub encrypted: bool,
    /// Per-sample initialization vector from `senc`
    pub iv: Option<Vec<u8>>,
}

impl RawSample {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
