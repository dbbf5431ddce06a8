//! MIME type to frame store constructor table
//!
//! The streaming client asks the registry whether it can buffer a
//! representation's MIME type and, if so, for a fresh store.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::FrameStore;
use crate::config::BufferConfig;

/// Geometry in fragmented MP4.
pub const MESH_MP4_MIME: &str = "mesh/mp4;codecs=\"draco.514\"";
/// Geometry in the flatbuffer container variant.
pub const MESH_FB_MIME: &str = "mesh/fb;codecs=\"draco.514\"";

/// Constructor registered for a MIME type.
pub type BufferFactory = Arc<dyn Fn(&BufferConfig) -> FrameStore + Send + Sync>;

#[derive(Clone, Default)]
pub struct BufferRegistry {
    factories: HashMap<String, BufferFactory>,
}

impl BufferRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry handling both geometry MIME types with [`FrameStore::new`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let factory: BufferFactory = Arc::new(|config: &BufferConfig| FrameStore::new(config.clone()));
        registry.register(MESH_MP4_MIME, Arc::clone(&factory));
        registry.register(MESH_FB_MIME, factory);
        registry
    }

    /// Register `factory` for `mime`, replacing any previous entry.
    pub fn register(&mut self, mime: &str, factory: BufferFactory) {
        let key = normalize(mime);
        debug!(mime = %key, "Registered buffer factory");
        self.factories.insert(key, factory);
    }

    pub fn is_supported(&self, mime: &str) -> bool {
        self.factories.contains_key(&normalize(mime))
    }

    /// Build a store for `mime`, or `None` when the type is not handled here.
    pub fn create(&self, mime: &str, config: &BufferConfig) -> Option<FrameStore> {
        let factory = self.factories.get(&normalize(mime))?;
        Some(factory(config))
    }

    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry").field("mime_types", &self.factories.keys().collect::<Vec<_>>()).finish()
    }
}

/// MIME types compare case-insensitively and ignore whitespace.
fn normalize(mime: &str) -> String {
    mime.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodeModeKind;
    use crate::buffer::DecodeMode;

    #[test]
    fn default_registry_handles_geometry_types() {
        let registry = BufferRegistry::with_defaults();
        assert!(registry.is_supported(MESH_MP4_MIME));
        assert!(registry.is_supported("mesh/fb; codecs=\"draco.514\""));
        assert!(registry.is_supported("MESH/MP4;codecs=\"DRACO.514\""));
        assert!(!registry.is_supported("video/mp4;codecs=\"avc1.640028\""));
        assert_eq!(registry.mime_types().count(), 2);
    }

    #[test]
    fn create_applies_config() {
        let registry = BufferRegistry::with_defaults();
        let config = BufferConfig { decode_mode: DecodeModeKind::Inline, ..Default::default() };
        let store = registry.create(MESH_MP4_MIME, &config).unwrap();
        assert_eq!(store.decode_mode(), DecodeMode::Inline);
        assert!(!store.is_initialized());
        assert!(registry.create("video/webm", &config).is_none());
    }

    #[test]
    fn custom_factory_replaces_default() {
        let mut registry = BufferRegistry::new();
        registry.register(
            MESH_MP4_MIME,
            Arc::new(|config: &BufferConfig| {
                FrameStore::new(BufferConfig { max_frames: 10, decode_mode: DecodeModeKind::Inline, ..config.clone() })
            }),
        );
        let store = registry.create(MESH_MP4_MIME, &BufferConfig::default()).unwrap();
        assert_eq!(store.config().max_frames, 10);
    }
}
