//! Content key providers
//!
//! Frame stores decode unencrypted samples without a key and park encrypted
//! batches until one is installed in their [`KeySlot`]. A provider is whatever
//! fetches key material for the session: a license server client, a fixed key
//! from configuration, and so on.

use tracing::{debug, warn};

use crate::Result;
use crate::codec::{ContentKey, KeySlot};

/// Source of content key material.
#[async_trait::async_trait]
pub trait KeyProvider: Send + Sync {
    /// Fetch the session key.
    ///
    /// Returns:
    /// - `Ok(Some(key))` - Key available
    /// - `Ok(None)` - No key for this session (yet)
    /// - `Err(e)` - The request failed
    async fn request_key(&self) -> Result<Option<ContentKey>>;
}

/// Request a key from `provider` and store it in `slot`.
///
/// Returns whether a key was installed. A slot that already holds a key is
/// left untouched when the provider has none.
pub async fn install_key<P>(provider: &P, slot: &KeySlot) -> Result<bool>
where
    P: KeyProvider + ?Sized,
{
    match provider.request_key().await {
        Ok(Some(key)) => {
            slot.set(key);
            Ok(true)
        }
        Ok(None) => {
            debug!(already_set = slot.is_set(), "Key provider returned no key");
            Ok(false)
        }
        Err(e) => {
            warn!(error = %e, "Key request failed");
            Err(e)
        }
    }
}

/// Provider handing out a key known up front.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: Option<ContentKey>,
}

impl StaticKeyProvider {
    pub fn new(key: ContentKey) -> Self {
        Self { key: Some(key) }
    }

    /// A provider for unencrypted content.
    pub fn none() -> Self {
        Self { key: None }
    }
}

#[async_trait::async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn request_key(&self) -> Result<Option<ContentKey>> {
        Ok(self.key.clone())
    }
}
