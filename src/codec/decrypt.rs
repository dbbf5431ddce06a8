//! Sample decryption
//!
//! Encrypted geometry samples use AES-128 in counter mode with a per-sample
//! IV from `senc`. An 8-byte IV is the high half of the 16-byte counter
//! block, as in CENC `cenc` scheme streams.

use std::fmt;
use std::sync::Arc;

use aes::Aes128;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use tokio::sync::watch;
use tracing::debug;

use crate::types::RawSample;
use crate::{PlayerError, Result};

type Aes128Ctr = Ctr128BE<Aes128>;

/// Length of an AES-128 key in bytes.
pub const KEY_LEN: usize = 16;

/// AES-128 content key.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| PlayerError::Decryption {
            details: format!("Content key must be {} bytes, got {}", KEY_LEN, bytes.len()),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

impl From<[u8; KEY_LEN]> for ContentKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

/// Shared, read-only slot for the session's content key.
///
/// Cloning shares the slot. Once set, the key is visible to every holder and
/// survives buffer resets.
#[derive(Clone)]
pub struct KeySlot {
    tx: Arc<watch::Sender<Option<Arc<ContentKey>>>>,
}

impl KeySlot {
    pub fn new() -> Self {
        Self { tx: Arc::new(watch::Sender::new(None)) }
    }

    /// Store the key; replaces any previous key.
    pub fn set(&self, key: ContentKey) {
        debug!("Content key installed");
        self.tx.send_replace(Some(Arc::new(key)));
    }

    pub fn get(&self) -> Option<Arc<ContentKey>> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Receiver notified when the key changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ContentKey>>> {
        self.tx.subscribe()
    }
}

impl Default for KeySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySlot").field("is_set", &self.is_set()).finish()
    }
}

/// Apply the AES-128-CTR keystream to `data` in place.
///
/// The transform is its own inverse.
pub fn apply_keystream(key: &ContentKey, iv: &[u8], data: &mut [u8]) -> Result<()> {
    if iv.is_empty() || iv.len() > 16 {
        return Err(PlayerError::Decryption { details: format!("IV must be 1..=16 bytes, got {}", iv.len()) });
    }
    let mut counter = [0u8; 16];
    counter[..iv.len()].copy_from_slice(iv);
    let mut cipher = Aes128Ctr::new(&(*key.as_bytes()).into(), &counter.into());
    cipher.apply_keystream(data);
    Ok(())
}

/// Return a clear copy of an encrypted sample. Clear samples pass through.
pub fn decrypt_sample(key: &ContentKey, sample: &RawSample) -> Result<RawSample> {
    if !sample.encrypted {
        return Ok(sample.clone());
    }
    let iv = sample
        .iv
        .as_deref()
        .ok_or_else(|| PlayerError::Decryption { details: format!("Sample at dts {} has no IV", sample.dts) })?;
    let mut data = sample.data.to_vec();
    apply_keystream(key, iv, &mut data)?;
    Ok(RawSample { data: data.into(), encrypted: false, iv: None, ..sample.clone() })
}
