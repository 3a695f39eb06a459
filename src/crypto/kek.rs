//! Key material: content keys and the license-derived key-encryption-key.
//!
//! A content key encrypts exactly one artifact and exists unwrapped only
//! on the stack, zeroized on drop. The key-encryption-key is derived from
//! the server master secret and the license id, so unwrapping is
//! structurally tied to a specific license.

use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::model::LicenseId;

/// Size of content keys and KEKs in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Domain separation prefix for KEK derivation.
const KEK_DOMAIN: &[u8] = b"keyfort/kek/v1";

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Build a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// The key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The server master secret all KEKs derive from.
///
/// Rotating it invalidates every wrapped content key until the explicit
/// re-wrap pass runs (`ArtifactVault::rotate_master_secret`).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret {
    bytes: Vec<u8>,
}

impl MasterSecret {
    /// Build a master secret from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Derive the key-encryption-key for a license.
    pub fn derive_kek(&self, license_id: LicenseId) -> ContentKey {
        let mut hasher = Sha256::new();
        hasher.update(KEK_DOMAIN);
        hasher.update(&self.bytes);
        hasher.update(license_id.as_bytes());
        ContentKey::from_bytes(hasher.finalize().into())
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
