//! Authenticated encryption (ChaCha20-Poly1305) with a detached tag,
//! plus content-key wrapping.
//!
//! Artifact ciphertexts store nonce, ciphertext, and tag as separate
//! fields; wrapped keys are a single opaque blob laid out as
//! nonce ‖ ciphertext ‖ tag.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::crypto::kek::{ContentKey, KEY_SIZE};
use crate::KeyfortError;

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

fn cipher(key: &ContentKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(key.as_bytes().into())
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext`, returning nonce, ciphertext, and detached tag.
pub fn seal_detached(
    key: &ContentKey,
    plaintext: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>, [u8; TAG_SIZE]), KeyfortError> {
    let nonce_bytes = random_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    // The AEAD implementation appends the tag; detach it for storage.
    let mut combined = cipher(key)
        .encrypt(nonce, plaintext)
        .map_err(|e| KeyfortError::Crypto(format!("encryption failed: {e}")))?;
    let tag_start = combined.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&combined[tag_start..]);
    combined.truncate(tag_start);

    Ok((nonce_bytes, combined, tag))
}

/// Verify the tag and decrypt. Any mismatch — wrong key, tampered
/// ciphertext, swapped tag — fails before a byte of plaintext is
/// produced.
pub fn open_detached(
    key: &ContentKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>, KeyfortError> {
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher(key)
        .decrypt(Nonce::from_slice(nonce), combined.as_ref())
        .map_err(|_| KeyfortError::IntegrityCheckFailed)
}

/// Wrap a content key under a KEK. Output layout: nonce ‖ ct ‖ tag.
pub fn wrap_key(kek: &ContentKey, content_key: &ContentKey) -> Result<Vec<u8>, KeyfortError> {
    let nonce_bytes = random_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let wrapped = cipher(kek)
        .encrypt(nonce, content_key.as_bytes().as_ref())
        .map_err(|e| KeyfortError::Crypto(format!("key wrap failed: {e}")))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + wrapped.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&wrapped);
    Ok(blob)
}

/// Unwrap a content key blob produced by [`wrap_key`].
pub fn unwrap_key(kek: &ContentKey, blob: &[u8]) -> Result<ContentKey, KeyfortError> {
    if blob.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(KeyfortError::IntegrityCheckFailed);
    }
    let (nonce_bytes, wrapped) = blob.split_at(NONCE_SIZE);

    let key_bytes = cipher(kek)
        .decrypt(Nonce::from_slice(nonce_bytes), wrapped)
        .map_err(|_| KeyfortError::IntegrityCheckFailed)?;

    let bytes: [u8; KEY_SIZE] = key_bytes
        .try_into()
        .map_err(|_| KeyfortError::IntegrityCheckFailed)?;
    Ok(ContentKey::from_bytes(bytes))
}
