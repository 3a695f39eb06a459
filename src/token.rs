//! License key tokens and device fingerprints.
//!
//! A key token is a 160-bit random capability, base32-encoded for human
//! transcription. It carries no structure and is never derivable from the
//! internal license id; the registry stores only its SHA-256 hash.

use crate::KeyfortError;
use base32::Alphabet;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Raw token entropy in bytes (160 bits).
const TOKEN_BYTES: usize = 20;

/// Base32 alphabet for key tokens (RFC 4648, unpadded).
const TOKEN_ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

/// A license key token, formatted as dash-separated base32 groups,
/// e.g. `Q7MX-K2P4-....`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyToken(String);

impl KeyToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let encoded = base32::encode(TOKEN_ALPHABET, &bytes);
        let grouped = encoded
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).expect("base32 output is ASCII"))
            .collect::<Vec<_>>()
            .join("-");
        Self(grouped)
    }

    /// Parse a token string as presented by a client.
    ///
    /// Dashes and case are ignored; anything that does not decode to
    /// exactly 160 bits is rejected.
    pub fn parse(s: &str) -> Result<Self, KeyfortError> {
        let compact: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let decoded = base32::decode(TOKEN_ALPHABET, &compact)
            .ok_or_else(|| KeyfortError::Validation("malformed license key".to_string()))?;
        if decoded.len() != TOKEN_BYTES {
            return Err(KeyfortError::Validation(format!(
                "license key must encode {} bytes, got {}",
                TOKEN_BYTES,
                decoded.len()
            )));
        }

        let encoded = base32::encode(TOKEN_ALPHABET, &decoded);
        let grouped = encoded
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).expect("base32 output is ASCII"))
            .collect::<Vec<_>>()
            .join("-");
        Ok(Self(grouped))
    }

    /// The canonical token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 of the canonical token string, hex-encoded. This is the
    /// only form the registry persists.
    pub fn hash(&self) -> String {
        hash_key(&self.0)
    }
}

/// Hash a key token for storage or lookup (SHA-256, hex).
pub fn hash_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

/// Derive an opaque device fingerprint from client-reported hardware
/// identifiers.
///
/// The parts are canonicalized (trimmed, lowercased, sorted, deduplicated)
/// so that clients reporting the same identifiers in a different order
/// produce the same fingerprint. The server only ever compares the result
/// for equality.
pub fn fingerprint_from_parts<S: AsRef<str>>(parts: &[S]) -> String {
    let mut canonical: Vec<String> = parts
        .iter()
        .map(|p| p.as_ref().trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    canonical.sort();
    canonical.dedup();

    let mut hasher = Sha256::new();
    hasher.update(canonical.join("|").as_bytes());
    let hash = hasher.finalize();

    BASE64.encode(&hash[..16])
}
