//! Keyfort error types.
//!
//! Enforcement paths (`decrypt`, `is_enabled`, `activate`) fail closed:
//! a missing record or ambiguous state maps to a denial, never to a
//! permissive default.

use crate::model::LicenseStatus;
use thiserror::Error;

/// Errors that can occur in the license engine.
#[derive(Debug, Error)]
pub enum KeyfortError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or inconsistent input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No license exists for the given id or key.
    #[error("License not found")]
    LicenseNotFound,

    /// The license does not currently resolve to a usable status.
    #[error("License is not active (status: {status})")]
    LicenseNotActive {
        /// The status the license resolved to at evaluation time.
        status: LicenseStatus,
    },

    /// All activation slots for the license are occupied.
    #[error("Device limit exceeded ({max} activations)")]
    DeviceLimitExceeded {
        /// The license's activation capacity.
        max: u32,
    },

    /// The activation no longer exists or its license has been
    /// suspended or terminated.
    #[error("Activation has been revoked")]
    ActivationRevoked,

    /// Artifact authentication failed (wrong key, tampered ciphertext,
    /// or corrupted wrapped content key).
    #[error("Artifact integrity check failed")]
    IntegrityCheckFailed,

    /// A freed activation slot is still inside the reuse cooldown.
    #[error("Slot reuse rate-limited, retry in {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the cooldown expires.
        retry_after_secs: i64,
    },

    /// Cryptographic operation failed for a reason other than
    /// authentication (bad key length, nonce generation).
    #[error("Crypto error: {0}")]
    Crypto(String),
}
