//! # Keyfort
//!
//! **License lifecycle engine with an envelope-encrypted artifact vault.**
//!
//! Keyfort grants time-bounded, device-bounded usage rights to a
//! distributable artifact (e.g. a packaged AI model), continuously
//! re-evaluates whether those rights still hold, and cryptographically
//! prevents use of the artifact once they do not.
//!
//! ## Design
//!
//! - **Derived status, not a stored flag** — a license's status is a pure
//!   function of its timestamps, the append-only violation ledger, and an
//!   explicit terminal override. There is no "active" bit to flip back.
//! - **Envelope encryption** — each artifact is sealed with its own
//!   content key; the content key is stored only wrapped under a
//!   key-encryption-key derived from the license and the server master
//!   secret. Decryption is structurally gated by a live license check.
//! - **Fail-closed enforcement** — decrypt and feature-gate decisions
//!   re-resolve status at call time with no caching; missing records and
//!   ambiguous state deny.
//! - **Race-free slot accounting** — device activations are reserved
//!   under per-license serialization, so concurrent activations can never
//!   exceed capacity.
//!
//! ## Quickstart
//!
//! ```
//! use keyfort::{ArtifactMetadata, KeyfortConfig, LicenseEngine, LicenseKind, MasterSecret};
//! use std::collections::BTreeSet;
//!
//! fn main() -> Result<(), keyfort::KeyfortError> {
//!     let engine = LicenseEngine::new(
//!         KeyfortConfig::default(),
//!         MasterSecret::new(*b"load me from your secret store.."),
//!     )?;
//!
//!     // Billing collaborator: issue on payment success.
//!     let features: BTreeSet<String> = ["inference".to_string()].into_iter().collect();
//!     let (license, key_token) = engine.issue("customer-42", LicenseKind::Annual, 3, features)?;
//!     println!("deliver this key once: {}", key_token.as_str());
//!
//!     // Device client: claim a slot.
//!     let activation = engine.activate(license.id, "opaque-device-fingerprint")?;
//!
//!     // Distribution pipeline: publish an encrypted artifact.
//!     let metadata = ArtifactMetadata {
//!         version: "1.0.0".to_string(),
//!         capabilities: vec!["text-generation".to_string()],
//!         original_size: 13,
//!     };
//!     let artifact = engine.encrypt_artifact(license.id, "model-v1", b"model weights", metadata)?;
//!
//!     // End-user runtime: decrypt only while the license resolves valid.
//!     let plaintext = engine.decrypt_artifact(license.id, artifact.id)?;
//!     assert_eq!(plaintext, b"model weights");
//!
//!     engine.deactivate(activation.id)?;
//!     Ok(())
//! }
//! ```
//!
//! ## What Keyfort does not do
//!
//! Keyfort is the enforcement core only. Payments, dashboards, and the
//! RPC transport in front of the engine are collaborators; the artifact
//! format inside the envelope is opaque. Client-side code that has
//! received plaintext can always keep it — the vault bounds *future*
//! decryptions, not copies already made.

#![deny(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Domain model
pub mod model;
pub mod token;

// Lifecycle components
pub mod activation;
pub mod monitor;
pub mod registry;
pub mod violation;

// Feature gating
pub mod gate;
pub mod meter;

// Artifact vault
pub mod crypto;
pub mod vault;

// Engine (main public API)
pub mod engine;

// Re-exports for public API
pub use clock::{Clock, SystemClock};
pub use config::KeyfortConfig;
pub use crypto::MasterSecret;
pub use engine::LicenseEngine;
pub use errors::KeyfortError;
pub use gate::{GateDecision, TierPolicy, TierTable};
pub use model::{
    Activation, ActivationId, ArtifactId, ArtifactMetadata, EncryptedArtifact, FeatureOverride,
    License, LicenseId, LicenseKind, LicenseStatus, OverrideScope, Severity, UsageDelta,
    Violation, ViolationId, ViolationKind, ViolationScope,
};
pub use monitor::{HeartbeatMonitor, SweepReport};
pub use token::{fingerprint_from_parts, KeyToken};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
