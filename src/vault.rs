//! Envelope-encrypted artifact storage bound to license status.
//!
//! Decryption is the enforcement point: every call re-resolves the bound
//! license's status before touching key material, and nothing on this
//! path is cached. A stale "was valid" answer is worse than a transient
//! failure, so ambiguity of any kind fails closed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::{open_detached, seal_detached, unwrap_key, wrap_key, ContentKey, MasterSecret};
use crate::model::{
    ArtifactId, ArtifactMetadata, EncryptedArtifact, LicenseId, Severity, ViolationKind,
    ViolationScope,
};
use crate::registry::LicenseRegistry;
use crate::violation::ViolationLedger;
use crate::KeyfortError;

/// Vault of published artifacts.
pub struct ArtifactVault {
    artifacts: RwLock<HashMap<ArtifactId, EncryptedArtifact>>,
    master: RwLock<MasterSecret>,
    registry: Arc<LicenseRegistry>,
    ledger: Arc<ViolationLedger>,
}

impl ArtifactVault {
    /// Create an empty vault keyed by `master`.
    pub fn new(
        master: MasterSecret,
        registry: Arc<LicenseRegistry>,
        ledger: Arc<ViolationLedger>,
    ) -> Self {
        Self {
            artifacts: RwLock::new(HashMap::new()),
            master: RwLock::new(master),
            registry,
            ledger,
        }
    }

    /// Encrypt and publish an artifact for a license.
    ///
    /// Generates a per-artifact content key, seals the payload, wraps
    /// the key under the license KEK, and stores only the wrapped form.
    /// The unwrapped content key never leaves this function.
    pub fn encrypt(
        &self,
        license_id: LicenseId,
        name: &str,
        plaintext: &[u8],
        metadata: ArtifactMetadata,
    ) -> Result<EncryptedArtifact, KeyfortError> {
        // Publishing against an unknown license is a pipeline bug.
        self.registry.get(license_id)?;
        if name.trim().is_empty() {
            return Err(KeyfortError::Validation("artifact name cannot be empty".to_string()));
        }

        let content_key = ContentKey::generate();
        let (nonce, ciphertext, integrity_tag) = seal_detached(&content_key, plaintext)?;

        let kek = self
            .master
            .read()
            .expect("master secret lock poisoned")
            .derive_kek(license_id);
        let wrapped_content_key = wrap_key(&kek, &content_key)?;

        let artifact = EncryptedArtifact {
            id: Uuid::new_v4(),
            license_id,
            name: name.to_string(),
            wrapped_content_key,
            nonce,
            ciphertext,
            integrity_tag,
            metadata,
        };

        debug!(artifact_id = %artifact.id, license_id = %license_id, name, "artifact published");
        self.artifacts
            .write()
            .expect("artifact lock poisoned")
            .insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    /// Decrypt an artifact record, enforcing the license at call time.
    ///
    /// Fails closed with `LicenseNotActive` before any cryptographic
    /// work when the freshly resolved status is not Active or Grace.
    /// Authentication failures return `IntegrityCheckFailed` and record
    /// an integrity violation; the plaintext is never persisted.
    pub fn decrypt(
        &self,
        license_id: LicenseId,
        artifact: &EncryptedArtifact,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, KeyfortError> {
        if artifact.license_id != license_id {
            return Err(KeyfortError::Validation(
                "artifact is not bound to this license".to_string(),
            ));
        }

        // Enforcement: fresh status, no cache, before any key handling.
        let status = self.registry.resolve_status(license_id, now)?;
        if !status.is_usable() {
            return Err(KeyfortError::LicenseNotActive { status });
        }

        let kek = self
            .master
            .read()
            .expect("master secret lock poisoned")
            .derive_kek(license_id);

        let plaintext = unwrap_key(&kek, &artifact.wrapped_content_key)
            .and_then(|content_key| {
                open_detached(
                    &content_key,
                    &artifact.nonce,
                    &artifact.ciphertext,
                    &artifact.integrity_tag,
                )
            })
            .map_err(|e| {
                warn!(artifact_id = %artifact.id, license_id = %license_id, "artifact failed authentication");
                self.ledger.record(
                    license_id,
                    ViolationKind::IntegrityFailure,
                    Severity::Warning,
                    ViolationScope::License,
                    "decrypt denied",
                    now,
                );
                e
            })?;

        Ok(plaintext)
    }

    /// Re-wrap every artifact's content key under a new master secret.
    ///
    /// Explicit maintenance pass; nothing rotates implicitly. Either all
    /// artifacts re-wrap or the vault is left untouched.
    pub fn rotate_master_secret(&self, new_master: MasterSecret) -> Result<usize, KeyfortError> {
        let mut master = self.master.write().expect("master secret lock poisoned");
        let mut artifacts = self.artifacts.write().expect("artifact lock poisoned");

        let mut rewrapped: Vec<(ArtifactId, Vec<u8>)> = Vec::with_capacity(artifacts.len());
        for artifact in artifacts.values() {
            let old_kek = master.derive_kek(artifact.license_id);
            let content_key = unwrap_key(&old_kek, &artifact.wrapped_content_key)?;
            let new_kek = new_master.derive_kek(artifact.license_id);
            rewrapped.push((artifact.id, wrap_key(&new_kek, &content_key)?));
        }

        let count = rewrapped.len();
        for (id, wrapped) in rewrapped {
            if let Some(artifact) = artifacts.get_mut(&id) {
                artifact.wrapped_content_key = wrapped;
            }
        }
        *master = new_master;

        debug!(count, "master secret rotated");
        Ok(count)
    }

    /// Fetch a published artifact record (ciphertext form).
    pub fn get(&self, artifact_id: ArtifactId) -> Result<EncryptedArtifact, KeyfortError> {
        let artifacts = self.artifacts.read().expect("artifact lock poisoned");
        artifacts
            .get(&artifact_id)
            .cloned()
            .ok_or_else(|| KeyfortError::Validation("unknown artifact".to_string()))
    }
}
