//! License Engine - the main public API for Keyfort.
//!
//! The `LicenseEngine` wires the registry, activation manager, heartbeat
//! monitor, violation ledger, feature gate, and artifact vault behind
//! one facade and injects the clock. Create one instance per process and
//! share it; every component is safe under concurrent callers.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::activation::ActivationManager;
use crate::clock::{Clock, SystemClock};
use crate::config::KeyfortConfig;
use crate::crypto::MasterSecret;
use crate::gate::{FeatureGate, GateDecision, OverrideStore};
use crate::model::{
    Activation, ActivationId, ArtifactId, ArtifactMetadata, EncryptedArtifact, FeatureOverride,
    License, LicenseId, LicenseKind, LicenseStatus, UsageDelta, Violation, ViolationId,
};
use crate::monitor::{HeartbeatMonitor, SweepReport};
use crate::registry::LicenseRegistry;
use crate::token::KeyToken;
use crate::vault::ArtifactVault;
use crate::violation::ViolationLedger;
use crate::KeyfortError;

/// The license lifecycle engine.
pub struct LicenseEngine {
    config: KeyfortConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<LicenseRegistry>,
    activations: Arc<ActivationManager>,
    monitor: Arc<HeartbeatMonitor>,
    ledger: Arc<ViolationLedger>,
    gate: FeatureGate,
    vault: ArtifactVault,
}

impl LicenseEngine {
    /// Create an engine with the given configuration and vault master
    /// secret, using the system clock.
    ///
    /// # Errors
    /// Returns an error if configuration validation fails.
    pub fn new(config: KeyfortConfig, master: MasterSecret) -> Result<Self, KeyfortError> {
        config.validate()?;
        Ok(Self::with_clock(config, master, Arc::new(SystemClock)))
    }

    /// Create an engine with a custom clock (for testing).
    #[cfg(any(test, feature = "test-seams"))]
    pub fn new_with_clock(
        config: KeyfortConfig,
        master: MasterSecret,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KeyfortError> {
        config.validate()?;
        Ok(Self::with_clock(config, master, clock))
    }

    fn with_clock(config: KeyfortConfig, master: MasterSecret, clock: Arc<dyn Clock>) -> Self {
        let overrides = Arc::new(OverrideStore::new());
        let ledger = Arc::new(ViolationLedger::new(Arc::clone(&overrides)));
        let registry = Arc::new(LicenseRegistry::new(config.clone(), Arc::clone(&ledger)));
        let activations = Arc::new(ActivationManager::new(
            config.clone(),
            Arc::clone(&registry),
        ));
        let monitor = Arc::new(HeartbeatMonitor::new(
            config.clone(),
            Arc::clone(&activations),
            Arc::clone(&ledger),
        ));
        let gate = FeatureGate::new(config.post_expiry_tiers.clone(), overrides);
        let vault = ArtifactVault::new(master, Arc::clone(&registry), Arc::clone(&ledger));

        Self {
            config,
            clock,
            registry,
            activations,
            monitor,
            ledger,
            gate,
            vault,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    // --- Billing collaborator -------------------------------------------

    /// Issue a new license. Returns the record and the one-time key
    /// token.
    pub fn issue(
        &self,
        owner_id: &str,
        kind: LicenseKind,
        max_activations: u32,
        allowed_features: BTreeSet<String>,
    ) -> Result<(License, KeyToken), KeyfortError> {
        self.registry
            .issue(owner_id, kind, max_activations, allowed_features, self.now())
    }

    /// Extend a license to a new expiry.
    pub fn renew(
        &self,
        license_id: LicenseId,
        new_expiry: DateTime<Utc>,
    ) -> Result<License, KeyfortError> {
        self.registry.renew(license_id, new_expiry)
    }

    /// Revoke a license. Absorbing; the license terminates immediately
    /// and permanently.
    pub fn revoke(&self, license_id: LicenseId, reason: &str) -> Result<License, KeyfortError> {
        self.registry.revoke(license_id, reason)
    }

    // --- Status and queries ---------------------------------------------

    /// Resolve a license's current status, derived fresh from durable
    /// facts.
    pub fn resolve_status(&self, license_id: LicenseId) -> Result<LicenseStatus, KeyfortError> {
        self.registry.resolve_status(license_id, self.now())
    }

    /// Fetch a license record by id.
    pub fn license(&self, license_id: LicenseId) -> Result<License, KeyfortError> {
        self.registry.get(license_id)
    }

    /// Look up a license by its key token.
    pub fn lookup_by_key(&self, token: &KeyToken) -> Result<License, KeyfortError> {
        self.registry.lookup_by_key(token)
    }

    /// Unreleased activations for a license.
    pub fn activations(&self, license_id: LicenseId) -> Vec<Activation> {
        self.activations.for_license(license_id)
    }

    /// Violation history for a license, resolved records included.
    pub fn violations(&self, license_id: LicenseId) -> Vec<Violation> {
        self.ledger.history(license_id)
    }

    // --- Device client --------------------------------------------------

    /// Bind a device to a license.
    pub fn activate(
        &self,
        license_id: LicenseId,
        device_fingerprint: &str,
    ) -> Result<Activation, KeyfortError> {
        self.activations
            .activate(license_id, device_fingerprint, self.now())
    }

    /// Record a device heartbeat and charge its usage deltas against the
    /// license's daily feature meters.
    pub fn heartbeat(
        &self,
        activation_id: ActivationId,
        usage_delta: &UsageDelta,
    ) -> Result<Activation, KeyfortError> {
        let now = self.now();
        let activation = self.activations.heartbeat(activation_id, usage_delta, now)?;
        for (feature, count) in usage_delta {
            self.gate
                .record_use(activation.license_id, feature, *count, now);
        }
        Ok(activation)
    }

    /// Release an activation immediately.
    pub fn deactivate(&self, activation_id: ActivationId) -> Result<(), KeyfortError> {
        self.activations.deactivate(activation_id, self.now())
    }

    // --- Operations console ---------------------------------------------

    /// Run one liveness sweep now. The periodic driver calls this on an
    /// interval; it is also safe to trigger manually.
    pub fn sweep(&self) -> SweepReport {
        self.monitor.sweep_at(self.now())
    }

    /// The heartbeat monitor, for spawning the periodic driver:
    ///
    /// ```no_run
    /// # use keyfort::{KeyfortConfig, LicenseEngine, MasterSecret};
    /// # let engine = LicenseEngine::new(KeyfortConfig::default(),
    /// #     MasterSecret::new(*b"example master secret bytes.....")).unwrap();
    /// let monitor = engine.monitor();
    /// let clock = engine.clock();
    /// tokio::spawn(async move {
    ///     monitor.run(clock, std::time::Duration::from_secs(24 * 60 * 60)).await;
    /// });
    /// ```
    pub fn monitor(&self) -> Arc<HeartbeatMonitor> {
        Arc::clone(&self.monitor)
    }

    /// The engine's clock.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Mark a violation resolved. The ledger keeps the record.
    pub fn resolve_violation(
        &self,
        violation_id: ViolationId,
        note: &str,
    ) -> Result<Violation, KeyfortError> {
        self.ledger.resolve(violation_id, note, self.now())
    }

    /// Record an explicit feature override.
    pub fn set_override(&self, ov: FeatureOverride) {
        self.gate.overrides().set(ov);
    }

    /// Overrides currently recorded for a license.
    pub fn overrides(&self, license_id: LicenseId) -> Vec<FeatureOverride> {
        self.gate.overrides().for_license(license_id)
    }

    // --- End-user runtime -----------------------------------------------

    /// Evaluate the feature gate for a license.
    pub fn is_enabled(
        &self,
        license_id: LicenseId,
        feature: &str,
    ) -> Result<GateDecision, KeyfortError> {
        let now = self.now();
        let license = self.registry.get(license_id)?;
        let status = self.registry.resolve_status(license_id, now)?;
        Ok(self.gate.evaluate(&license, status, feature, now))
    }

    /// Charge feature usage directly (for gated calls that bypass the
    /// heartbeat path).
    pub fn record_use(&self, license_id: LicenseId, feature: &str, n: u64) {
        self.gate.record_use(license_id, feature, n, self.now());
    }

    // --- Distribution pipeline ------------------------------------------

    /// Encrypt and publish an artifact bound to a license.
    pub fn encrypt_artifact(
        &self,
        license_id: LicenseId,
        name: &str,
        plaintext: &[u8],
        metadata: ArtifactMetadata,
    ) -> Result<EncryptedArtifact, KeyfortError> {
        self.vault.encrypt(license_id, name, plaintext, metadata)
    }

    /// Decrypt a published artifact. Enforcement point: the license is
    /// re-resolved at call time and nothing is cached.
    pub fn decrypt_artifact(
        &self,
        license_id: LicenseId,
        artifact_id: ArtifactId,
    ) -> Result<Vec<u8>, KeyfortError> {
        let artifact = self.vault.get(artifact_id)?;
        self.vault.decrypt(license_id, &artifact, self.now())
    }

    /// Re-wrap all artifact content keys under a new master secret.
    pub fn rotate_master_secret(&self, new_master: MasterSecret) -> Result<usize, KeyfortError> {
        self.vault.rotate_master_secret(new_master)
    }

    /// Get the current configuration.
    pub fn config(&self) -> &KeyfortConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::Duration;

    fn master() -> MasterSecret {
        MasterSecret::new(*b"engine unit test master secret..")
    }

    fn features() -> BTreeSet<String> {
        ["inference".to_string()].into_iter().collect()
    }

    fn engine_at(rfc3339: &str) -> LicenseEngine {
        LicenseEngine::new_with_clock(
            KeyfortConfig::default(),
            master(),
            Arc::new(MockClock::from_rfc3339(rfc3339)),
        )
        .unwrap()
    }

    #[test]
    fn engine_creation_validates_config() {
        let bad = KeyfortConfig {
            offline_allowance: Duration::hours(1),
            ..KeyfortConfig::default()
        };
        assert!(LicenseEngine::new(bad, master()).is_err());
        assert!(LicenseEngine::new(KeyfortConfig::default(), master()).is_ok());
    }

    #[test]
    fn issue_activate_gate_decrypt_happy_path() {
        let engine = engine_at("2025-01-01T00:00:00Z");

        let (license, token) = engine
            .issue("owner-1", LicenseKind::Annual, 2, features())
            .unwrap();
        assert_eq!(engine.lookup_by_key(&token).unwrap().id, license.id);
        assert_eq!(
            engine.resolve_status(license.id).unwrap(),
            LicenseStatus::Active
        );

        let activation = engine.activate(license.id, "device-a").unwrap();
        let mut delta = UsageDelta::new();
        delta.insert("inference".to_string(), 2);
        engine.heartbeat(activation.id, &delta).unwrap();

        let decision = engine.is_enabled(license.id, "inference").unwrap();
        assert!(decision.enabled);

        let metadata = ArtifactMetadata {
            version: "1.0.0".to_string(),
            capabilities: vec![],
            original_size: 7,
        };
        let artifact = engine
            .encrypt_artifact(license.id, "model", b"weights", metadata)
            .unwrap();
        let plaintext = engine.decrypt_artifact(license.id, artifact.id).unwrap();
        assert_eq!(plaintext, b"weights");
    }

    #[test]
    fn heartbeat_charges_the_daily_meter() {
        let engine = engine_at("2026-06-01T12:00:00Z");
        let (license, _) = engine
            .issue("owner-1", LicenseKind::Annual, 1, features())
            .unwrap();
        let activation = engine.activate(license.id, "device-a").unwrap();

        // Back-date expiry into the Restricted window, where the basic
        // tier caps inference at 25/day.
        let now = engine.clock().now_utc();
        engine.renew(license.id, now - Duration::days(20)).unwrap();
        assert_eq!(
            engine.resolve_status(license.id).unwrap(),
            LicenseStatus::Restricted
        );

        let mut delta = UsageDelta::new();
        delta.insert("inference".to_string(), 25);
        engine.heartbeat(activation.id, &delta).unwrap();

        let decision = engine.is_enabled(license.id, "inference").unwrap();
        assert!(!decision.enabled, "heartbeat usage must exhaust the tier quota");
        assert_eq!(decision.remaining_quota, Some(0));
    }

    #[test]
    fn unknown_license_fails_closed_everywhere() {
        let engine = engine_at("2025-01-01T00:00:00Z");
        let id = uuid::Uuid::new_v4();

        assert!(matches!(
            engine.resolve_status(id),
            Err(KeyfortError::LicenseNotFound)
        ));
        assert!(matches!(
            engine.is_enabled(id, "inference"),
            Err(KeyfortError::LicenseNotFound)
        ));
        assert!(matches!(
            engine.activate(id, "device-a"),
            Err(KeyfortError::LicenseNotFound)
        ));
    }
}
