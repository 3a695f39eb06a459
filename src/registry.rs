//! Authoritative license records and derived status.
//!
//! Status is never stored. The registry persists timestamps, the key
//! hash, and an explicit terminal override; `resolve_status` re-derives
//! the current status from those facts plus the violation ledger on
//! every call. Flipping a stored "active" bit back is therefore not a
//! meaningful attack: there is no such bit.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::KeyfortConfig;
use crate::model::{License, LicenseId, LicenseKind, LicenseStatus, Severity};
use crate::token::KeyToken;
use crate::violation::ViolationLedger;
use crate::KeyfortError;

/// Registry of issued licenses.
pub struct LicenseRegistry {
    licenses: RwLock<HashMap<LicenseId, License>>,
    by_key_hash: RwLock<HashMap<String, LicenseId>>,
    ledger: Arc<ViolationLedger>,
    config: KeyfortConfig,
}

impl LicenseRegistry {
    /// Create an empty registry reading violations from `ledger`.
    pub fn new(config: KeyfortConfig, ledger: Arc<ViolationLedger>) -> Self {
        Self {
            licenses: RwLock::new(HashMap::new()),
            by_key_hash: RwLock::new(HashMap::new()),
            ledger,
            config,
        }
    }

    /// Issue a new license.
    ///
    /// Returns the license record and the key token. The raw token is
    /// not retained; deliver it to the owner now or never.
    pub fn issue(
        &self,
        owner_id: &str,
        kind: LicenseKind,
        max_activations: u32,
        allowed_features: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<(License, KeyToken), KeyfortError> {
        if owner_id.trim().is_empty() {
            return Err(KeyfortError::Validation("owner_id cannot be empty".to_string()));
        }
        if max_activations == 0 {
            return Err(KeyfortError::Validation(
                "max_activations must be at least 1".to_string(),
            ));
        }

        let token = KeyToken::generate();
        let license = License {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            kind,
            issued_at: now,
            expires_at: kind.duration_days().map(|d| now + chrono::Duration::days(d)),
            max_activations,
            allowed_features,
            override_status: None,
            key_hash: token.hash(),
        };

        debug!(license_id = %license.id, ?kind, max_activations, "license issued");

        self.by_key_hash
            .write()
            .expect("registry lock poisoned")
            .insert(license.key_hash.clone(), license.id);
        self.licenses
            .write()
            .expect("registry lock poisoned")
            .insert(license.id, license.clone());

        Ok((license, token))
    }

    /// Extend a license to a new expiry (billing collaborator, on
    /// payment success).
    pub fn renew(
        &self,
        license_id: LicenseId,
        new_expiry: DateTime<Utc>,
    ) -> Result<License, KeyfortError> {
        let mut licenses = self.licenses.write().expect("registry lock poisoned");
        let license = licenses
            .get_mut(&license_id)
            .ok_or(KeyfortError::LicenseNotFound)?;

        if license.override_status.is_some() {
            // Revocation is absorbing; a renewal cannot resurrect it.
            return Err(KeyfortError::Validation(
                "cannot renew a revoked license".to_string(),
            ));
        }
        if license.kind == LicenseKind::Lifetime {
            return Err(KeyfortError::Validation(
                "lifetime licenses do not renew".to_string(),
            ));
        }

        license.expires_at = Some(new_expiry);
        debug!(license_id = %license_id, %new_expiry, "license renewed");
        Ok(license.clone())
    }

    /// Revoke a license (billing collaborator on chargeback/refund, or
    /// operator action). Sets the absorbing Terminated override.
    pub fn revoke(
        &self,
        license_id: LicenseId,
        reason: &str,
    ) -> Result<License, KeyfortError> {
        let mut licenses = self.licenses.write().expect("registry lock poisoned");
        let license = licenses
            .get_mut(&license_id)
            .ok_or(KeyfortError::LicenseNotFound)?;

        license.override_status = Some(LicenseStatus::Terminated);
        warn!(license_id = %license_id, reason, "license revoked");
        Ok(license.clone())
    }

    /// Resolve the license's status at `now`.
    ///
    /// Pure over durable facts: calling twice with no intervening writes
    /// returns identical results. Never memoized — callers on the
    /// enforcement path depend on a fresh answer.
    pub fn resolve_status(
        &self,
        license_id: LicenseId,
        now: DateTime<Utc>,
    ) -> Result<LicenseStatus, KeyfortError> {
        let licenses = self.licenses.read().expect("registry lock poisoned");
        let license = licenses
            .get(&license_id)
            .ok_or(KeyfortError::LicenseNotFound)?;
        Ok(self.derive(license, now))
    }

    fn derive(&self, license: &License, now: DateTime<Utc>) -> LicenseStatus {
        // Explicit revoke always wins.
        if let Some(status) = license.override_status {
            return status;
        }

        // A recorded termination-severity violation is terminal
        // regardless of expiry.
        if self
            .ledger
            .has_unresolved_license_scoped(license.id, Severity::Termination)
        {
            return LicenseStatus::Terminated;
        }

        let bucket = match license.expires_at {
            None => LicenseStatus::Active,
            Some(expires_at) if now < expires_at => LicenseStatus::Active,
            Some(expires_at) => {
                let past = now - expires_at;
                if past <= self.config.grace_window {
                    LicenseStatus::Grace
                } else if past <= self.config.hard_shutdown_window {
                    LicenseStatus::Restricted
                } else {
                    LicenseStatus::Terminated
                }
            }
        };
        if bucket == LicenseStatus::Terminated {
            return bucket;
        }

        // An unresolved suspension demotes any still-live bucket. Only
        // license-scoped violations count; one stale device must not
        // suspend a license with healthy siblings.
        if self
            .ledger
            .has_unresolved_license_scoped(license.id, Severity::Suspension)
        {
            return LicenseStatus::Suspended;
        }

        bucket
    }

    /// Fetch a license record by id.
    pub fn get(&self, license_id: LicenseId) -> Result<License, KeyfortError> {
        let licenses = self.licenses.read().expect("registry lock poisoned");
        licenses
            .get(&license_id)
            .cloned()
            .ok_or(KeyfortError::LicenseNotFound)
    }

    /// Look up a license by its key token (hash-indexed; the raw token
    /// is never stored).
    pub fn lookup_by_key(&self, token: &KeyToken) -> Result<License, KeyfortError> {
        let id = {
            let index = self.by_key_hash.read().expect("registry lock poisoned");
            index.get(&token.hash()).copied()
        };
        match id {
            Some(id) => self.get(id),
            None => Err(KeyfortError::LicenseNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::OverrideStore;
    use crate::model::{ViolationKind, ViolationScope};
    use chrono::TimeZone;

    fn registry() -> (LicenseRegistry, Arc<ViolationLedger>) {
        let ledger = Arc::new(ViolationLedger::new(Arc::new(OverrideStore::new())));
        (
            LicenseRegistry::new(KeyfortConfig::default(), Arc::clone(&ledger)),
            ledger,
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn features() -> BTreeSet<String> {
        ["inference".to_string()].into_iter().collect()
    }

    #[test]
    fn issue_returns_token_and_indexes_hash() {
        let (registry, _) = registry();
        let (license, token) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();

        assert_eq!(license.key_hash, token.hash());
        assert_eq!(
            registry.lookup_by_key(&token).unwrap().id,
            license.id
        );
        assert_eq!(
            license.expires_at,
            Some(t0() + chrono::Duration::days(365))
        );
    }

    #[test]
    fn issue_rejects_zero_capacity() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.issue("owner-1", LicenseKind::Annual, 0, features(), t0()),
            Err(KeyfortError::Validation(_))
        ));
    }

    #[test]
    fn lifetime_never_expires() {
        let (registry, _) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Lifetime, 1, features(), t0())
            .unwrap();
        assert_eq!(license.expires_at, None);

        let far_future = t0() + chrono::Duration::days(10_000);
        assert_eq!(
            registry.resolve_status(license.id, far_future).unwrap(),
            LicenseStatus::Active
        );
    }

    #[test]
    fn status_buckets_over_time() {
        let (registry, _) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();
        let expiry = t0() + chrono::Duration::days(365);

        let cases = [
            (expiry - chrono::Duration::days(1), LicenseStatus::Active),
            (expiry + chrono::Duration::days(5), LicenseStatus::Grace),
            (expiry + chrono::Duration::days(14), LicenseStatus::Grace),
            (expiry + chrono::Duration::days(20), LicenseStatus::Restricted),
            (expiry + chrono::Duration::days(30), LicenseStatus::Restricted),
            (expiry + chrono::Duration::days(35), LicenseStatus::Terminated),
        ];
        for (now, expected) in cases {
            assert_eq!(
                registry.resolve_status(license.id, now).unwrap(),
                expected,
                "at {now}"
            );
        }
    }

    #[test]
    fn resolve_status_is_idempotent() {
        let (registry, _) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Semester, 2, features(), t0())
            .unwrap();
        let now = t0() + chrono::Duration::days(190);

        let first = registry.resolve_status(license.id, now).unwrap();
        let second = registry.resolve_status(license.id, now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn revoke_is_absorbing() {
        let (registry, _) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();

        registry.revoke(license.id, "chargeback").unwrap();
        assert_eq!(
            registry.resolve_status(license.id, t0()).unwrap(),
            LicenseStatus::Terminated
        );

        // Renewal cannot resurrect a revoked license.
        assert!(registry
            .renew(license.id, t0() + chrono::Duration::days(730))
            .is_err());
    }

    #[test]
    fn renew_extends_expiry() {
        let (registry, _) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();

        let new_expiry = t0() + chrono::Duration::days(730);
        registry.renew(license.id, new_expiry).unwrap();

        let now = t0() + chrono::Duration::days(400);
        assert_eq!(
            registry.resolve_status(license.id, now).unwrap(),
            LicenseStatus::Active
        );
    }

    #[test]
    fn suspension_violation_demotes_live_statuses() {
        let (registry, ledger) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();

        ledger.record(
            license.id,
            ViolationKind::AllDevicesOffline,
            Severity::Suspension,
            ViolationScope::License,
            "all devices silent",
            t0(),
        );

        assert_eq!(
            registry.resolve_status(license.id, t0()).unwrap(),
            LicenseStatus::Suspended
        );

        // Past the hard-shutdown window, time wins: Terminated.
        let late = t0() + chrono::Duration::days(365 + 31);
        assert_eq!(
            registry.resolve_status(license.id, late).unwrap(),
            LicenseStatus::Terminated
        );
    }

    #[test]
    fn device_scoped_violation_leaves_status_alone() {
        let (registry, ledger) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();

        ledger.record(
            license.id,
            ViolationKind::OfflineTooLong,
            Severity::Suspension,
            ViolationScope::Device(Uuid::new_v4()),
            "slot released",
            t0(),
        );

        assert_eq!(
            registry.resolve_status(license.id, t0()).unwrap(),
            LicenseStatus::Active
        );
    }

    #[test]
    fn termination_violation_terminates_even_when_unexpired() {
        let (registry, ledger) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();

        ledger.record(
            license.id,
            ViolationKind::IntegrityFailure,
            Severity::Termination,
            ViolationScope::License,
            "license locked out",
            t0(),
        );

        assert_eq!(
            registry.resolve_status(license.id, t0()).unwrap(),
            LicenseStatus::Terminated
        );
    }

    #[test]
    fn resolving_violation_restores_derived_status() {
        let (registry, ledger) = registry();
        let (license, _) = registry
            .issue("owner-1", LicenseKind::Annual, 3, features(), t0())
            .unwrap();

        let v = ledger.record(
            license.id,
            ViolationKind::AllDevicesOffline,
            Severity::Suspension,
            ViolationScope::License,
            "all devices silent",
            t0(),
        );
        assert_eq!(
            registry.resolve_status(license.id, t0()).unwrap(),
            LicenseStatus::Suspended
        );

        ledger.resolve(v.id, "devices recovered", t0()).unwrap();
        assert_eq!(
            registry.resolve_status(license.id, t0()).unwrap(),
            LicenseStatus::Active
        );
    }

    #[test]
    fn unknown_license_is_not_found() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.resolve_status(Uuid::new_v4(), t0()),
            Err(KeyfortError::LicenseNotFound)
        ));
    }
}
