//! Append-only violation ledger.
//!
//! Records dedupe by `(license, kind, scope)` against the latest
//! unresolved entry, keeping the maximum severity seen — severity never
//! decreases automatically. Resolution marks a record closed but keeps
//! it; the ledger is the audit trail status derivation reads from.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::gate::OverrideStore;
use crate::model::{
    LicenseId, Resolution, Severity, Violation, ViolationId, ViolationKind, ViolationScope,
};
use crate::KeyfortError;

/// The violation engine: append-only detection/escalation ledger.
pub struct ViolationLedger {
    records: RwLock<Vec<Violation>>,
    overrides: Arc<OverrideStore>,
}

impl ViolationLedger {
    /// Create an empty ledger that escalates terminations into the given
    /// override store.
    pub fn new(overrides: Arc<OverrideStore>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            overrides,
        }
    }

    /// Record a violation, merging into the unresolved entry for the same
    /// `(license, kind, scope)` if one exists.
    ///
    /// A Termination-severity record synchronously pushes an all-features
    /// disable override for the license, so lockout does not wait for the
    /// next status read.
    pub fn record(
        &self,
        license_id: LicenseId,
        kind: ViolationKind,
        severity: Severity,
        scope: ViolationScope,
        action_taken: &str,
        now: DateTime<Utc>,
    ) -> Violation {
        let recorded = {
            let mut records = self.records.write().expect("ledger lock poisoned");

            let existing = records.iter_mut().find(|v| {
                v.license_id == license_id
                    && v.kind == kind
                    && v.scope == scope
                    && v.is_unresolved()
            });

            match existing {
                Some(v) => {
                    if severity > v.severity {
                        warn!(
                            license_id = %license_id, kind = ?kind, scope = ?scope,
                            from = ?v.severity, to = ?severity, "violation escalated"
                        );
                        v.severity = severity;
                        v.action_taken = action_taken.to_string();
                    }
                    v.clone()
                }
                None => {
                    warn!(
                        license_id = %license_id, kind = ?kind, scope = ?scope,
                        severity = ?severity, "violation recorded"
                    );
                    let v = Violation {
                        id: Uuid::new_v4(),
                        license_id,
                        kind,
                        severity,
                        scope,
                        detected_at: now,
                        resolved: None,
                        action_taken: action_taken.to_string(),
                    };
                    records.push(v.clone());
                    v
                }
            }
        };

        if recorded.severity == Severity::Termination {
            self.overrides
                .lockout(license_id, "termination violation", now);
        }

        recorded
    }

    /// Mark a violation resolved. The record stays in the ledger.
    pub fn resolve(
        &self,
        violation_id: ViolationId,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Violation, KeyfortError> {
        let mut records = self.records.write().expect("ledger lock poisoned");
        let v = records
            .iter_mut()
            .find(|v| v.id == violation_id)
            .ok_or_else(|| KeyfortError::Validation("unknown violation id".to_string()))?;
        if v.resolved.is_none() {
            v.resolved = Some(Resolution {
                resolved_at: now,
                note: note.to_string(),
            });
        }
        Ok(v.clone())
    }

    /// Whether an unresolved license-scoped violation of at least the
    /// given severity exists. Device-scoped violations are deliberately
    /// excluded: they never change license status.
    pub fn has_unresolved_license_scoped(&self, license_id: LicenseId, at_least: Severity) -> bool {
        let records = self.records.read().expect("ledger lock poisoned");
        records.iter().any(|v| {
            v.license_id == license_id
                && v.scope == ViolationScope::License
                && v.is_unresolved()
                && v.severity >= at_least
        })
    }

    /// Full history for a license, oldest first.
    pub fn history(&self, license_id: LicenseId) -> Vec<Violation> {
        let records = self.records.read().expect("ledger lock poisoned");
        records
            .iter()
            .filter(|v| v.license_id == license_id)
            .cloned()
            .collect()
    }

    /// The latest unresolved violation for a device, if any. Used by the
    /// heartbeat sweep to decide whether a device is already flagged.
    pub fn unresolved_for_device(
        &self,
        license_id: LicenseId,
        kind: ViolationKind,
        activation_id: crate::model::ActivationId,
    ) -> Option<Violation> {
        let records = self.records.read().expect("ledger lock poisoned");
        records
            .iter()
            .find(|v| {
                v.license_id == license_id
                    && v.kind == kind
                    && v.scope == ViolationScope::Device(activation_id)
                    && v.is_unresolved()
            })
            .cloned()
    }
}
