//! Core entity types: licenses, activations, violations, overrides,
//! encrypted artifacts.
//!
//! Status is deliberately absent from the persisted [`License`] record.
//! The only durable facts are timestamps, the violation ledger, and an
//! explicit terminal override; current status is derived from those on
//! every read (see `registry::resolve_status`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// License identifier.
pub type LicenseId = Uuid;
/// Activation identifier.
pub type ActivationId = Uuid;
/// Violation identifier.
pub type ViolationId = Uuid;
/// Artifact identifier.
pub type ArtifactId = Uuid;

/// Per-feature usage increments reported by a device heartbeat.
pub type UsageDelta = BTreeMap<String, u64>;

/// Subscription kind, which fixes the license duration at issue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseKind {
    /// Half-year subscription.
    Semester,
    /// One-year subscription.
    Annual,
    /// One-time purchase, never expires.
    Lifetime,
}

impl LicenseKind {
    /// Duration in days, or None for a license that never expires.
    pub fn duration_days(&self) -> Option<i64> {
        match self {
            Self::Semester => Some(182),
            Self::Annual => Some(365),
            Self::Lifetime => None,
        }
    }
}

/// Derived license status.
///
/// Ordered from fully usable to absorbing terminal; the derivation in the
/// registry only ever moves a license rightward through this lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    /// Unexpired (or lifetime) with no overriding violations.
    Active,
    /// Recently expired; still behaves as fully active.
    Grace,
    /// Past grace; reduced feature set per the post-expiry tier table.
    Restricted,
    /// An unresolved suspension-severity violation is in force.
    Suspended,
    /// Revoked, terminated by violation, or past the hard-shutdown
    /// window. Absorbing.
    Terminated,
}

impl LicenseStatus {
    /// Whether the license currently permits artifact decryption and
    /// new activations.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Active | Self::Grace)
    }
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Grace => "grace",
            Self::Restricted => "restricted",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A usage right over the licensed artifact and its gated features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    /// License ID (internal; never derivable from the key token).
    pub id: LicenseId,
    /// Owning account, as known to the billing collaborator.
    pub owner_id: String,
    /// Subscription kind.
    pub kind: LicenseKind,
    /// Issue timestamp.
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp; None for lifetime licenses.
    pub expires_at: Option<DateTime<Utc>>,
    /// Maximum concurrent device activations.
    pub max_activations: u32,
    /// Features enabled by default while Active or Grace.
    pub allowed_features: BTreeSet<String>,
    /// Explicit terminal override; set only by revoke. Absorbing: once
    /// set, status derivation returns it unconditionally.
    pub override_status: Option<LicenseStatus>,
    /// SHA-256 of the issued key token (hex). The raw token is returned
    /// once at issue time and never stored.
    pub key_hash: String,
}

/// A device's binding to a license, consuming one capacity slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    /// Activation ID.
    pub id: ActivationId,
    /// The bound license.
    pub license_id: LicenseId,
    /// Opaque device fingerprint (server never inspects it).
    pub device_fingerprint: String,
    /// When this device first activated.
    pub first_activated_at: DateTime<Utc>,
    /// Last successful heartbeat.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Whether the device is considered online. Derived by the sweep;
    /// set true by each heartbeat.
    pub online: bool,
    /// Explicit deactivation timestamp. Released activations are kept
    /// for audit but never counted against capacity.
    pub released_at: Option<DateTime<Utc>>,
    /// Additive per-feature counters, reset daily.
    pub usage: UsageStats,
}

impl Activation {
    /// Whether this activation still occupies a capacity slot: not
    /// explicitly released and heard from within the offline allowance.
    pub fn holds_slot(&self, now: DateTime<Utc>, offline_allowance: chrono::Duration) -> bool {
        self.released_at.is_none() && now - self.last_heartbeat_at <= offline_allowance
    }
}

/// Per-activation usage counters with daily rollover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// UTC date the daily counters belong to.
    pub day: Option<NaiveDate>,
    /// Current day's per-feature counts.
    pub daily: BTreeMap<String, u64>,
    /// Total count across all features since activation.
    pub lifetime: u64,
}

impl UsageStats {
    /// Merge a heartbeat's usage delta, rolling the daily counters over
    /// when the UTC date has changed.
    pub fn merge(&mut self, delta: &UsageDelta, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.daily.clear();
            self.day = Some(today);
        }
        for (feature, count) in delta {
            *self.daily.entry(feature.clone()).or_insert(0) += count;
            self.lifetime += count;
        }
    }
}

/// Violation severity. Never decreases automatically for a given
/// (license, kind, scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Observed and recorded; no status impact.
    Warning,
    /// Demotes the license to Suspended while unresolved.
    Suspension,
    /// Terminates the license and triggers synchronous lockout.
    Termination,
}

/// What was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A device exceeded heartbeat interval + grace without reporting.
    OfflineTooLong,
    /// Every device on the license is beyond the offline allowance.
    AllDevicesOffline,
    /// An artifact failed authentication during decrypt.
    IntegrityFailure,
}

/// Whether a violation is attributed to one device or the whole license.
///
/// Only license-scoped violations influence status derivation; one stale
/// device must not punish a license with other healthy devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationScope {
    /// Attributed to the license as a whole.
    License,
    /// Attributed to a single activation.
    Device(ActivationId),
}

/// Explicit resolution of a violation. The record itself is never erased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// When the violation was resolved.
    pub resolved_at: DateTime<Utc>,
    /// Operator-supplied note.
    pub note: String,
}

/// An entry in the append-only violation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Violation ID.
    pub id: ViolationId,
    /// The license this violation belongs to.
    pub license_id: LicenseId,
    /// What was detected.
    pub kind: ViolationKind,
    /// Maximum severity seen for this (license, kind, scope).
    pub severity: Severity,
    /// Device or license attribution.
    pub scope: ViolationScope,
    /// First detection time.
    pub detected_at: DateTime<Utc>,
    /// Explicit resolution, if any.
    pub resolved: Option<Resolution>,
    /// Enforcement action recorded alongside the detection.
    pub action_taken: String,
}

impl Violation {
    /// Whether the violation is still in force.
    pub fn is_unresolved(&self) -> bool {
        self.resolved.is_none()
    }
}

/// Which features an override applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    /// Every feature on the license (used by termination lockout).
    AllFeatures,
    /// A single named feature.
    Feature(String),
}

/// Explicit feature control layered on top of tier defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureOverride {
    /// The license the override applies to.
    pub license_id: LicenseId,
    /// Feature selection.
    pub scope: OverrideScope,
    /// Disable (false) always wins; enable (true) restores availability
    /// only within the status/tier bound.
    pub enabled: bool,
    /// Expiry of the override itself; None is indefinite.
    pub expires_at: Option<DateTime<Utc>>,
    /// Why the override exists.
    pub reason: String,
    /// When the override was created.
    pub created_at: DateTime<Utc>,
}

impl FeatureOverride {
    /// Whether the override is in force at `now`.
    pub fn in_force(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Artifact descriptive metadata, stored alongside the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Artifact version string.
    pub version: String,
    /// Capability tags the runtime may inspect before decrypting.
    pub capabilities: Vec<String>,
    /// Plaintext size in bytes.
    pub original_size: u64,
}

/// An envelope-encrypted artifact. Immutable after publish; the content
/// key exists only wrapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedArtifact {
    /// Artifact ID.
    pub id: ArtifactId,
    /// The license whose KEK wraps the content key.
    pub license_id: LicenseId,
    /// Human-readable artifact name.
    pub name: String,
    /// Content key wrapped under the license KEK
    /// (wrap nonce ‖ wrap ciphertext ‖ wrap tag).
    pub wrapped_content_key: Vec<u8>,
    /// AEAD nonce for the content ciphertext.
    pub nonce: [u8; 12],
    /// Content ciphertext (tag detached).
    pub ciphertext: Vec<u8>,
    /// Detached authentication tag over the ciphertext.
    pub integrity_tag: [u8; 16],
    /// Descriptive metadata.
    pub metadata: ArtifactMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn kind_durations() {
        assert_eq!(LicenseKind::Semester.duration_days(), Some(182));
        assert_eq!(LicenseKind::Annual.duration_days(), Some(365));
        assert_eq!(LicenseKind::Lifetime.duration_days(), None);
    }

    #[test]
    fn status_lattice_is_ordered() {
        assert!(LicenseStatus::Active < LicenseStatus::Grace);
        assert!(LicenseStatus::Grace < LicenseStatus::Restricted);
        assert!(LicenseStatus::Restricted < LicenseStatus::Suspended);
        assert!(LicenseStatus::Suspended < LicenseStatus::Terminated);
    }

    #[test]
    fn usable_statuses() {
        assert!(LicenseStatus::Active.is_usable());
        assert!(LicenseStatus::Grace.is_usable());
        assert!(!LicenseStatus::Restricted.is_usable());
        assert!(!LicenseStatus::Suspended.is_usable());
        assert!(!LicenseStatus::Terminated.is_usable());
    }

    #[test]
    fn usage_stats_merge_and_rollover() {
        let day1 = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let mut stats = UsageStats::default();

        let mut delta = UsageDelta::new();
        delta.insert("inference".to_string(), 3);
        stats.merge(&delta, day1);
        stats.merge(&delta, day1);
        assert_eq!(stats.daily.get("inference"), Some(&6));
        assert_eq!(stats.lifetime, 6);

        // Next day: daily resets, lifetime keeps counting.
        let day2 = Utc.with_ymd_and_hms(2025, 1, 16, 0, 30, 0).unwrap();
        stats.merge(&delta, day2);
        assert_eq!(stats.daily.get("inference"), Some(&3));
        assert_eq!(stats.lifetime, 9);
    }

    #[test]
    fn override_expiry() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let ov = FeatureOverride {
            license_id: Uuid::new_v4(),
            scope: OverrideScope::Feature("export".to_string()),
            enabled: false,
            expires_at: Some(now + chrono::Duration::hours(1)),
            reason: "abuse report".to_string(),
            created_at: now,
        };
        assert!(ov.in_force(now));
        assert!(!ov.in_force(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn slot_holding_window() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let mut act = Activation {
            id: Uuid::new_v4(),
            license_id: Uuid::new_v4(),
            device_fingerprint: "fp".to_string(),
            first_activated_at: now,
            last_heartbeat_at: now,
            online: true,
            released_at: None,
            usage: UsageStats::default(),
        };
        let allowance = chrono::Duration::days(7);

        assert!(act.holds_slot(now + chrono::Duration::days(6), allowance));
        assert!(!act.holds_slot(now + chrono::Duration::days(8), allowance));

        act.released_at = Some(now);
        assert!(!act.holds_slot(now, allowance));
    }
}
