//! Layered feature gating.
//!
//! A gate decision is computed in three strictly ordered layers:
//! 1. License status — Active/Grace use the license's allowed features;
//!    Restricted consults the post-expiry tier table; Suspended and
//!    Terminated disable everything and stop the evaluation.
//! 2. Explicit overrides — a disable always wins; an enable restores
//!    availability only within the layer-1 bound.
//! 3. Daily quota — a tier `daily_limit` denies once exhausted,
//!    regardless of layers 1–2.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::meter::UsageMeter;
use crate::model::{FeatureOverride, License, LicenseId, LicenseStatus, OverrideScope};

/// Per-feature policy for licenses in the Restricted status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Whether the feature remains available at all.
    pub enabled: bool,
    /// Uses per UTC day, if capped.
    pub daily_limit: Option<u64>,
}

/// The reduced feature set served after grace expires.
///
/// Features absent from the table are disabled under Restricted.
#[derive(Debug, Clone)]
pub struct TierTable {
    features: BTreeMap<String, TierPolicy>,
}

/// Default post-expiry policy: metered core capabilities, no data
/// egress.
static BASIC_TIER: Lazy<BTreeMap<String, TierPolicy>> = Lazy::new(|| {
    let mut t = BTreeMap::new();
    t.insert(
        "inference".to_string(),
        TierPolicy {
            enabled: true,
            daily_limit: Some(25),
        },
    );
    t.insert(
        "embedding".to_string(),
        TierPolicy {
            enabled: true,
            daily_limit: Some(100),
        },
    );
    t.insert(
        "export".to_string(),
        TierPolicy {
            enabled: false,
            daily_limit: None,
        },
    );
    t
});

impl Default for TierTable {
    fn default() -> Self {
        Self {
            features: BASIC_TIER.clone(),
        }
    }
}

impl TierTable {
    /// An empty table: every feature disabled under Restricted.
    pub fn empty() -> Self {
        Self {
            features: BTreeMap::new(),
        }
    }

    /// Add or replace a feature policy.
    pub fn with_policy(mut self, feature: &str, policy: TierPolicy) -> Self {
        self.features.insert(feature.to_string(), policy);
        self
    }

    /// Look up the policy for a feature.
    pub fn policy(&self, feature: &str) -> Option<TierPolicy> {
        self.features.get(feature).copied()
    }
}

/// Store of explicit feature overrides, layered on tier defaults.
#[derive(Debug, Default)]
pub struct OverrideStore {
    by_license: RwLock<HashMap<LicenseId, Vec<FeatureOverride>>>,
}

impl OverrideStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an override. Later overrides for the same scope replace
    /// earlier ones.
    pub fn set(&self, ov: FeatureOverride) {
        let mut map = self.by_license.write().expect("override lock poisoned");
        let entries = map.entry(ov.license_id).or_default();
        entries.retain(|existing| existing.scope != ov.scope);
        entries.push(ov);
    }

    /// Disable every feature on the license. Used by the violation
    /// engine's synchronous termination escalation.
    pub fn lockout(&self, license_id: LicenseId, reason: &str, now: DateTime<Utc>) {
        self.set(FeatureOverride {
            license_id,
            scope: OverrideScope::AllFeatures,
            enabled: false,
            expires_at: None,
            reason: reason.to_string(),
            created_at: now,
        });
    }

    /// Overrides in force for a feature at `now`, all-features entries
    /// included.
    fn in_force_for(&self, license_id: LicenseId, feature: &str, now: DateTime<Utc>) -> Vec<FeatureOverride> {
        let map = self.by_license.read().expect("override lock poisoned");
        map.get(&license_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|ov| ov.in_force(now))
                    .filter(|ov| match &ov.scope {
                        OverrideScope::AllFeatures => true,
                        OverrideScope::Feature(name) => name == feature,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All overrides currently recorded for a license.
    pub fn for_license(&self, license_id: LicenseId) -> Vec<FeatureOverride> {
        let map = self.by_license.read().expect("override lock poisoned");
        map.get(&license_id).cloned().unwrap_or_default()
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    /// Whether the feature may be used right now.
    pub enabled: bool,
    /// Remaining daily quota, when a tier limit applies. None means
    /// unmetered.
    pub remaining_quota: Option<u64>,
}

impl GateDecision {
    fn denied() -> Self {
        Self {
            enabled: false,
            remaining_quota: None,
        }
    }
}

/// The layered decision function. Owns the override store and the daily
/// meter; status comes in from the registry on every call.
pub struct FeatureGate {
    tiers: TierTable,
    overrides: Arc<OverrideStore>,
    meter: UsageMeter,
}

impl FeatureGate {
    /// Create a gate over the given tier table and override store.
    pub fn new(tiers: TierTable, overrides: Arc<OverrideStore>) -> Self {
        Self {
            tiers,
            overrides,
            meter: UsageMeter::new(),
        }
    }

    /// Evaluate the gate for one feature.
    ///
    /// `status` must be freshly resolved by the caller; the gate never
    /// caches or re-derives it.
    pub fn evaluate(
        &self,
        license: &License,
        status: LicenseStatus,
        feature: &str,
        now: DateTime<Utc>,
    ) -> GateDecision {
        // Layer 1: status bound.
        let (default_enabled, daily_limit) = match status {
            LicenseStatus::Suspended | LicenseStatus::Terminated => {
                // No further layers consulted.
                return GateDecision::denied();
            }
            LicenseStatus::Active | LicenseStatus::Grace => {
                (license.allowed_features.contains(feature), None)
            }
            LicenseStatus::Restricted => match self.tiers.policy(feature) {
                Some(policy) => (policy.enabled, policy.daily_limit),
                None => (false, None),
            },
        };

        // Layer 2: explicit overrides. A disable always wins; an enable
        // restores availability but cannot lift the tier limit.
        let overrides = self.overrides.in_force_for(license.id, feature, now);
        let mut enabled = default_enabled;
        if overrides.iter().any(|ov| !ov.enabled) {
            enabled = false;
        } else if overrides.iter().any(|ov| ov.enabled) {
            enabled = true;
        }

        if !enabled {
            return GateDecision {
                enabled: false,
                remaining_quota: daily_limit,
            };
        }

        // Layer 3: daily quota.
        match daily_limit {
            Some(limit) => {
                let used = self.meter.used_today(license.id, feature, now);
                let remaining = limit.saturating_sub(used);
                if remaining == 0 {
                    debug!(license_id = %license.id, feature, limit, "daily quota exhausted");
                }
                GateDecision {
                    enabled: remaining > 0,
                    remaining_quota: Some(remaining),
                }
            }
            None => GateDecision {
                enabled: true,
                remaining_quota: None,
            },
        }
    }

    /// Charge usage against the feature's daily counter.
    pub fn record_use(&self, license_id: LicenseId, feature: &str, n: u64, now: DateTime<Utc>) {
        self.meter.record_use(license_id, feature, n, now);
    }

    /// The override store this gate consults.
    pub fn overrides(&self) -> &Arc<OverrideStore> {
        &self.overrides
    }
}
