//! Device activations and slot accounting.
//!
//! A license's capacity is a small reservation table: slots are counted
//! over activations seen within the offline allowance, so retired
//! devices free their slot automatically. All count-then-insert paths
//! for one license run under that license's slot mutex — two concurrent
//! `activate` calls can never both observe "slot available" and both
//! succeed.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::config::KeyfortConfig;
use crate::model::{
    Activation, ActivationId, LicenseId, LicenseStatus, UsageDelta, UsageStats,
};
use crate::registry::LicenseRegistry;
use crate::KeyfortError;

/// Manages device bindings for all licenses.
pub struct ActivationManager {
    activations: RwLock<HashMap<ActivationId, Activation>>,
    slot_locks: Mutex<HashMap<LicenseId, Arc<Mutex<()>>>>,
    registry: Arc<LicenseRegistry>,
    config: KeyfortConfig,
}

impl ActivationManager {
    /// Create an empty manager validating against `registry`.
    pub fn new(config: KeyfortConfig, registry: Arc<LicenseRegistry>) -> Self {
        Self {
            activations: RwLock::new(HashMap::new()),
            slot_locks: Mutex::new(HashMap::new()),
            registry,
            config,
        }
    }

    fn slot_lock(&self, license_id: LicenseId) -> Arc<Mutex<()>> {
        let mut locks = self.slot_locks.lock().expect("slot lock table poisoned");
        Arc::clone(locks.entry(license_id).or_default())
    }

    /// Bind a device to a license, claiming a capacity slot.
    ///
    /// Re-activating a fingerprint that already holds a slot refreshes
    /// the existing activation. A slot implicitly freed by staleness can
    /// only be claimed by a new device after the reuse cooldown.
    pub fn activate(
        &self,
        license_id: LicenseId,
        device_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Activation, KeyfortError> {
        if device_fingerprint.trim().is_empty() {
            return Err(KeyfortError::Validation(
                "device fingerprint cannot be empty".to_string(),
            ));
        }

        let status = self.registry.resolve_status(license_id, now)?;
        if !status.is_usable() {
            return Err(KeyfortError::LicenseNotActive { status });
        }
        let license = self.registry.get(license_id)?;

        // Serialize slot accounting for this license.
        let lock = self.slot_lock(license_id);
        let _guard = lock.lock().expect("slot lock poisoned");

        let allowance = self.config.offline_allowance;
        let cooldown = self.config.slot_reuse_cooldown;
        let mut activations = self.activations.write().expect("activation lock poisoned");

        // The same device refreshing its own binding is not a slot-cycling
        // event: it either still holds its slot or reclaims the one it
        // implicitly freed.
        let own = activations
            .values()
            .find(|a| {
                a.license_id == license_id
                    && a.released_at.is_none()
                    && a.device_fingerprint == device_fingerprint
            })
            .map(|a| a.id);

        let mut live = 0u32;
        let mut cooling = 0u32;
        let mut cooldown_until: Option<DateTime<Utc>> = None;
        for a in activations.values() {
            if a.license_id != license_id || a.released_at.is_some() || Some(a.id) == own {
                continue;
            }
            if a.holds_slot(now, allowance) {
                live += 1;
            } else {
                // Slot implicitly freed at last_heartbeat + allowance.
                let reusable_at = a.last_heartbeat_at + allowance + cooldown;
                if now < reusable_at {
                    cooling += 1;
                    cooldown_until =
                        Some(cooldown_until.map_or(reusable_at, |u| u.min(reusable_at)));
                }
            }
        }

        if let Some(own_id) = own {
            let own_holds = activations
                .get(&own_id)
                .map(|a| a.holds_slot(now, allowance))
                .unwrap_or(false);
            if !own_holds && live >= license.max_activations {
                // The device's old slot was claimed by someone else while
                // it was stale.
                return Err(KeyfortError::DeviceLimitExceeded {
                    max: license.max_activations,
                });
            }
            let a = activations.get_mut(&own_id).expect("own activation present");
            a.last_heartbeat_at = now;
            a.online = true;
            debug!(license_id = %license_id, activation_id = %own_id, "activation refreshed");
            return Ok(a.clone());
        }

        if live >= license.max_activations {
            return Err(KeyfortError::DeviceLimitExceeded {
                max: license.max_activations,
            });
        }
        if live + cooling >= license.max_activations {
            let until = cooldown_until.expect("cooling implies a deadline");
            return Err(KeyfortError::RateLimited {
                retry_after_secs: (until - now).num_seconds().max(1),
            });
        }

        let activation = Activation {
            id: Uuid::new_v4(),
            license_id,
            device_fingerprint: device_fingerprint.to_string(),
            first_activated_at: now,
            last_heartbeat_at: now,
            online: true,
            released_at: None,
            usage: UsageStats::default(),
        };
        debug!(license_id = %license_id, activation_id = %activation.id, "slot granted");
        activations.insert(activation.id, activation.clone());
        Ok(activation)
    }

    /// Record a device heartbeat: refresh liveness and merge usage
    /// counters.
    ///
    /// Fails with `ActivationRevoked` when the activation is gone,
    /// released, or its license has moved to Suspended/Terminated.
    pub fn heartbeat(
        &self,
        activation_id: ActivationId,
        usage_delta: &UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<Activation, KeyfortError> {
        let license_id = {
            let activations = self.activations.read().expect("activation lock poisoned");
            let a = activations
                .get(&activation_id)
                .filter(|a| a.released_at.is_none())
                .ok_or(KeyfortError::ActivationRevoked)?;
            a.license_id
        };

        let status = self.registry.resolve_status(license_id, now)?;
        if matches!(status, LicenseStatus::Suspended | LicenseStatus::Terminated) {
            return Err(KeyfortError::ActivationRevoked);
        }

        let mut activations = self.activations.write().expect("activation lock poisoned");
        let a = activations
            .get_mut(&activation_id)
            .filter(|a| a.released_at.is_none())
            .ok_or(KeyfortError::ActivationRevoked)?;

        // Last writer by timestamp: a sweep that raced us cannot push the
        // heartbeat time backwards.
        a.last_heartbeat_at = a.last_heartbeat_at.max(now);
        a.online = true;
        a.usage.merge(usage_delta, now);
        Ok(a.clone())
    }

    /// Explicitly release an activation, freeing its slot at once.
    /// Trusted more than inferred absence: no reuse cooldown applies.
    pub fn deactivate(
        &self,
        activation_id: ActivationId,
        now: DateTime<Utc>,
    ) -> Result<(), KeyfortError> {
        let mut activations = self.activations.write().expect("activation lock poisoned");
        let a = activations
            .get_mut(&activation_id)
            .ok_or(KeyfortError::ActivationRevoked)?;
        if a.released_at.is_none() {
            a.released_at = Some(now);
            a.online = false;
            debug!(license_id = %a.license_id, activation_id = %activation_id, "activation released");
        }
        Ok(())
    }

    /// Count of activations currently holding a slot for the license.
    pub fn live_count(&self, license_id: LicenseId, now: DateTime<Utc>) -> u32 {
        let activations = self.activations.read().expect("activation lock poisoned");
        activations
            .values()
            .filter(|a| a.license_id == license_id)
            .filter(|a| a.holds_slot(now, self.config.offline_allowance))
            .count() as u32
    }

    /// All unreleased activations for a license.
    pub fn for_license(&self, license_id: LicenseId) -> Vec<Activation> {
        let activations = self.activations.read().expect("activation lock poisoned");
        activations
            .values()
            .filter(|a| a.license_id == license_id && a.released_at.is_none())
            .cloned()
            .collect()
    }

    /// Snapshot of every unreleased activation. Used by the heartbeat
    /// sweep.
    pub(crate) fn all_unreleased(&self) -> Vec<Activation> {
        let activations = self.activations.read().expect("activation lock poisoned");
        activations
            .values()
            .filter(|a| a.released_at.is_none())
            .cloned()
            .collect()
    }

    /// Flip an activation offline if it is still stale at check time.
    ///
    /// Re-validates under the write lock so a heartbeat that landed after
    /// the sweep's snapshot wins (its timestamp is newer than the
    /// threshold).
    pub(crate) fn mark_offline_if_stale(
        &self,
        activation_id: ActivationId,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let mut activations = self.activations.write().expect("activation lock poisoned");
        match activations.get_mut(&activation_id) {
            Some(a)
                if a.released_at.is_none()
                    && a.online
                    && now - a.last_heartbeat_at > stale_after =>
            {
                a.online = false;
                true
            }
            _ => false,
        }
    }
}
