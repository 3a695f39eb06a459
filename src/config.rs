//! Engine configuration.

use chrono::Duration;

use crate::gate::TierTable;

/// Timing windows and policy tables for the license engine.
///
/// All windows are measured against license expiry or the last heartbeat;
/// the engine never stores a precomputed deadline, it re-derives from
/// these windows on every evaluation.
#[derive(Debug, Clone)]
pub struct KeyfortConfig {
    /// Post-expiry period during which a license still behaves as fully
    /// active.
    pub grace_window: Duration,

    /// Post-expiry period (measured from expiry, not from the end of
    /// grace) after which a license is terminated outright.
    pub hard_shutdown_window: Duration,

    /// How long a silent device keeps occupying its activation slot.
    pub offline_allowance: Duration,

    /// Expected heartbeat cadence for device clients.
    pub heartbeat_interval: Duration,

    /// Slack past the heartbeat interval before a device is flagged
    /// offline.
    pub heartbeat_grace: Duration,

    /// Cooldown before a slot freed by staleness may be claimed by a new
    /// device. Explicit deactivation bypasses this.
    pub slot_reuse_cooldown: Duration,

    /// Feature policy for licenses in the Restricted status.
    pub post_expiry_tiers: TierTable,
}

impl Default for KeyfortConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::days(14),
            hard_shutdown_window: Duration::days(30),
            offline_allowance: Duration::days(7),
            heartbeat_interval: Duration::hours(24),
            heartbeat_grace: Duration::hours(72),
            slot_reuse_cooldown: Duration::hours(24),
            post_expiry_tiers: TierTable::default(),
        }
    }
}

impl KeyfortConfig {
    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), crate::KeyfortError> {
        if self.grace_window < Duration::zero() {
            return Err(crate::KeyfortError::Config(
                "grace_window cannot be negative".to_string(),
            ));
        }
        if self.hard_shutdown_window < self.grace_window {
            return Err(crate::KeyfortError::Config(format!(
                "hard_shutdown_window ({}) must not be shorter than grace_window ({})",
                self.hard_shutdown_window, self.grace_window
            )));
        }
        if self.offline_allowance <= self.heartbeat_interval + self.heartbeat_grace {
            // Otherwise a device would be escalated to Suspension before it
            // was ever flagged offline.
            return Err(crate::KeyfortError::Config(
                "offline_allowance must exceed heartbeat_interval + heartbeat_grace".to_string(),
            ));
        }
        if self.slot_reuse_cooldown < Duration::zero() {
            return Err(crate::KeyfortError::Config(
                "slot_reuse_cooldown cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}
