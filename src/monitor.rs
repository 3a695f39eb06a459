//! Heartbeat liveness sweep.
//!
//! The sweep walks all unreleased activations, flags devices that went
//! silent, escalates to device-scoped suspension once the offline
//! allowance is exceeded, and records a license-level suspension when
//! every device on a license is beyond the allowance. Re-running the
//! sweep with no time passed records nothing new: the ledger's dedupe
//! and the `online` flag make it idempotent.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::activation::ActivationManager;
use crate::clock::Clock;
use crate::config::KeyfortConfig;
use crate::model::{Activation, LicenseId, Severity, ViolationKind, ViolationScope};
use crate::violation::ViolationLedger;

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices newly flagged offline this pass.
    pub flagged_offline: usize,
    /// Device violations newly escalated to suspension severity.
    pub escalated: usize,
    /// Licenses newly recorded with every device beyond the allowance.
    pub licenses_all_offline: usize,
}

/// Periodic liveness monitor over all activations.
pub struct HeartbeatMonitor {
    activations: Arc<ActivationManager>,
    ledger: Arc<ViolationLedger>,
    config: KeyfortConfig,
}

impl HeartbeatMonitor {
    /// Create a monitor over the given activation table and ledger.
    pub fn new(
        config: KeyfortConfig,
        activations: Arc<ActivationManager>,
        ledger: Arc<ViolationLedger>,
    ) -> Self {
        Self {
            activations,
            ledger,
            config,
        }
    }

    /// Run one sweep pass at `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let offline_after = self.config.heartbeat_interval + self.config.heartbeat_grace;
        let allowance = self.config.offline_allowance;
        let mut report = SweepReport::default();
        let mut by_license: HashMap<LicenseId, Vec<Activation>> = HashMap::new();

        for activation in self.activations.all_unreleased() {
            let elapsed = now - activation.last_heartbeat_at;

            if elapsed > offline_after
                && self
                    .activations
                    .mark_offline_if_stale(activation.id, offline_after, now)
            {
                report.flagged_offline += 1;
                self.ledger.record(
                    activation.license_id,
                    ViolationKind::OfflineTooLong,
                    Severity::Warning,
                    ViolationScope::Device(activation.id),
                    "device flagged offline",
                    now,
                );
            }

            if elapsed > allowance {
                let already_suspended = self
                    .ledger
                    .unresolved_for_device(
                        activation.license_id,
                        ViolationKind::OfflineTooLong,
                        activation.id,
                    )
                    .map(|v| v.severity >= Severity::Suspension)
                    .unwrap_or(false);
                self.ledger.record(
                    activation.license_id,
                    ViolationKind::OfflineTooLong,
                    Severity::Suspension,
                    ViolationScope::Device(activation.id),
                    "activation slot released",
                    now,
                );
                if !already_suspended {
                    report.escalated += 1;
                }
            }

            by_license
                .entry(activation.license_id)
                .or_default()
                .push(activation);
        }

        for (license_id, activations) in by_license {
            // Single-device licenses are fully covered by the
            // device-scoped record; the license-level record marks a
            // whole fleet going dark.
            let all_beyond_allowance = activations.len() >= 2
                && activations
                    .iter()
                    .all(|a| now - a.last_heartbeat_at > allowance);
            if all_beyond_allowance {
                let fresh = !self
                    .ledger
                    .has_unresolved_license_scoped(license_id, Severity::Suspension);
                self.ledger.record(
                    license_id,
                    ViolationKind::AllDevicesOffline,
                    Severity::Suspension,
                    ViolationScope::License,
                    "all devices offline beyond allowance",
                    now,
                );
                if fresh {
                    report.licenses_all_offline += 1;
                }
            }
        }

        debug!(
            flagged = report.flagged_offline,
            escalated = report.escalated,
            all_offline = report.licenses_all_offline,
            "sweep complete"
        );
        report
    }

    /// Drive the sweep on a fixed period until the owning task is
    /// aborted. Cooperative: each pass is a bounded synchronous
    /// computation between ticks.
    pub async fn run(&self, clock: Arc<dyn Clock>, period: std::time::Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = self.sweep_at(clock.now_utc());
            if report != SweepReport::default() {
                info!(
                    flagged = report.flagged_offline,
                    escalated = report.escalated,
                    all_offline = report.licenses_all_offline,
                    "liveness sweep recorded findings"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::gate::OverrideStore;
    use crate::model::LicenseKind;
    use crate::registry::LicenseRegistry;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    struct Fixture {
        monitor: HeartbeatMonitor,
        manager: Arc<ActivationManager>,
        registry: Arc<LicenseRegistry>,
        ledger: Arc<ViolationLedger>,
    }

    fn fixture() -> Fixture {
        let config = KeyfortConfig::default();
        let ledger = Arc::new(ViolationLedger::new(Arc::new(OverrideStore::new())));
        let registry = Arc::new(LicenseRegistry::new(config.clone(), Arc::clone(&ledger)));
        let manager = Arc::new(ActivationManager::new(config.clone(), Arc::clone(&registry)));
        let monitor = HeartbeatMonitor::new(config, Arc::clone(&manager), Arc::clone(&ledger));
        Fixture {
            monitor,
            manager,
            registry,
            ledger,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn issue(f: &Fixture, max: u32) -> crate::model::LicenseId {
        let features: BTreeSet<String> = ["inference".to_string()].into_iter().collect();
        f.registry
            .issue("owner-1", LicenseKind::Annual, max, features, t0())
            .unwrap()
            .0
            .id
    }

    #[test]
    fn healthy_devices_are_untouched() {
        let f = fixture();
        let id = issue(&f, 2);
        f.manager.activate(id, "device-a", t0()).unwrap();

        let report = f.monitor.sweep_at(t0() + Duration::hours(12));
        assert_eq!(report, SweepReport::default());
        assert!(f.ledger.history(id).is_empty());
    }

    #[test]
    fn silent_device_is_flagged_with_warning() {
        let f = fixture();
        let id = issue(&f, 2);
        let a = f.manager.activate(id, "device-a", t0()).unwrap();
        f.manager.activate(id, "device-b", t0()).unwrap();

        // Day 5: device-a silent past interval + grace (96h), device-b
        // heartbeating normally.
        let day5 = t0() + Duration::days(5);
        let b_id = f
            .manager
            .for_license(id)
            .into_iter()
            .find(|x| x.device_fingerprint == "device-b")
            .unwrap()
            .id;
        f.manager
            .heartbeat(b_id, &crate::model::UsageDelta::new(), day5)
            .unwrap();

        let report = f.monitor.sweep_at(day5);
        assert_eq!(report.flagged_offline, 1);
        assert_eq!(report.escalated, 0);
        assert_eq!(report.licenses_all_offline, 0);

        let history = f.ledger.history(id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].severity, Severity::Warning);
        assert_eq!(history[0].scope, ViolationScope::Device(a.id));
    }

    #[test]
    fn sweep_is_idempotent_at_same_instant() {
        let f = fixture();
        let id = issue(&f, 1);
        f.manager.activate(id, "device-a", t0()).unwrap();

        let day5 = t0() + Duration::days(5);
        let first = f.monitor.sweep_at(day5);
        assert_eq!(first.flagged_offline, 1);

        let second = f.monitor.sweep_at(day5);
        assert_eq!(second, SweepReport::default());
        assert_eq!(f.ledger.history(id).len(), 1);
    }

    #[test]
    fn allowance_breach_escalates_device_scoped() {
        let f = fixture();
        let id = issue(&f, 2);
        let a = f.manager.activate(id, "device-a", t0()).unwrap();
        f.manager.activate(id, "device-b", t0()).unwrap();

        // Keep device-b alive.
        let day10 = t0() + Duration::days(10);
        let b_id = f
            .manager
            .for_license(id)
            .into_iter()
            .find(|x| x.device_fingerprint == "device-b")
            .unwrap()
            .id;
        f.manager
            .heartbeat(b_id, &crate::model::UsageDelta::new(), day10)
            .unwrap();

        let report = f.monitor.sweep_at(day10);
        assert_eq!(report.escalated, 1);
        assert_eq!(report.licenses_all_offline, 0);

        let device_violation = f
            .ledger
            .unresolved_for_device(id, ViolationKind::OfflineTooLong, a.id)
            .unwrap();
        assert_eq!(device_violation.severity, Severity::Suspension);

        // One healthy device left: the license itself stays usable.
        assert!(f
            .registry
            .resolve_status(id, day10)
            .unwrap()
            .is_usable());
    }

    #[test]
    fn all_devices_offline_suspends_the_license() {
        let f = fixture();
        let id = issue(&f, 2);
        f.manager.activate(id, "device-a", t0()).unwrap();
        f.manager.activate(id, "device-b", t0()).unwrap();

        let day10 = t0() + Duration::days(10);
        let report = f.monitor.sweep_at(day10);
        assert_eq!(report.flagged_offline, 2);
        assert_eq!(report.escalated, 2);
        assert_eq!(report.licenses_all_offline, 1);

        assert_eq!(
            f.registry.resolve_status(id, day10).unwrap(),
            crate::model::LicenseStatus::Suspended
        );

        // Second pass with no time passed: nothing new.
        assert_eq!(f.monitor.sweep_at(day10), SweepReport::default());
    }

    #[test]
    fn heartbeat_after_snapshot_wins_over_sweep() {
        let f = fixture();
        let id = issue(&f, 1);
        let a = f.manager.activate(id, "device-a", t0()).unwrap();

        // A heartbeat lands "mid-sweep": mark_offline_if_stale re-checks
        // the timestamp under the lock and declines to flag.
        let day5 = t0() + Duration::days(5);
        f.manager
            .heartbeat(a.id, &crate::model::UsageDelta::new(), day5)
            .unwrap();
        assert!(!f
            .manager
            .mark_offline_if_stale(a.id, Duration::hours(96), day5));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_driver_runs_sweeps() {
        let f = fixture();
        let id = issue(&f, 1);
        f.manager.activate(id, "device-a", t0()).unwrap();

        let clock = Arc::new(MockClock::new(t0() + Duration::days(5)));
        let monitor = Arc::new(HeartbeatMonitor::new(
            KeyfortConfig::default(),
            Arc::clone(&f.manager),
            Arc::clone(&f.ledger),
        ));

        let task = {
            let monitor = Arc::clone(&monitor);
            let clock: Arc<dyn Clock> = clock;
            tokio::spawn(async move {
                monitor.run(clock, std::time::Duration::from_secs(3600)).await;
            })
        };

        // First tick fires immediately; give the task a chance to run it.
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        task.abort();

        assert_eq!(f.ledger.history(id).len(), 1);
    }
}
