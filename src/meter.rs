//! Per-license, per-feature daily usage counters.
//!
//! Counters roll over at UTC midnight, deterministically against the
//! supplied `now` rather than a wall-clock read, so quota checks and
//! charges behave identically in tests and production.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::LicenseId;

/// A single feature's count for one UTC day.
#[derive(Debug, Clone, Copy)]
struct DayCount {
    day: NaiveDate,
    used: u64,
}

/// In-memory daily usage meter.
#[derive(Debug, Default)]
pub struct UsageMeter {
    counts: RwLock<HashMap<(LicenseId, String), DayCount>>,
}

impl UsageMeter {
    /// Create an empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `n` uses of a feature against the license's daily counter.
    pub fn record_use(&self, license_id: LicenseId, feature: &str, n: u64, now: DateTime<Utc>) {
        let today = now.date_naive();
        let mut counts = self.counts.write().expect("meter lock poisoned");
        let entry = counts
            .entry((license_id, feature.to_string()))
            .or_insert(DayCount { day: today, used: 0 });
        if entry.day != today {
            entry.day = today;
            entry.used = 0;
        }
        entry.used += n;
    }

    /// The feature's usage so far today. A counter from a previous UTC
    /// day reads as zero.
    pub fn used_today(&self, license_id: LicenseId, feature: &str, now: DateTime<Utc>) -> u64 {
        let today = now.date_naive();
        let counts = self.counts.read().expect("meter lock poisoned");
        match counts.get(&(license_id, feature.to_string())) {
            Some(entry) if entry.day == today => entry.used,
            _ => 0,
        }
    }
}
