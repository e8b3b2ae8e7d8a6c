//! Worker records and reputation tiers.
//!
//! Tier assignment is a deterministic function of `(completed, success
//! rate)`. Workers with fewer than five finished tasks are treated as
//! perfect so newcomers are not punished by a single early failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of finished tasks below which the success rate is smoothed to 1.0.
pub const SMOOTHING_FLOOR: u64 = 5;

/// Worker identifier (opaque string chosen at registration).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Wrap a raw identifier.
    pub fn new(raw: &str) -> Self {
        Self(raw.to_owned())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reputation tiers, lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTier {
    /// Fewer than 10 completions.
    #[default]
    Novice,
    /// >= 10 completions and success rate >= 0.6.
    Apprentice,
    /// >= 50 completions and success rate >= 0.75.
    Journeyman,
    /// >= 200 completions and success rate >= 0.85.
    Expert,
    /// >= 500 completions and success rate >= 0.92.
    Master,
}

impl WorkerTier {
    /// Compute the tier for a completion/failure history.
    ///
    /// The rules are checked top-down; a worker holds the highest tier whose
    /// floor and rate it clears.
    pub fn for_history(completed: u64, failed: u64) -> Self {
        let rate = success_rate(completed, failed);
        if completed >= 500 && rate >= 0.92 {
            Self::Master
        } else if completed >= 200 && rate >= 0.85 {
            Self::Expert
        } else if completed >= 50 && rate >= 0.75 {
            Self::Journeyman
        } else if completed >= 10 && rate >= 0.6 {
            Self::Apprentice
        } else {
            Self::Novice
        }
    }

    /// Lowercase label matching the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Novice => "novice",
            Self::Apprentice => "apprentice",
            Self::Journeyman => "journeyman",
            Self::Expert => "expert",
            Self::Master => "master",
        }
    }
}

impl fmt::Display for WorkerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Success rate with the newcomer smoothing rule applied.
pub fn success_rate(completed: u64, failed: u64) -> f64 {
    let finished = completed + failed;
    if finished < SMOOTHING_FLOOR {
        return 1.0;
    }
    completed as f64 / finished as f64
}

/// A registered executor.
///
/// Created on first `register`; mutated only via completion/failure events;
/// never deleted. Retired workers keep their history behind the flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Stable identifier.
    pub id: WorkerId,
    /// Display name.
    pub name: String,
    /// Current reputation tier (always `for_history(completed, failed)`).
    pub tier: WorkerTier,
    /// Tasks completed successfully.
    pub tasks_completed: u64,
    /// Tasks failed.
    pub tasks_failed: u64,
    /// Lifetime earnings in integer micro-units.
    pub total_earnings: u64,
    /// Retired workers stop receiving work but keep their record.
    #[serde(default)]
    pub retired: bool,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Create a fresh novice record.
    pub fn new(id: WorkerId, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_owned(),
            tier: WorkerTier::Novice,
            tasks_completed: 0,
            tasks_failed: 0,
            total_earnings: 0,
            retired: false,
            registered_at: now,
            updated_at: now,
        }
    }

    /// Derived success rate (with smoothing).
    pub fn success_rate(&self) -> f64 {
        success_rate(self.tasks_completed, self.tasks_failed)
    }

    /// Record a completion and recompute the tier.
    pub fn record_completion(&mut self, earnings: u64) {
        self.tasks_completed += 1;
        self.total_earnings = self.total_earnings.saturating_add(earnings);
        self.tier = WorkerTier::for_history(self.tasks_completed, self.tasks_failed);
        self.updated_at = Utc::now();
    }

    /// Record a failure and recompute the tier.
    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
        self.tier = WorkerTier::for_history(self.tasks_completed, self.tasks_failed);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(WorkerTier::for_history(9, 0), WorkerTier::Novice);
        assert_eq!(WorkerTier::for_history(10, 0), WorkerTier::Apprentice);
        assert_eq!(WorkerTier::for_history(49, 0), WorkerTier::Apprentice);
        assert_eq!(WorkerTier::for_history(50, 0), WorkerTier::Journeyman);
        assert_eq!(WorkerTier::for_history(200, 0), WorkerTier::Expert);
        assert_eq!(WorkerTier::for_history(500, 0), WorkerTier::Master);
    }

    #[test]
    fn rates_gate_tiers() {
        // 500 completions but too many failures: 500/(500+100) ≈ 0.833.
        assert_eq!(WorkerTier::for_history(500, 100), WorkerTier::Journeyman);
        // 200/(200+40) ≈ 0.833 clears Journeyman but not Expert.
        assert_eq!(WorkerTier::for_history(200, 40), WorkerTier::Journeyman);
        // 10 completions, 7 failures: rate ≈ 0.588 < 0.6.
        assert_eq!(WorkerTier::for_history(10, 7), WorkerTier::Novice);
    }

    #[test]
    fn smoothing_treats_newcomers_as_perfect() {
        assert_eq!(success_rate(1, 3), 1.0);
        assert_eq!(success_rate(0, 4), 1.0);
        assert!(success_rate(1, 4) < 1.0);
    }

    #[test]
    fn mutations_keep_tier_in_sync() {
        let mut record = WorkerRecord::new(WorkerId::new("w-1"), "atlas");
        for _ in 0..10 {
            record.record_completion(250_000);
        }
        assert_eq!(record.tier, WorkerTier::Apprentice);
        assert_eq!(record.total_earnings, 2_500_000);
        record.record_failure();
        assert_eq!(
            record.tier,
            WorkerTier::for_history(record.tasks_completed, record.tasks_failed)
        );
    }

    proptest! {
        // Property 4: tier is always the deterministic function of history.
        #[test]
        fn tier_is_pure_function(completed in 0u64..600, failed in 0u64..600) {
            let mut record = WorkerRecord::new(WorkerId::new("w"), "w");
            for _ in 0..completed { record.record_completion(1); }
            for _ in 0..failed { record.record_failure(); }
            prop_assert_eq!(record.tier, WorkerTier::for_history(completed, failed));
        }
    }
}
