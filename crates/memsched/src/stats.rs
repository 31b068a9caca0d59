//! Cumulative per-unit statistics.
//!
//! Everything here only grows until an explicit [`crate::Regulator::reset_stats`].

use serde::Serialize;

use crate::state::{CoreState, Intensity, UsageEwma};

/// Number of buckets of the false-throttle histogram.
pub const ERROR_BUCKETS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    /// Periods this unit went through.
    pub periods: u64,
    /// Sum of per-period usage.
    pub used_total: u64,
    /// Sum of per-period assigned budgets.
    pub assigned_total: u64,
    /// Periods that ended with the unit throttled.
    pub throttled_periods: u64,
    pub throttled_time_ns: u64,
    /// Suspensions performed by the overflow handler.
    pub throttle_events: u64,
    /// Periods throttled although the unit stayed under its assigned budget.
    pub false_throttles: u64,
    /// False throttles bucketed by how far under budget the unit ended, in tenths.
    pub false_throttle_dist: [u64; ERROR_BUCKETS],
    pub reclaims: u64,
    pub reclaimed_events: u64,
    pub donations: u64,
    pub donated_events: u64,
    /// Overflow or solicitation signals from an earlier period.
    pub stale_signals: u64,
    /// Overflow signals processed after the period deadline.
    pub late_signals: u64,
    /// Overflow signals raised while usage was still under the current budget.
    pub spurious_overflows: u64,
    pub throttle_failures: u64,
    pub release_failures: u64,
    /// Throttle counts that disagreed with the gate and were reset.
    pub throttle_count_repairs: u64,
    /// Period starts skipped because the unit had nothing to run.
    pub idle_periods: u64,
    /// Period starts where the configuration lock was contended.
    pub settings_skipped: u64,
    /// Period starts where the assigned budget exceeded the system maximum.
    pub over_ceiling: u64,
}

impl UsageStats {
    /// Records a false throttle for a unit that used `used` of `budget` events.
    pub fn record_false_throttle(&mut self, used: u64, budget: u64) {
        let diff = budget.saturating_sub(used);
        let idx = (diff * ERROR_BUCKETS as u64 / budget.max(1)) as usize;
        self.false_throttles += 1;
        self.false_throttle_dist[idx.min(ERROR_BUCKETS - 1)] += 1;
    }

    /// Average usage relative to the assigned budget, in percent.
    pub fn utilization_pct(&self) -> u64 {
        self.used_total * 100 / self.assigned_total.max(1)
    }
}

/// Point-in-time copy of one unit, for the configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub unit: usize,
    /// Whether a counter exists for the unit.
    pub regulated: bool,
    pub budget: u64,
    pub cur_budget: u64,
    pub intensity: u8,
    pub epoch: u64,
    pub throttled: i64,
    /// Counter stopped because the unit had nothing to run.
    pub idle: bool,
    pub ewma: UsageEwma,
    pub stats: UsageStats,
}

impl UnitSnapshot {
    pub(crate) fn from_state(unit: usize, state: &CoreState, idle: bool) -> Self {
        Self {
            unit,
            regulated: true,
            budget: state.budget,
            cur_budget: state.cur_budget,
            intensity: u8::from(state.intensity),
            epoch: state.epoch,
            throttled: state.throttled,
            idle,
            ewma: state.ewma,
            stats: state.stats.clone(),
        }
    }

    pub(crate) fn unregulated(unit: usize) -> Self {
        Self {
            unit,
            regulated: false,
            budget: 0,
            cur_budget: 0,
            intensity: u8::from(Intensity::Auto),
            epoch: 0,
            throttled: 0,
            idle: false,
            ewma: UsageEwma::new(0),
            stats: UsageStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn false_throttle_buckets_by_decile() {
        let mut stats = UsageStats::default();
        stats.record_false_throttle(950, 1000);
        stats.record_false_throttle(400, 1000);
        stats.record_false_throttle(0, 1000);

        assert_eq!(stats.false_throttles, 3);
        assert_eq!(stats.false_throttle_dist[0], 1);
        assert_eq!(stats.false_throttle_dist[6], 1);
        // Entirely unused budget lands in the last bucket.
        assert_eq!(stats.false_throttle_dist[9], 1);
    }

    #[test]
    fn utilization_handles_empty_totals() {
        let stats = UsageStats::default();
        assert_eq!(stats.utilization_pct(), 0);

        let stats = UsageStats {
            used_total: 750,
            assigned_total: 1000,
            ..Default::default()
        };
        assert_eq!(stats.utilization_pct(), 75);
    }
}
