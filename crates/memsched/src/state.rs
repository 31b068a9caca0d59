use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use error_stack::Result;
use serde::{Deserialize, Serialize};

use crate::reclaim::BudgetPool;
use crate::stats::UsageStats;
use crate::MemschedError;

/// How aggressively a unit's future need is estimated when it is asked to donate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Intensity {
    /// Predict from the unit's own usage history.
    #[default]
    Auto,
    /// Assume the given percentage of the worst-case rate.
    Manual(u8),
    /// Assume the worst-case rate.
    Conservative,
}

impl TryFrom<u8> for Intensity {
    type Error = String;

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Auto),
            1..=99 => Ok(Self::Manual(value)),
            100 => Ok(Self::Conservative),
            other => Err(format!("intensity must be in [0, 100], got {other}")),
        }
    }
}

impl From<Intensity> for u8 {
    fn from(value: Intensity) -> Self {
        match value {
            Intensity::Auto => 0,
            Intensity::Manual(pct) => pct,
            Intensity::Conservative => 100,
        }
    }
}

impl Intensity {
    pub fn parse(value: u8) -> Result<Self, MemschedError> {
        Self::try_from(value)
            .map_err(|reason| error_stack::report!(MemschedError::invalid_config(reason)))
    }
}

/// Source of a unit's assigned budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BudgetMode {
    /// Fixed number of events per period.
    Limit(u64),
    /// Share of the system maximum, relative to the other weighted units.
    Weight(u32),
}

/// Per-unit configuration written by the control surface.
///
/// Guarded by a lock the period path only ever `try_lock`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSettings {
    pub mode: BudgetMode,
    pub intensity: Intensity,
}

impl UnitSettings {
    pub fn limit(events: u64) -> Self {
        Self {
            mode: BudgetMode::Limit(events),
            intensity: Intensity::Auto,
        }
    }
}

/// Three-tap exponentially weighted usage history, in events per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageEwma {
    /// Last period, unsmoothed.
    pub last: u64,
    /// Half-life of two periods.
    pub hl2: u64,
    /// Half-life of four periods.
    pub hl4: u64,
}

impl UsageEwma {
    pub fn new(initial: u64) -> Self {
        Self {
            last: initial,
            hl2: initial,
            hl4: initial,
        }
    }

    pub fn update(&mut self, used: u64) {
        self.last = used;
        self.hl2 = (self.hl2 + used) >> 1;
        self.hl4 = (self.hl4 * 3 + used) >> 2;
    }
}

/// Control state of one execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreState {
    /// Budget assigned for the current period.
    pub budget: u64,
    /// Budget the counter is currently armed against.
    pub cur_budget: u64,
    /// Taken from the pool this period.
    pub reclaimed: u64,
    /// Given to the pool this period.
    pub donated: u64,
    pub intensity: Intensity,
    /// Period the state belongs to.
    pub epoch: u64,
    /// Tasks suspended on this unit. Negative after a failed release.
    pub throttled: i64,
    pub throttled_at: Option<u64>,
    /// Throttled while still under the assigned budget.
    pub pending_false_throttle: bool,
    pub ewma: UsageEwma,
    pub stats: UsageStats,
}

impl CoreState {
    pub fn new(budget: u64, intensity: Intensity, epoch: u64) -> Self {
        Self {
            budget,
            cur_budget: budget,
            reclaimed: 0,
            donated: 0,
            intensity,
            epoch,
            throttled: 0,
            throttled_at: None,
            pending_false_throttle: false,
            ewma: UsageEwma::new(budget),
            stats: UsageStats::default(),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled > 0
    }

    /// Clears statistics and history as if the unit had just been activated.
    pub fn reset_stats(&mut self) {
        self.stats = UsageStats::default();
        self.ewma = UsageEwma::new(self.budget);
        self.cur_budget = self.budget;
    }
}

/// Lock-free per-unit values peers read without touching the unit's lock.
#[derive(Debug, Default)]
pub struct UsageBoard {
    pub assigned: AtomicU64,
    /// Half-life-2 usage history.
    pub recent: AtomicU64,
    /// Weight when the unit is in weight mode, 0 otherwise.
    pub weight: AtomicU32,
    /// Set while the unit had nothing to run at its last period start.
    idle: AtomicBool,
}

impl UsageBoard {
    pub fn publish(&self, state: &CoreState) {
        self.assigned.store(state.budget, Ordering::Release);
        self.recent.store(state.ewma.hl2, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Marks the unit idle or active, returning the previous state.
    pub fn set_idle(&self, idle: bool) -> bool {
        self.idle.swap(idle, Ordering::AcqRel)
    }

    /// Recent usage as a percentage of the assigned budget.
    pub fn recent_pct(&self) -> u64 {
        let assigned = self.assigned.load(Ordering::Acquire).max(1);
        self.recent.load(Ordering::Acquire) * 100 / assigned
    }
}

/// State shared by every unit.
#[derive(Debug)]
pub struct GlobalState {
    pub pool: BudgetPool,
    period: AtomicU64,
    period_ns: u64,
    deadline_ns: AtomicU64,
    overruns: AtomicU64,
    leftovers: AtomicU64,
}

impl GlobalState {
    pub fn new(period_ns: u64) -> Self {
        Self {
            pool: BudgetPool::new(),
            period: AtomicU64::new(0),
            period_ns,
            deadline_ns: AtomicU64::new(period_ns),
            overruns: AtomicU64::new(0),
            leftovers: AtomicU64::new(0),
        }
    }

    pub fn period(&self) -> u64 {
        self.period.load(Ordering::Acquire)
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns.load(Ordering::Acquire)
    }

    /// Nanoseconds left in the current period, negative once past the deadline.
    pub fn remaining_ns(&self, now_ns: u64) -> i64 {
        self.deadline_ns() as i64 - now_ns as i64
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Rollovers that found unreclaimed budget in the pool.
    pub fn leftovers(&self) -> u64 {
        self.leftovers.load(Ordering::Relaxed)
    }

    pub(crate) fn advance_period(&self) -> u64 {
        self.period.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Moves the deadline past `now_ns`, returning the number of whole periods missed.
    pub(crate) fn advance_deadline(&self, now_ns: u64) -> u64 {
        let deadline = self.deadline_ns();
        let missed = now_ns.saturating_sub(deadline) / self.period_ns;
        self.deadline_ns
            .store(deadline + self.period_ns * (missed + 1), Ordering::Release);
        if missed > 0 {
            self.overruns.fetch_add(missed, Ordering::Relaxed);
        }
        missed
    }

    pub(crate) fn record_leftover(&self) {
        self.leftovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn restart_deadline(&self, now_ns: u64) {
        self.deadline_ns
            .store(now_ns + self.period_ns, Ordering::Release);
    }
}
