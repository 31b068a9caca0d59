//! Shared budget pool and need prediction.
//!
//! The pool is touched from every unit's signal path, so it is a single
//! atomic updated with a bounded compare-and-swap loop and never a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::{CoreState, Intensity};

/// Compare-and-swap attempts before a reclaim gives up.
pub const MAX_RECLAIM_ATTEMPTS: usize = 5;

/// Budget donated by units that do not expect to need it this period.
#[derive(Debug, Default)]
pub struct BudgetPool {
    events: AtomicU64,
}

impl BudgetPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn available(&self) -> u64 {
        self.events.load(Ordering::Acquire)
    }

    /// Adds `amount` to the pool and returns the new total.
    ///
    /// A donation that races a rollover simply lands in the new period's pool.
    pub fn donate(&self, amount: u64) -> u64 {
        self.events
            .fetch_add(amount, Ordering::AcqRel)
            .saturating_add(amount)
    }

    /// Takes up to `requested` events. Returns 0 when the pool is empty or
    /// the attempts are exhausted under contention.
    pub fn reclaim(&self, requested: u64) -> u64 {
        self.reclaim_with(requested, |_| {})
    }

    fn reclaim_with(&self, requested: u64, mut before_swap: impl FnMut(&AtomicU64)) -> u64 {
        for _ in 0..MAX_RECLAIM_ATTEMPTS {
            let available = self.events.load(Ordering::Acquire);
            let amount = requested.min(available);
            if amount == 0 {
                return 0;
            }
            before_swap(&self.events);
            if self
                .events
                .compare_exchange(
                    available,
                    available - amount,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return amount;
            }
        }
        tracing::debug!(requested, "reclaim gave up under contention");
        0
    }

    /// Empties the pool, returning what was left.
    pub(crate) fn drain(&self) -> u64 {
        self.events.swap(0, Ordering::AcqRel)
    }
}

/// Events a unit is expected to consume in the `remaining_ns` left of a period.
///
/// `worst_case` is the events one period can carry at the system's maximum
/// bandwidth.
pub fn compute_need(
    state: &CoreState,
    remaining_ns: u64,
    period_ns: u64,
    worst_case: u64,
) -> u64 {
    let period_ns = period_ns.max(1) as u128;
    let remaining = remaining_ns.min(period_ns as u64) as u128;
    let need = match state.intensity {
        Intensity::Auto => state.ewma.hl2 as u128 * remaining / period_ns,
        Intensity::Manual(pct) => worst_case as u128 * pct as u128 * remaining / (100 * period_ns),
        Intensity::Conservative => worst_case as u128 * remaining / period_ns,
    };
    need as u64
}

/// Budget a unit can give away right now: what it has left minus what it
/// is predicted to need.
pub fn donatable_surplus(
    state: &CoreState,
    used: u64,
    remaining_ns: u64,
    period_ns: u64,
    worst_case: u64,
) -> u64 {
    let left = state.cur_budget.saturating_sub(used);
    left.saturating_sub(compute_need(state, remaining_ns, period_ns, worst_case))
}
