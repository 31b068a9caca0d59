//! Overflow handling: reclaim from the pool, solicit peers, or throttle.

use std::sync::atomic::Ordering;

use error_stack::Result;
use serde::Serialize;

use crate::counter::UsageMonitor;
use crate::dispatch::{Dispatcher, UnitTask};
use crate::reclaim::donatable_surplus;
use crate::regulator::{Regulator, Unit};
use crate::state::CoreState;
use crate::throttle::ThrottleGate;
use crate::MemschedError;

/// What the overflow handler did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverflowOutcome {
    /// The unit is unregulated or the regulator is inactive.
    Disabled,
    /// The unit had nothing to run at the start of the period.
    Idle,
    /// The signal belongs to an earlier period.
    Stale,
    /// The signal arrived after the period deadline.
    Late,
    /// Usage is still under the current budget.
    Spurious,
    /// Workloads are already suspended for this period.
    AlreadyThrottled,
    /// Budget was taken from the pool.
    Reclaimed(u64),
    /// Workloads were suspended.
    Throttled(u32),
    /// Suspending failed; the unit keeps running until the next period.
    ThrottleFailed,
}

impl<G: ThrottleGate> Regulator<G> {
    /// Signal-context check for `unit`. Returns the task to queue on the
    /// unit's worker when its counter crossed the threshold.
    pub fn signal(&self, unit: usize) -> Option<UnitTask> {
        let monitor = self.units.get(unit)?.monitor.as_ref()?;
        monitor.poll().then(|| UnitTask::Overflow {
            epoch: self.global.period(),
        })
    }

    /// Runs a deferred task on the worker of `unit`.
    pub fn run_task_at(
        &self,
        unit: usize,
        task: UnitTask,
        now_ns: u64,
        dispatcher: &dyn Dispatcher,
    ) -> Result<(), MemschedError> {
        match task {
            UnitTask::Overflow { epoch } => {
                let outcome = self.handle_overflow_at(unit, epoch, now_ns, dispatcher)?;
                tracing::trace!(unit, epoch, ?outcome, "processed overflow");
            }
            UnitTask::Solicit { epoch, requester } => {
                let donated = self.handle_solicitation_at(unit, epoch, requester, now_ns)?;
                tracing::trace!(unit, epoch, requester, donated, "processed solicitation");
            }
        }
        Ok(())
    }

    /// Handles a budget overflow of `unit` raised during `epoch`.
    pub fn handle_overflow_at(
        &self,
        unit: usize,
        epoch: u64,
        now_ns: u64,
        dispatcher: &dyn Dispatcher,
    ) -> Result<OverflowOutcome, MemschedError> {
        let u = self.unit(unit)?;
        let Some(monitor) = u.monitor.as_ref() else {
            return Ok(OverflowOutcome::Disabled);
        };
        if !self.is_active() {
            return Ok(OverflowOutcome::Disabled);
        }
        if u.board.is_idle() {
            return Ok(OverflowOutcome::Idle);
        }

        let mut core = u.lock_core();
        if let Some(outcome) = self.screen_overflow(monitor, &mut core, epoch, now_ns) {
            return Ok(outcome);
        }
        let used = monitor.read_delta();

        if !self.reclaim_enabled() {
            return Ok(self.throttle(u, monitor, &mut core, used, now_ns));
        }
        if let Some(amount) = self.reclaim_for(monitor, &mut core, used) {
            return Ok(OverflowOutcome::Reclaimed(amount));
        }

        let remaining = self.global.remaining_ns(now_ns);
        if remaining < self.cfg.min_reclaim_window.as_nanos() as i64 {
            tracing::debug!(unit, remaining, "too late in the period to solicit");
            return Ok(self.throttle(u, monitor, &mut core, used, now_ns));
        }
        let utilization = self.system_utilization_pct();
        if utilization > u64::from(self.ceiling_pct()) {
            tracing::debug!(unit, utilization, "system above ceiling");
            return Ok(self.throttle(u, monitor, &mut core, used, now_ns));
        }

        // Peers donate on their own workers; never hold our lock across that.
        drop(core);
        let solicited = self.solicit_peers(unit, epoch, dispatcher);
        if solicited > 0 {
            dispatcher.settle(self.cfg.solicit_delay);
        }

        let mut core = u.lock_core();
        if let Some(outcome) = self.screen_overflow(monitor, &mut core, epoch, now_ns) {
            return Ok(outcome);
        }
        let used = monitor.read_delta();
        if let Some(amount) = self.reclaim_for(monitor, &mut core, used) {
            return Ok(OverflowOutcome::Reclaimed(amount));
        }
        tracing::debug!(unit, solicited, "reclaim failed after solicitation");
        Ok(self.throttle(u, monitor, &mut core, used, now_ns))
    }

    /// Asks `unit` to donate its predicted surplus on behalf of `requester`.
    /// Returns the donated amount.
    pub fn handle_solicitation_at(
        &self,
        unit: usize,
        epoch: u64,
        requester: usize,
        now_ns: u64,
    ) -> Result<u64, MemschedError> {
        let u = self.unit(unit)?;
        let Some(monitor) = u.monitor.as_ref() else {
            return Ok(0);
        };
        if !self.is_active() || !self.reclaim_enabled() || u.board.is_idle() {
            return Ok(0);
        }

        let mut core = u.lock_core();
        if epoch != self.global.period() || core.epoch != epoch {
            core.stats.stale_signals += 1;
            tracing::debug!(unit, epoch, requester, "dropped stale solicitation");
            return Ok(0);
        }
        let remaining = self.global.remaining_ns(now_ns);
        if remaining <= 0 || core.is_throttled() {
            return Ok(0);
        }

        let used = monitor.read_delta();
        let surplus = donatable_surplus(
            &core,
            used,
            remaining as u64,
            self.global.period_ns(),
            self.max_budget(),
        );
        if surplus <= self.cfg.min_donation {
            return Ok(0);
        }

        let pool = self.global.pool.donate(surplus);
        core.cur_budget -= surplus;
        core.donated += surplus;
        core.stats.donations += 1;
        core.stats.donated_events += surplus;
        monitor.reprogram(core.cur_budget.saturating_sub(used).max(1));
        tracing::debug!(unit, requester, amount = surplus, pool, "donated surplus");
        Ok(surplus)
    }

    /// Drops signals that no longer apply. Counts what it drops.
    fn screen_overflow(
        &self,
        monitor: &UsageMonitor,
        core: &mut CoreState,
        epoch: u64,
        now_ns: u64,
    ) -> Option<OverflowOutcome> {
        let unit = monitor.unit();
        if epoch != self.global.period() || core.epoch != epoch {
            core.stats.stale_signals += 1;
            tracing::debug!(unit, epoch, current = self.global.period(), "dropped stale overflow");
            return Some(OverflowOutcome::Stale);
        }
        if self.global.remaining_ns(now_ns) < 0 {
            core.stats.late_signals += 1;
            tracing::debug!(unit, epoch, "dropped late overflow");
            return Some(OverflowOutcome::Late);
        }
        if core.is_throttled() {
            monitor.reprogram(self.max_budget());
            return Some(OverflowOutcome::AlreadyThrottled);
        }
        let used = monitor.read_delta();
        if used < core.cur_budget {
            core.stats.spurious_overflows += 1;
            monitor.reprogram(core.cur_budget - used);
            tracing::debug!(unit, used, cur_budget = core.cur_budget, "ignored spurious overflow");
            return Some(OverflowOutcome::Spurious);
        }
        None
    }

    fn reclaim_for(&self, monitor: &UsageMonitor, core: &mut CoreState, used: u64) -> Option<u64> {
        let requested = if used < core.budget {
            core.budget - used
        } else {
            self.cfg.reclaim_quantum
        };
        let amount = self.global.pool.reclaim(requested);
        if amount == 0 {
            return None;
        }
        core.cur_budget += amount;
        core.reclaimed += amount;
        core.stats.reclaims += 1;
        core.stats.reclaimed_events += amount;
        monitor.reprogram(core.cur_budget.saturating_sub(used).max(1));
        tracing::debug!(unit = monitor.unit(), requested, amount, "reclaimed budget");
        Some(amount)
    }

    /// Current usage of all regulated units relative to their assigned budgets.
    fn system_utilization_pct(&self) -> u64 {
        let (used, assigned) = self
            .units
            .iter()
            .filter(|u| !u.board.is_idle())
            .filter_map(|u| u.monitor.as_ref().map(|m| (m, &u.board)))
            .fold((0u128, 0u128), |(used, assigned), (monitor, board)| {
                (
                    used + u128::from(monitor.read_delta()),
                    assigned + u128::from(board.assigned.load(Ordering::Acquire)),
                )
            });
        (used * 100 / assigned.max(1)) as u64
    }

    fn solicit_peers(&self, requester: usize, epoch: u64, dispatcher: &dyn Dispatcher) -> usize {
        let threshold = u64::from(self.ceiling_pct()) / 2;
        let mut solicited = 0;
        for peer in &self.units {
            if peer.id == requester || peer.monitor.is_none() || peer.board.is_idle() {
                continue;
            }
            if peer.board.recent_pct() >= threshold {
                continue;
            }
            dispatcher.post(peer.id, UnitTask::Solicit { epoch, requester });
            solicited += 1;
        }
        solicited
    }

    fn throttle(
        &self,
        unit: &Unit,
        monitor: &UsageMonitor,
        core: &mut CoreState,
        used: u64,
        now_ns: u64,
    ) -> OverflowOutcome {
        let outcome = match self.gate.suspend(unit.id) {
            Ok(count) => {
                core.throttled += i64::from(count);
                core.throttled_at = Some(now_ns);
                core.stats.throttle_events += 1;
                core.pending_false_throttle = used < core.budget;
                tracing::debug!(unit = unit.id, count, used, budget = core.budget, "throttled unit");
                OverflowOutcome::Throttled(count)
            }
            Err(report) => {
                core.stats.throttle_failures += 1;
                tracing::warn!(unit = unit.id, error = ?report, "failed to throttle unit");
                OverflowOutcome::ThrottleFailed
            }
        };
        monitor.reprogram(self.max_budget());
        outcome
    }
}
