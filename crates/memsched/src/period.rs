//! Period rollover and per-unit replenishment.

use std::sync::atomic::Ordering;

use error_stack::Result;

use crate::config::nice_to_weight;
use crate::reclaim::compute_need;
use crate::regulator::{Regulator, Unit};
use crate::state::{BudgetMode, CoreState};
use crate::throttle::ThrottleGate;
use crate::MemschedError;

impl<G: ThrottleGate> Regulator<G> {
    /// Ends the current period at `now_ns` and starts the next one on every unit.
    ///
    /// Returns the deadline of the new period.
    pub fn rollover_at(&self, now_ns: u64) -> u64 {
        if !self.is_active() {
            return self.global.deadline_ns();
        }

        let leftover = self.global.pool.drain();
        if leftover > 0 && !self.cfg.proactive_donation {
            self.global.record_leftover();
            tracing::error!(
                leftover,
                period = self.global.period(),
                "budget pool was not empty at rollover"
            );
        }

        let period = self.global.advance_period();
        let missed = self.global.advance_deadline(now_ns);
        if missed > 0 {
            tracing::warn!(period, missed, "period timer overran");
        }

        for unit in 0..self.units.len() {
            if let Err(report) = self.reset_unit_at(unit, now_ns) {
                tracing::error!(unit, error = ?report, "failed to reset unit");
            }
        }
        self.global.deadline_ns()
    }

    /// Folds the finished period of `unit` into its statistics and replenishes it.
    pub fn reset_unit_at(&self, unit: usize, now_ns: u64) -> Result<(), MemschedError> {
        let u = self.unit(unit)?;
        let Some(monitor) = u.monitor.as_ref() else {
            return Ok(());
        };

        let mut core = u.lock_core();
        let used = monitor.stop();
        let was_idle = u.board.is_idle();
        if !was_idle {
            fold_usage(&mut core, used, now_ns);
        }

        // Nothing to run: leave the counter stopped until work shows up.
        if core.throttled == 0 && self.gate.runnable(unit) == Some(0) {
            core.epoch = self.global.period();
            core.reclaimed = 0;
            core.donated = 0;
            core.stats.idle_periods += 1;
            if !u.board.set_idle(true) {
                tracing::debug!(unit, "unit went idle");
            }
            return Ok(());
        }
        if u.board.set_idle(false) {
            tracing::debug!(unit, "unit has work again");
        }

        self.apply_settings(u, &mut core);

        if core.budget > self.max_budget() {
            core.stats.over_ceiling += 1;
            tracing::warn!(
                unit,
                budget = core.budget,
                max_budget = self.max_budget(),
                "assigned budget exceeds system maximum"
            );
        }

        self.release(u, &mut core, now_ns);

        core.epoch = self.global.period();
        core.reclaimed = 0;
        core.donated = 0;
        core.cur_budget = core.budget;
        if self.cfg.proactive_donation && self.reclaim_enabled() {
            self.donate_ahead(&mut core);
        }

        u.board.publish(&core);
        monitor.reprogram(core.cur_budget.max(1));
        monitor.start();
        Ok(())
    }

    /// Copies pending configuration into the unit unless the settings are
    /// being written. With task priorities enabled the weight follows the
    /// nice value the gate reports.
    fn apply_settings(&self, unit: &Unit, core: &mut CoreState) {
        let mut mode = match unit.settings.try_lock() {
            Ok(settings) => {
                core.intensity = settings.intensity;
                Some(settings.mode)
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                let settings = poisoned.into_inner();
                core.intensity = settings.intensity;
                Some(settings.mode)
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                core.stats.settings_skipped += 1;
                tracing::debug!(unit = unit.id, "settings busy, keeping previous budget");
                None
            }
        };

        if self.cfg.task_priority {
            if let Some(nice) = self.gate.priority(unit.id) {
                mode = Some(BudgetMode::Weight(nice_to_weight(nice)));
            }
        }

        let Some(mode) = mode else {
            return;
        };
        core.budget = match mode {
            BudgetMode::Limit(events) => {
                unit.board.weight.store(0, Ordering::Release);
                events
            }
            BudgetMode::Weight(weight) => {
                unit.board.weight.store(weight, Ordering::Release);
                self.weighted_budget(weight)
            }
        };
    }

    /// Resumes workloads suspended during the finished period.
    fn release(&self, unit: &Unit, core: &mut CoreState, now_ns: u64) {
        if core.throttled > 0 {
            match self.gate.resume(unit.id) {
                Ok(count) => {
                    // The gate holds nothing for the unit after a resume.
                    if i64::from(count) != core.throttled {
                        tracing::warn!(
                            unit = unit.id,
                            throttled = core.throttled,
                            resumed = count,
                            "throttle count drifted from the gate, resetting"
                        );
                        core.stats.throttle_count_repairs += 1;
                    }
                    core.throttled = 0;
                }
                Err(report) => {
                    core.stats.release_failures += 1;
                    tracing::warn!(unit = unit.id, error = ?report, "failed to release throttled tasks");
                }
            }
        } else if core.throttled < 0 {
            tracing::error!(
                unit = unit.id,
                throttled = core.throttled,
                "negative throttle count, resetting"
            );
            core.throttled = 0;
            core.stats.throttle_count_repairs += 1;
        }
        core.throttled_at = core.is_throttled().then_some(now_ns);
    }

    /// Gives the predicted surplus of the new period to the pool right away.
    fn donate_ahead(&self, core: &mut CoreState) {
        let period_ns = self.global.period_ns();
        let need = compute_need(core, period_ns, period_ns, self.max_budget());
        if need >= core.budget {
            return;
        }
        let surplus = (core.budget - need).min(core.budget - 1);
        if surplus == 0 {
            return;
        }
        self.global.pool.donate(surplus);
        core.cur_budget -= surplus;
        core.donated += surplus;
        core.stats.donations += 1;
        core.stats.donated_events += surplus;
    }
}

fn fold_usage(core: &mut CoreState, used: u64, now_ns: u64) {
    core.stats.periods += 1;
    core.stats.used_total += used;
    core.stats.assigned_total += core.budget;
    core.ewma.update(used);

    if core.is_throttled() {
        core.stats.throttled_periods += 1;
        if let Some(since) = core.throttled_at {
            core.stats.throttled_time_ns += now_ns.saturating_sub(since);
        }
    }

    if core.pending_false_throttle && used < core.budget {
        let diff = core.budget - used;
        core.stats.record_false_throttle(used, core.budget);
        // Stop donating so much next period.
        core.ewma.hl2 = core.budget + diff;
        tracing::debug!(used, budget = core.budget, "false throttle");
    }
    core.pending_false_throttle = false;
}
