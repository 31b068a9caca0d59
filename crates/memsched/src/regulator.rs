use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use error_stack::Result;

use crate::config::{mb_to_events, RegulatorConfig, DEFAULT_WEIGHT};
use crate::counter::{CounterProvider, UsageMonitor};
use crate::state::{BudgetMode, CoreState, GlobalState, Intensity, UnitSettings, UsageBoard};
use crate::stats::UnitSnapshot;
use crate::throttle::ThrottleGate;
use crate::MemschedError;

/// One execution unit: its counter, control state and configuration.
#[derive(Debug)]
pub(crate) struct Unit {
    pub(crate) id: usize,
    /// `None` when no counter could be created; the unit is then unregulated.
    pub(crate) monitor: Option<UsageMonitor>,
    pub(crate) core: Mutex<CoreState>,
    pub(crate) settings: Mutex<UnitSettings>,
    pub(crate) board: UsageBoard,
}

impl Unit {
    pub(crate) fn lock_core(&self) -> MutexGuard<'_, CoreState> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_settings(&self) -> MutexGuard<'_, UnitSettings> {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Equal share of the maximum bandwidth for each of `units` units.
pub fn equal_shares(cfg: &RegulatorConfig, units: usize) -> Vec<UnitSettings> {
    let pct = (100 / units.max(1)) as u8;
    vec![UnitSettings::limit(cfg.budget_for_pct(pct)); units]
}

/// Memory bandwidth regulator for a fixed set of execution units.
///
/// The handlers come in `_at` variants taking an explicit timestamp
/// (nanoseconds since activation) so the control logic can be driven
/// deterministically; the daemon passes [`Regulator::now_ns`].
#[derive(Debug)]
pub struct Regulator<G: ThrottleGate> {
    pub(crate) cfg: RegulatorConfig,
    pub(crate) ceiling_pct: AtomicU8,
    pub(crate) reclaim_enabled: AtomicBool,
    pub(crate) global: GlobalState,
    pub(crate) units: Vec<Unit>,
    pub(crate) gate: G,
    origin: Instant,
    active: AtomicBool,
}

impl<G: ThrottleGate> Regulator<G> {
    /// Creates a counter for every unit and starts regulating.
    ///
    /// `settings[i]` configures unit `i`. A unit whose counter cannot be
    /// created stays unregulated; this is not an error.
    pub fn activate(
        cfg: RegulatorConfig,
        settings: Vec<UnitSettings>,
        provider: &dyn CounterProvider,
        gate: G,
    ) -> Result<Self, MemschedError> {
        cfg.validate()?;
        if settings.is_empty() {
            return Err(error_stack::report!(MemschedError::invalid_config(
                "at least one unit is required"
            )));
        }

        let max_budget = cfg.max_budget();
        let monitors: Vec<Option<UsageMonitor>> = (0..settings.len())
            .map(|id| match UsageMonitor::create(provider, id, cfg.event, max_budget) {
                Ok(monitor) => {
                    tracing::info!(unit = id, event = %cfg.event, "enabled counter");
                    Some(monitor)
                }
                Err(report) if report.current_context().is_expected() => {
                    tracing::info!(unit = id, error = %report.current_context(), "regulation disabled");
                    None
                }
                Err(report) => {
                    tracing::error!(unit = id, error = ?report, "unable to create counter, regulation disabled");
                    None
                }
            })
            .collect();

        // Unregulated units hold no share of the bandwidth.
        let weight_sum: u64 = settings
            .iter()
            .zip(&monitors)
            .filter(|(_, monitor)| monitor.is_some())
            .filter_map(|(s, _)| match s.mode {
                BudgetMode::Weight(w) => Some(u64::from(w)),
                BudgetMode::Limit(_) => None,
            })
            .sum();

        let mut units = Vec::with_capacity(settings.len());
        for (id, (unit_settings, monitor)) in settings.into_iter().zip(monitors).enumerate() {
            let (budget, weight) = match unit_settings.mode {
                BudgetMode::Limit(events) => (events, 0),
                BudgetMode::Weight(w) => (weighted(max_budget, w, weight_sum), w),
            };
            if let Some(monitor) = monitor.as_ref() {
                monitor.reprogram(budget.max(1));
            }

            let core = CoreState::new(budget, unit_settings.intensity, 0);
            let board = UsageBoard::default();
            board.publish(&core);
            board.weight.store(weight, Ordering::Release);

            tracing::info!(
                unit = id,
                budget,
                budget_mb = crate::config::events_to_mb(budget, cfg.period),
                "initialized unit"
            );

            units.push(Unit {
                id,
                monitor,
                core: Mutex::new(core),
                settings: Mutex::new(unit_settings),
                board,
            });
        }

        let regulator = Self {
            ceiling_pct: AtomicU8::new(cfg.ceiling_pct),
            reclaim_enabled: AtomicBool::new(cfg.reclaim),
            global: GlobalState::new(cfg.period_ns()),
            cfg,
            units,
            gate,
            origin: Instant::now(),
            active: AtomicBool::new(true),
        };

        regulator.global.restart_deadline(regulator.now_ns());
        for monitor in regulator.units.iter().filter_map(|u| u.monitor.as_ref()) {
            monitor.start();
        }

        tracing::info!(
            units = regulator.units.len(),
            regulated = regulator.regulated_units(),
            period_us = regulator.cfg.period.as_micros() as u64,
            max_bandwidth_mb = regulator.cfg.max_bandwidth_mb,
            max_budget,
            reclaim = regulator.cfg.reclaim,
            "memory bandwidth regulation enabled"
        );

        Ok(regulator)
    }

    /// Stops every counter and releases throttled workloads.
    pub fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        for unit in &self.units {
            let Some(monitor) = unit.monitor.as_ref() else {
                continue;
            };
            let mut core = unit.lock_core();
            monitor.stop();
            if core.throttled > 0 {
                match self.gate.resume(unit.id) {
                    Ok(count) => {
                        tracing::info!(unit = unit.id, count, "released throttled tasks")
                    }
                    Err(report) => {
                        tracing::warn!(unit = unit.id, error = ?report, "failed to release throttled tasks")
                    }
                }
            }
            core.throttled = 0;
            core.throttled_at = None;
        }
        tracing::info!("memory bandwidth regulation disabled");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &RegulatorConfig {
        &self.cfg
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    pub fn global(&self) -> &GlobalState {
        &self.global
    }

    pub fn units(&self) -> usize {
        self.units.len()
    }

    pub fn regulated_units(&self) -> usize {
        self.units.iter().filter(|u| u.monitor.is_some()).count()
    }

    pub fn is_regulated(&self, unit: usize) -> bool {
        self.units
            .get(unit)
            .is_some_and(|u| u.monitor.is_some())
    }

    /// Nanoseconds since activation.
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub fn max_budget(&self) -> u64 {
        self.cfg.max_budget()
    }

    pub fn ceiling_pct(&self) -> u8 {
        self.ceiling_pct.load(Ordering::Relaxed)
    }

    pub fn reclaim_enabled(&self) -> bool {
        self.reclaim_enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn unit(&self, unit: usize) -> Result<&Unit, MemschedError> {
        self.units
            .get(unit)
            .ok_or_else(|| error_stack::report!(MemschedError::unknown_unit(unit)))
    }

    /// Budget of a weighted unit given the weights published by the regulated
    /// units that are not idle.
    pub(crate) fn weighted_budget(&self, weight: u32) -> u64 {
        let sum: u64 = self
            .units
            .iter()
            .filter(|u| u.monitor.is_some() && !u.board.is_idle())
            .map(|u| u64::from(u.board.weight.load(Ordering::Acquire)))
            .sum();
        weighted(self.max_budget(), weight, sum)
    }

    // Configuration surface. Writes take effect at the next period boundary.

    pub fn set_limit(&self, unit: usize, events: u64) -> Result<(), MemschedError> {
        if events == 0 {
            return Err(error_stack::report!(MemschedError::invalid_config(
                "budget must be at least one event"
            )));
        }
        let u = self.unit(unit)?;
        u.lock_settings().mode = BudgetMode::Limit(events);
        u.board.weight.store(0, Ordering::Release);
        tracing::debug!(unit, events, "new budget requested");
        Ok(())
    }

    pub fn set_limit_mb(&self, unit: usize, mb: u64) -> Result<(), MemschedError> {
        self.set_limit(unit, mb_to_events(mb, self.cfg.period))
    }

    /// Switches `unit` to weight mode. Weight 0 selects [`DEFAULT_WEIGHT`].
    pub fn set_weight(&self, unit: usize, weight: u32) -> Result<(), MemschedError> {
        let weight = if weight == 0 { DEFAULT_WEIGHT } else { weight };
        let u = self.unit(unit)?;
        u.lock_settings().mode = BudgetMode::Weight(weight);
        u.board.weight.store(weight, Ordering::Release);
        tracing::debug!(unit, weight, "new weight requested");
        Ok(())
    }

    pub fn set_intensity(&self, unit: usize, intensity: u8) -> Result<(), MemschedError> {
        let intensity = Intensity::parse(intensity)?;
        self.unit(unit)?.lock_settings().intensity = intensity;
        Ok(())
    }

    pub fn set_ceiling_pct(&self, pct: u8) -> Result<(), MemschedError> {
        if !(1..=100).contains(&pct) {
            return Err(error_stack::report!(MemschedError::invalid_config(
                "ceiling_pct must be in [1, 100]"
            )));
        }
        self.ceiling_pct.store(pct, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_reclaim_enabled(&self, enabled: bool) {
        self.reclaim_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn settings(&self, unit: usize) -> Result<UnitSettings, MemschedError> {
        Ok(*self.unit(unit)?.lock_settings())
    }

    /// Clears the statistics of every unit.
    pub fn reset_stats(&self) {
        for unit in self.units.iter().filter(|u| u.monitor.is_some()) {
            let mut core = unit.lock_core();
            core.reset_stats();
            unit.board.publish(&core);
        }
        tracing::info!("cleared statistics");
    }

    pub fn snapshot_unit(&self, unit: usize) -> Result<UnitSnapshot, MemschedError> {
        let u = self.unit(unit)?;
        if u.monitor.is_none() {
            return Ok(UnitSnapshot::unregulated(unit));
        }
        let core = u.lock_core();
        Ok(UnitSnapshot::from_state(unit, &core, u.board.is_idle()))
    }

    /// Per-unit snapshots. Each is consistent for its unit only.
    pub fn snapshot(&self) -> Vec<UnitSnapshot> {
        (0..self.units.len())
            .filter_map(|unit| self.snapshot_unit(unit).ok())
            .collect()
    }
}

fn weighted(max_budget: u64, weight: u32, weight_sum: u64) -> u64 {
    if weight_sum == 0 {
        return max_budget;
    }
    (max_budget as u128 * u128::from(weight) / u128::from(weight_sum)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterError, SimProvider};
    use crate::throttle::RecordingGate;

    fn regulator(settings: Vec<UnitSettings>, provider: &SimProvider) -> Regulator<RecordingGate> {
        Regulator::activate(
            RegulatorConfig::default(),
            settings,
            provider,
            RecordingGate::default(),
        )
        .expect("should activate")
    }

    #[test]
    fn equal_shares_split_max_bandwidth() {
        let cfg = RegulatorConfig::default();
        let shares = equal_shares(&cfg, 4);
        assert_eq!(shares.len(), 4);
        assert_eq!(shares[0].mode, BudgetMode::Limit(cfg.budget_for_pct(25)));
    }

    #[test]
    fn activation_starts_counters() {
        let provider = SimProvider::new();
        let reg = regulator(vec![UnitSettings::limit(1000); 2], &provider);

        assert_eq!(reg.units(), 2);
        assert_eq!(reg.regulated_units(), 2);
        assert!(provider.counter(0).is_enabled());
        assert!(provider.counter(1).is_enabled());
    }

    #[test_log::test]
    fn counter_failure_only_disables_that_unit() {
        let provider = SimProvider::new().with_failure(1, CounterError::Unsupported { unit: 1 });
        let reg = regulator(vec![UnitSettings::limit(1000); 3], &provider);

        assert_eq!(reg.regulated_units(), 2);
        assert!(!reg.is_regulated(1));
        assert!(!reg.snapshot_unit(1).expect("unit exists").regulated);
        assert!(reg.snapshot_unit(2).expect("unit exists").regulated);
    }

    #[test]
    fn rejects_empty_unit_list() {
        let provider = SimProvider::new();
        let result = Regulator::activate(
            RegulatorConfig::default(),
            Vec::new(),
            &provider,
            RecordingGate::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn weight_mode_splits_max_budget() {
        let provider = SimProvider::new();
        let settings = vec![
            UnitSettings {
                mode: BudgetMode::Weight(1024),
                intensity: Intensity::Auto,
            },
            UnitSettings {
                mode: BudgetMode::Weight(3072),
                intensity: Intensity::Auto,
            },
        ];
        let reg = regulator(settings, &provider);
        let max = reg.max_budget();

        assert_eq!(reg.snapshot_unit(0).expect("unit").budget, max / 4);
        assert_eq!(reg.snapshot_unit(1).expect("unit").budget, max * 3 / 4);
    }

    #[test_log::test]
    fn unregulated_units_hold_no_weight() {
        let provider = SimProvider::new().with_failure(1, CounterError::Unsupported { unit: 1 });
        let settings = vec![
            UnitSettings {
                mode: BudgetMode::Weight(1024),
                intensity: Intensity::Auto,
            };
            2
        ];
        let reg = regulator(settings, &provider);

        assert_eq!(reg.snapshot_unit(0).expect("unit").budget, reg.max_budget());
        let counter = provider.counter(0);
        counter.add(reg.max_budget() - 1);
        assert!(reg.signal(0).is_none(), "armed at the full budget");
        counter.add(1);
        assert!(reg.signal(0).is_some());
        assert_eq!(reg.weighted_budget(1024), reg.max_budget());
    }

    #[test]
    fn idle_units_hold_no_weight() {
        let provider = SimProvider::new();
        let settings = vec![
            UnitSettings {
                mode: BudgetMode::Weight(1024),
                intensity: Intensity::Auto,
            };
            2
        ];
        let reg = regulator(settings, &provider);
        assert_eq!(reg.weighted_budget(1024), reg.max_budget() / 2);

        reg.units[1].board.set_idle(true);
        assert_eq!(reg.weighted_budget(1024), reg.max_budget());
    }

    #[test]
    fn configuration_surface_validates_input() {
        let provider = SimProvider::new();
        let reg = regulator(vec![UnitSettings::limit(1000)], &provider);

        assert!(reg.set_limit(0, 0).is_err());
        assert!(reg.set_limit(5, 100).is_err(), "unknown unit");
        assert!(reg.set_intensity(0, 101).is_err());
        assert!(reg.set_ceiling_pct(0).is_err());

        reg.set_weight(0, 0).expect("weight 0 selects default");
        assert_eq!(
            reg.settings(0).expect("unit").mode,
            BudgetMode::Weight(DEFAULT_WEIGHT)
        );

        reg.set_intensity(0, 100).expect("valid intensity");
        assert_eq!(reg.settings(0).expect("unit").intensity, Intensity::Conservative);
    }

    #[test]
    fn deactivate_stops_counters_and_releases() {
        let provider = SimProvider::new();
        let reg = regulator(vec![UnitSettings::limit(1000)], &provider);
        reg.units[0].lock_core().throttled = 2;

        reg.deactivate();

        assert!(!reg.is_active());
        assert!(!provider.counter(0).is_enabled());
        assert_eq!(reg.gate.resume_calls(0), 1);
        assert_eq!(reg.snapshot_unit(0).expect("unit").throttled, 0);

        // Second call is a no-op.
        reg.deactivate();
        assert_eq!(reg.gate.resume_calls(0), 1);
    }
}
