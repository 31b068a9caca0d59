use std::sync::Arc;

use memsched::{
    CounterError, EventKind, InlineDispatcher, OverflowOutcome, RecordingGate, Regulator,
    RegulatorConfig, SimCounter, SimProvider, UnitSettings, UnitTask, UsageStats,
};
use proptest::prelude::*;
use similar_asserts::assert_eq;

const PERIOD_NS: u64 = 1_000_000;

struct Harness {
    reg: Regulator<RecordingGate>,
    counters: Vec<Arc<SimCounter>>,
    /// Start of the current period on the test clock.
    period_start: u64,
}

impl Harness {
    fn new(units: usize, budget: u64) -> Self {
        Self::with_provider(units, budget, SimProvider::new())
    }

    fn with_provider(units: usize, budget: u64, provider: SimProvider) -> Self {
        let cfg = RegulatorConfig {
            event: EventKind::LlcMisses,
            ..Default::default()
        };
        let reg = Regulator::activate(
            cfg,
            vec![UnitSettings::limit(budget); units],
            &provider,
            RecordingGate::default(),
        )
        .expect("should activate");
        let counters = (0..units).map(|u| provider.counter(u)).collect();
        let period_start = reg.global().deadline_ns() - PERIOD_NS;
        Self {
            reg,
            counters,
            period_start,
        }
    }

    fn now(&self, fraction_pct: u64) -> u64 {
        self.period_start + PERIOD_NS * fraction_pct / 100
    }

    /// Consumes `events` on `unit` at `fraction_pct` of the current period and
    /// processes any overflow it raises.
    fn consume(&self, unit: usize, events: u64, fraction_pct: u64) -> Option<OverflowOutcome> {
        self.counters[unit].add(events);
        let task = self.reg.signal(unit)?;
        let UnitTask::Overflow { epoch } = task else {
            panic!("signal produced {task:?}");
        };
        let now = self.now(fraction_pct);
        let dispatcher = InlineDispatcher::new(&self.reg, now);
        Some(
            self.reg
                .handle_overflow_at(unit, epoch, now, &dispatcher)
                .expect("known unit"),
        )
    }

    fn rollover(&mut self) {
        let deadline = self.reg.global().deadline_ns();
        self.reg.rollover_at(deadline);
        self.period_start = deadline;
    }
}

#[test_log::test]
fn exhausted_unit_is_throttled_until_next_period() {
    let mut h = Harness::new(1, 1000);

    let outcome = h.consume(0, 1000, 40);
    assert_eq!(outcome, Some(OverflowOutcome::Throttled(1)));
    assert_eq!(h.reg.snapshot_unit(0).expect("unit").throttled, 1);

    h.rollover();

    let snap = h.reg.snapshot_unit(0).expect("unit");
    assert_eq!(snap.budget, 1000);
    assert_eq!(snap.cur_budget, 1000);
    assert_eq!(snap.throttled, 0);
    assert_eq!(h.reg.gate().stopped(0), 0);
}

#[test_log::test]
fn idle_peer_donates_to_exhausted_unit() {
    let mut h = Harness::new(2, 1000);

    // Unit 1 runs light for a few periods: hl2 goes 600, 400, 300.
    for _ in 0..3 {
        h.consume(0, 500, 50);
        h.consume(1, 200, 50);
        h.rollover();
    }
    assert_eq!(h.reg.snapshot_unit(1).expect("unit").ewma.hl2, 300);

    assert_eq!(h.consume(1, 40, 10), None);
    let outcome = h.consume(0, 1000, 20);

    // Unit 1 keeps 0.8 * 300 of its remaining 960 and donates the rest.
    assert_eq!(outcome, Some(OverflowOutcome::Reclaimed(720)));
    let x = h.reg.snapshot_unit(0).expect("unit");
    let y = h.reg.snapshot_unit(1).expect("unit");
    assert_eq!(x.throttled, 0);
    assert_eq!(x.cur_budget, 1720);
    assert_eq!(y.cur_budget, 280);
    assert_eq!(y.stats.donated_events, 720);
    assert_eq!(h.reg.global().pool.available(), 0);
}

#[test_log::test]
fn leftover_pool_is_discarded_at_rollover() {
    let mut h = Harness::new(2, 1000);
    let before = h.reg.snapshot();

    h.reg.global().pool.donate(500);
    h.rollover();

    assert_eq!(h.reg.global().pool.available(), 0);
    assert_eq!(h.reg.global().leftovers(), 1);
    for (old, new) in before.iter().zip(h.reg.snapshot()) {
        assert_eq!(old.budget, new.budget);
        assert_eq!(old.cur_budget, new.cur_budget);
        assert_eq!(old.throttled, new.throttled);
    }
}

#[test]
fn unit_without_counter_stays_unregulated() {
    let provider = SimProvider::new().with_failure(1, CounterError::NotHardware { unit: 1 });
    let mut h = Harness::with_provider(2, 1000, provider);

    assert_eq!(h.consume(1, 5000, 10), None);
    let outcome = h.consume(0, 1000, 50);
    assert_eq!(outcome, Some(OverflowOutcome::Throttled(1)));

    h.rollover();
    assert!(!h.reg.snapshot_unit(1).expect("unit").regulated);
}

#[test]
fn weight_mode_takes_effect_next_period() {
    let mut h = Harness::new(2, 1000);
    h.reg.set_weight(0, 1).expect("unit");
    h.reg.set_weight(1, 3).expect("unit");

    h.rollover();

    let max = h.reg.max_budget();
    assert_eq!(h.reg.snapshot_unit(0).expect("unit").budget, max / 4);
    assert_eq!(h.reg.snapshot_unit(1).expect("unit").budget, max * 3 / 4);
}

#[test]
fn reset_stats_restores_history() {
    let mut h = Harness::new(1, 1000);
    h.consume(0, 100, 50);
    h.rollover();
    assert_eq!(h.reg.snapshot_unit(0).expect("unit").ewma.hl2, 550);

    h.reg.reset_stats();

    let snap = h.reg.snapshot_unit(0).expect("unit");
    assert_eq!(snap.stats, UsageStats::default());
    assert_eq!(snap.ewma.hl2, 1000);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn recorded_usage_matches_counters(
        usage in prop::collection::vec(prop::collection::vec(0u64..1500, 3), 1..8)
    ) {
        let mut h = Harness::new(3, 1000);
        let mut expected = [0u64; 3];

        for period in &usage {
            for (unit, events) in period.iter().enumerate() {
                // Two chunks so overflow handling can interleave.
                h.consume(unit, events / 2, 30);
                h.consume(unit, events - events / 2, 60);
                expected[unit] += events;
            }
            h.rollover();
            prop_assert_eq!(h.reg.global().pool.available(), 0);
        }

        for (unit, total) in expected.iter().enumerate() {
            let snap = h.reg.snapshot_unit(unit).expect("unit");
            prop_assert_eq!(snap.stats.used_total, *total);
            prop_assert_eq!(snap.stats.periods, usage.len() as u64);
            prop_assert_eq!(snap.throttled, 0);
        }
    }
}
