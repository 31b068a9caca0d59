use std::time::Duration;

use error_stack::Result;
use serde::{Deserialize, Serialize};

use crate::counter::EventKind;
use crate::MemschedError;

/// Size of the transfer unit counted by one LLC-miss event.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Weight assumed when a unit is switched to weight mode with weight 0.
pub const DEFAULT_WEIGHT: u32 = 1024;

/// Scheduler load weights for nice values -20 through 19. Each step is
/// roughly a 1.25x change in share.
const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, // -20
    29154, 23254, 18705, 14949, 11916, // -15
    9548, 7620, 6100, 4904, 3906, // -10
    3121, 2501, 1991, 1586, 1277, // -5
    1024, 820, 655, 526, 423, // 0
    335, 272, 215, 172, 137, // 5
    110, 87, 70, 56, 45, // 10
    36, 29, 23, 18, 15, // 15
];

/// Weight of a workload with the given nice value. Out-of-range values clamp.
pub fn nice_to_weight(nice: i32) -> u32 {
    NICE_TO_WEIGHT[(nice.clamp(-20, 19) + 20) as usize]
}

/// Converts a bandwidth in MB/s into the number of events one period may consume.
pub fn mb_to_events(mb: u64, period: Duration) -> u64 {
    let bytes = mb as u128 * 1024 * 1024 * period.as_micros();
    (bytes / (CACHE_LINE_SIZE as u128 * 1_000_000)) as u64
}

/// Converts an event budget per period back into MB/s, rounding up.
pub fn events_to_mb(events: u64, period: Duration) -> u64 {
    let divisor = 1024u128 * 1024 * period.as_micros().max(1);
    let bytes = events as u128 * CACHE_LINE_SIZE as u128 * 1_000_000;
    bytes.div_ceil(divisor) as u64
}

/// Global parameters of the regulation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegulatorConfig {
    /// Length of one regulation period.
    #[serde(with = "duration_us")]
    pub period: Duration,
    /// Maximum memory bandwidth of the system in MB/s.
    pub max_bandwidth_mb: u64,
    /// System utilization (percent of the summed assigned budgets) above which
    /// peers are no longer asked to donate.
    pub ceiling_pct: u8,
    /// Whether exhausted units may borrow from the shared pool at all.
    pub reclaim: bool,
    /// Donate the predicted surplus at every period start instead of waiting
    /// for a solicitation.
    pub proactive_donation: bool,
    /// Events requested from the pool when a unit has used up its whole
    /// assigned budget.
    pub reclaim_quantum: u64,
    /// Smallest surplus a solicited peer bothers to donate.
    pub min_donation: u64,
    /// Below this much remaining period time peers are not solicited.
    #[serde(with = "duration_us")]
    pub min_reclaim_window: Duration,
    /// Time granted to solicited peers before the requester retries.
    #[serde(with = "duration_us")]
    pub solicit_delay: Duration,
    /// Hardware event used as the bandwidth proxy.
    pub event: EventKind,
    /// Derive each unit's weight from the priority of its workloads at every
    /// period start, overriding the configured mode.
    pub task_priority: bool,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            // Worst-case streaming bandwidth of the reference platform.
            max_bandwidth_mb: 2100,
            ceiling_pct: 90,
            reclaim: true,
            proactive_donation: false,
            reclaim_quantum: 1000,
            min_donation: 100,
            min_reclaim_window: Duration::from_micros(100),
            solicit_delay: Duration::from_micros(10),
            event: EventKind::LlcMisses,
            task_priority: false,
        }
    }
}

impl RegulatorConfig {
    /// Rejects values the control loop cannot work with.
    pub fn validate(&self) -> Result<(), MemschedError> {
        if self.period.is_zero() {
            return Err(error_stack::report!(MemschedError::invalid_config(
                "period must be greater than zero"
            )));
        }
        if !(1..=100).contains(&self.ceiling_pct) {
            return Err(error_stack::report!(MemschedError::invalid_config(
                "ceiling_pct must be in [1, 100]"
            )));
        }
        if self.max_bandwidth_mb == 0 {
            return Err(error_stack::report!(MemschedError::invalid_config(
                "max_bandwidth_mb must be set"
            )));
        }
        if self.max_budget() == 0 {
            return Err(error_stack::report!(MemschedError::invalid_config(format!(
                "{} MB/s over {:?} is less than one event per period",
                self.max_bandwidth_mb, self.period
            ))));
        }
        if self.min_reclaim_window >= self.period {
            return Err(error_stack::report!(MemschedError::invalid_config(
                "min_reclaim_window must be shorter than the period"
            )));
        }
        Ok(())
    }

    /// Events per period at the maximum system bandwidth.
    pub fn max_budget(&self) -> u64 {
        mb_to_events(self.max_bandwidth_mb, self.period)
    }

    pub fn period_ns(&self) -> u64 {
        self.period.as_nanos() as u64
    }

    /// Budget in events for a share of the maximum bandwidth.
    pub fn budget_for_pct(&self, pct: u8) -> u64 {
        let mb = self.max_bandwidth_mb * u64::from(pct) / 100;
        mb_to_events(mb, self.period)
    }
}

mod duration_us {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}
