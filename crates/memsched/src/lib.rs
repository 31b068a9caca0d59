//! Per-processor memory bandwidth regulation.
//!
//! Every execution unit gets a budget of memory events per fixed period. A
//! hardware counter watches consumption; when a unit exhausts its budget the
//! [`Regulator`] first tries to borrow from a shared pool that lightly loaded
//! peers donate into, and otherwise suspends the unit's workloads through a
//! [`ThrottleGate`] until the next period starts.
//!
//! The engine is platform neutral. Counters come from a [`CounterProvider`],
//! deferred work is delivered by a [`Dispatcher`], and time is passed in
//! explicitly so the control loop can be replayed in tests.

use error_stack::Report;

mod config;
mod counter;
mod dispatch;
mod error;
mod overflow;
mod period;
mod reclaim;
mod regulator;
mod state;
mod stats;
mod throttle;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use config::{
    events_to_mb, mb_to_events, nice_to_weight, RegulatorConfig, CACHE_LINE_SIZE, DEFAULT_WEIGHT,
};
pub use counter::{
    CounterError, CounterProvider, EventCounter, EventKind, SimCounter, SimProvider, UsageMonitor,
};
pub use dispatch::{Dispatcher, InlineDispatcher, QueueDispatcher, UnitTask};
pub use error::MemschedError;
pub use overflow::OverflowOutcome;
pub use reclaim::{compute_need, donatable_surplus, BudgetPool, MAX_RECLAIM_ATTEMPTS};
pub use regulator::{equal_shares, Regulator};
pub use state::{
    BudgetMode, CoreState, GlobalState, Intensity, UnitSettings, UsageBoard, UsageEwma,
};
pub use stats::{UnitSnapshot, UsageStats, ERROR_BUCKETS};
pub use throttle::{RecordingGate, ThrottleError, ThrottleGate};
