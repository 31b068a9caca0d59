//! Hardware usage monitoring.
//!
//! An [`EventCounter`] is the raw per-unit counter (a PMU event in the daemon,
//! a [`SimCounter`] in tests). [`UsageMonitor`] wraps it with the period
//! bookkeeping the regulator needs: the raw value at period start and the raw
//! value at which the next overflow signal fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use derive_more::Display;
use error_stack::Result;
use serde::{Deserialize, Serialize};

/// Event used as the memory bandwidth proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Last-level cache misses.
    #[display("llc-misses")]
    LlcMisses,
    /// Software CPU clock, for machines without a usable PMU.
    #[display("cpu-clock")]
    CpuClock,
}

/// Reasons a counter could not be created for a unit.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum CounterError {
    #[display("unit {unit}: event not supported")]
    Unsupported { unit: usize },
    #[display("unit {unit}: not a hardware event")]
    NotHardware { unit: usize },
    #[display("unit {unit}: unable to create counter (errno {errno})")]
    Os { unit: usize, errno: i32 },
}

impl core::error::Error for CounterError {}

impl CounterError {
    /// Missing PMU support is an expected deployment condition, anything else is not.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Unsupported { .. } | Self::NotHardware { .. })
    }
}

/// Raw event counter bound to one unit.
///
/// All methods may be called from the signal context and must not block.
pub trait EventCounter: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    /// Cumulative raw count.
    fn read(&self) -> u64;
}

/// Creates counters, one per unit.
pub trait CounterProvider {
    fn create(&self, unit: usize, kind: EventKind) -> Result<Box<dyn EventCounter>, CounterError>;
}

const DISARMED: u64 = u64::MAX;

/// Period-aware wrapper around a unit's counter.
pub struct UsageMonitor {
    unit: usize,
    counter: Box<dyn EventCounter>,
    /// Raw count at the start of the current period.
    base: AtomicU64,
    /// Raw count at which the next overflow fires.
    armed_at: AtomicU64,
    running: AtomicBool,
}

impl std::fmt::Debug for UsageMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMonitor")
            .field("unit", &self.unit)
            .field("base", &self.base.load(Ordering::Relaxed))
            .field("armed_at", &self.armed_at.load(Ordering::Relaxed))
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl UsageMonitor {
    /// Creates a stopped monitor whose first overflow fires after `threshold` events.
    pub fn create(
        provider: &dyn CounterProvider,
        unit: usize,
        kind: EventKind,
        threshold: u64,
    ) -> Result<Self, CounterError> {
        let counter = provider.create(unit, kind)?;
        let base = counter.read();
        Ok(Self {
            unit,
            counter,
            base: AtomicU64::new(base),
            armed_at: AtomicU64::new(base.saturating_add(threshold)),
            running: AtomicBool::new(false),
        })
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn start(&self) {
        self.counter.enable();
        self.running.store(true, Ordering::Release);
    }

    /// Stops counting and returns the events consumed since the period base,
    /// which then moves to the current raw value.
    pub fn stop(&self) -> u64 {
        self.running.store(false, Ordering::Release);
        self.counter.disable();
        let raw = self.counter.read();
        let base = self.base.swap(raw, Ordering::AcqRel);
        self.armed_at.store(DISARMED, Ordering::Release);
        raw.saturating_sub(base)
    }

    /// Events consumed in the current period so far.
    pub fn read_delta(&self) -> u64 {
        self.counter
            .read()
            .saturating_sub(self.base.load(Ordering::Acquire))
    }

    /// Arms the next overflow `threshold` events from now.
    pub fn reprogram(&self, threshold: u64) {
        let raw = self.counter.read();
        self.armed_at
            .store(raw.saturating_add(threshold), Ordering::Release);
    }

    /// Signal-context check. Returns `true` once per threshold crossing.
    pub fn poll(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let armed = self.armed_at.load(Ordering::Acquire);
        if armed == DISARMED || self.counter.read() < armed {
            return false;
        }
        self.armed_at
            .compare_exchange(armed, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// In-memory counter driven by the caller.
#[derive(Debug, Default)]
pub struct SimCounter {
    count: AtomicU64,
    enabled: AtomicBool,
}

impl SimCounter {
    /// Records `events` if the counter is enabled.
    pub fn add(&self, events: u64) {
        if self.enabled.load(Ordering::Acquire) {
            self.count.fetch_add(events, Ordering::AcqRel);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl EventCounter for Arc<SimCounter> {
    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    fn read(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

/// Provider of [`SimCounter`]s with optional per-unit creation failures.
#[derive(Debug, Default)]
pub struct SimProvider {
    counters: Mutex<HashMap<usize, Arc<SimCounter>>>,
    failures: HashMap<usize, CounterError>,
}

impl SimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes counter creation fail for `unit`.
    pub fn with_failure(mut self, unit: usize, error: CounterError) -> Self {
        self.failures.insert(unit, error);
        self
    }

    /// Counter of `unit`, created on first use.
    pub fn counter(&self, unit: usize) -> Arc<SimCounter> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(counters.entry(unit).or_default())
    }
}

impl CounterProvider for SimProvider {
    fn create(&self, unit: usize, _kind: EventKind) -> Result<Box<dyn EventCounter>, CounterError> {
        if let Some(error) = self.failures.get(&unit) {
            return Err(error_stack::report!(error.clone()));
        }
        Ok(Box::new(self.counter(unit)))
    }
}
