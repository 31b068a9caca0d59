//! Fire-and-forget signalling between units.
//!
//! A task posted to a unit runs later on that unit's own worker. There is no
//! reply channel: the requester looks at the shared pool afterwards.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::throttle::ThrottleGate;
use crate::Regulator;

/// Deferred work executed on a unit's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitTask {
    /// The unit's counter crossed its threshold during `epoch`.
    Overflow { epoch: u64 },
    /// `requester` asks the unit to donate its predicted surplus.
    Solicit { epoch: u64, requester: usize },
}

impl UnitTask {
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Overflow { epoch } | Self::Solicit { epoch, .. } => *epoch,
        }
    }
}

/// Delivers [`UnitTask`]s to unit workers.
pub trait Dispatcher: Send + Sync {
    /// Queues `task` on `unit`. Never blocks; a task that cannot be queued is dropped.
    fn post(&self, unit: usize, task: UnitTask);

    /// Gives posted tasks time to run before the caller looks at their effect.
    fn settle(&self, delay: Duration);
}

/// Runs every posted task immediately on the caller's thread.
///
/// Deterministic stand-in for per-unit workers in tests and simulations.
pub struct InlineDispatcher<'a, G: ThrottleGate> {
    regulator: &'a Regulator<G>,
    now_ns: u64,
}

impl<'a, G: ThrottleGate> InlineDispatcher<'a, G> {
    pub fn new(regulator: &'a Regulator<G>, now_ns: u64) -> Self {
        Self { regulator, now_ns }
    }
}

impl<G: ThrottleGate> Dispatcher for InlineDispatcher<'_, G> {
    fn post(&self, unit: usize, task: UnitTask) {
        if let Err(report) = self.regulator.run_task_at(unit, task, self.now_ns, self) {
            tracing::warn!(unit, error = ?report, "inline task failed");
        }
    }

    fn settle(&self, _delay: Duration) {}
}

/// Records posted tasks without running them.
#[derive(Debug, Default)]
pub struct QueueDispatcher {
    posted: Mutex<Vec<(usize, UnitTask)>>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything posted so far.
    pub fn take(&self) -> Vec<(usize, UnitTask)> {
        let mut posted = self
            .posted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *posted)
    }
}

impl Dispatcher for QueueDispatcher {
    fn post(&self, unit: usize, task: UnitTask) {
        self.posted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((unit, task));
    }

    fn settle(&self, _delay: Duration) {}
}
