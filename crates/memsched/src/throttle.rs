use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use derive_more::Display;
use error_stack::Result;

/// Failures of the scheduler collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ThrottleError {
    /// Another party holds the unit's run queue; retry at the next period.
    #[display("unit {unit}: run queue contended")]
    Contended { unit: usize },
    #[display("unit {unit}: {reason}")]
    Failed { unit: usize, reason: String },
}

impl core::error::Error for ThrottleError {}

/// Suspends and resumes the runnable workloads of a unit.
///
/// Called from the overflow and period paths: implementations must fail fast
/// instead of blocking. Resuming a unit with nothing suspended returns 0.
pub trait ThrottleGate: Send + Sync {
    /// Suspends the workloads of `unit`, returning how many were suspended.
    fn suspend(&self, unit: usize) -> Result<u32, ThrottleError>;

    /// Resumes the workloads of `unit`, returning how many were resumed.
    fn resume(&self, unit: usize) -> Result<u32, ThrottleError>;

    /// Workloads on `unit` that still exist. `None` when the gate does not
    /// know, which keeps the unit active.
    fn runnable(&self, _unit: usize) -> Option<u32> {
        None
    }

    /// Nice value of the most important workload on `unit`, if known.
    fn priority(&self, _unit: usize) -> Option<i32> {
        None
    }
}

impl<T: ThrottleGate + ?Sized> ThrottleGate for std::sync::Arc<T> {
    fn suspend(&self, unit: usize) -> Result<u32, ThrottleError> {
        (**self).suspend(unit)
    }

    fn resume(&self, unit: usize) -> Result<u32, ThrottleError> {
        (**self).resume(unit)
    }

    fn runnable(&self, unit: usize) -> Option<u32> {
        (**self).runnable(unit)
    }

    fn priority(&self, unit: usize) -> Option<i32> {
        (**self).priority(unit)
    }
}

/// In-memory gate that records every call. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingGate {
    units: Mutex<HashMap<usize, GateRecord>>,
    fail_suspend: AtomicBool,
    fail_resume: AtomicBool,
    contended: AtomicBool,
}

#[derive(Debug, Default, Clone, Copy)]
struct GateRecord {
    suspend_calls: u32,
    resume_calls: u32,
    stopped: u32,
    runnable: Option<u32>,
    priority: Option<i32>,
}

impl RecordingGate {
    fn with_record<T>(&self, unit: usize, f: impl FnOnce(&mut GateRecord) -> T) -> T {
        let mut units = self
            .units
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(units.entry(unit).or_default())
    }

    /// Marks `count` workloads of `unit` as stopped by someone else.
    pub fn park(&self, unit: usize, count: u32) {
        self.with_record(unit, |r| r.stopped += count);
    }

    pub fn set_fail_suspend(&self, fail: bool) {
        self.fail_suspend.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_resume(&self, fail: bool) {
        self.fail_resume.store(fail, Ordering::Relaxed);
    }

    pub fn set_contended(&self, contended: bool) {
        self.contended.store(contended, Ordering::Relaxed);
    }

    /// Reports `runnable` live workloads on `unit` from now on.
    pub fn set_runnable(&self, unit: usize, runnable: Option<u32>) {
        self.with_record(unit, |r| r.runnable = runnable);
    }

    pub fn set_priority(&self, unit: usize, nice: Option<i32>) {
        self.with_record(unit, |r| r.priority = nice);
    }

    pub fn suspend_calls(&self, unit: usize) -> u32 {
        self.with_record(unit, |r| r.suspend_calls)
    }

    pub fn resume_calls(&self, unit: usize) -> u32 {
        self.with_record(unit, |r| r.resume_calls)
    }

    /// Workloads of `unit` currently stopped.
    pub fn stopped(&self, unit: usize) -> u32 {
        self.with_record(unit, |r| r.stopped)
    }
}

impl ThrottleGate for RecordingGate {
    fn suspend(&self, unit: usize) -> Result<u32, ThrottleError> {
        self.with_record(unit, |r| r.suspend_calls += 1);
        if self.contended.load(Ordering::Relaxed) {
            return Err(error_stack::report!(ThrottleError::Contended { unit }));
        }
        if self.fail_suspend.load(Ordering::Relaxed) {
            return Err(error_stack::report!(ThrottleError::Failed {
                unit,
                reason: "suspend rejected".into(),
            }));
        }
        Ok(self.with_record(unit, |r| {
            r.stopped += 1;
            1
        }))
    }

    fn resume(&self, unit: usize) -> Result<u32, ThrottleError> {
        self.with_record(unit, |r| r.resume_calls += 1);
        if self.fail_resume.load(Ordering::Relaxed) {
            return Err(error_stack::report!(ThrottleError::Failed {
                unit,
                reason: "resume rejected".into(),
            }));
        }
        Ok(self.with_record(unit, |r| std::mem::take(&mut r.stopped)))
    }

    fn runnable(&self, unit: usize) -> Option<u32> {
        self.with_record(unit, |r| r.runnable)
    }

    fn priority(&self, unit: usize) -> Option<i32> {
        self.with_record(unit, |r| r.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_returns_everything_stopped() {
        let gate = RecordingGate::default();
        assert_eq!(gate.resume(0).expect("resume"), 0, "nothing suspended");

        gate.suspend(0).expect("suspend");
        gate.park(0, 2);
        assert_eq!(gate.resume(0).expect("resume"), 3);
        assert_eq!(gate.stopped(0), 0);
        assert_eq!(gate.suspend_calls(0), 1);
        assert_eq!(gate.resume_calls(0), 2);
    }

    #[test]
    fn contention_fails_fast() {
        let gate = RecordingGate::default();
        gate.set_contended(true);
        let err = gate.suspend(3).expect_err("should be contended");
        assert_eq!(err.current_context(), &ThrottleError::Contended { unit: 3 });
        assert_eq!(gate.stopped(3), 0);
    }

    #[test]
    fn workload_queries_default_to_unknown() {
        let gate = RecordingGate::default();
        assert_eq!(gate.runnable(0), None);
        assert_eq!(gate.priority(0), None);

        gate.set_runnable(0, Some(0));
        gate.set_priority(0, Some(-5));
        assert_eq!(gate.runnable(0), Some(0));
        assert_eq!(gate.priority(0), Some(-5));
        assert_eq!(gate.runnable(1), None);
    }
}
