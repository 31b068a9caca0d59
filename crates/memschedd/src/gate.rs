//! Suspends the processes bound to a CPU with `SIGSTOP`/`SIGCONT`.

use std::io;
use std::sync::{Mutex, MutexGuard, TryLockError};

use memsched::{ThrottleError, ThrottleGate};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("signal {signal} to pid {pid} failed: {source}")]
    Signal {
        pid: i32,
        signal: i32,
        source: io::Error,
    },
}

impl GateError {
    fn is_gone(&self) -> bool {
        match self {
            Self::Signal { source, .. } => source.raw_os_error() == Some(libc::ESRCH),
        }
    }
}

fn send(pid: i32, signal: i32) -> Result<(), GateError> {
    // SAFETY: kill has no memory side effects.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    Err(GateError::Signal {
        pid,
        signal,
        source: io::Error::last_os_error(),
    })
}

/// State letter and nice value from `/proc/<pid>/stat`, `None` once the
/// process is gone.
fn proc_stat(pid: i32) -> Option<(char, i32)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses.
    let fields: Vec<&str> = stat[stat.rfind(')')? + 1..].split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let nice = fields.get(16)?.parse().ok()?;
    Some((state, nice))
}

fn is_live(state: char) -> bool {
    !matches!(state, 'Z' | 'X' | 'x')
}

#[derive(Debug, Default)]
struct UnitProcesses {
    /// Whether any process was ever registered on the unit.
    tracked: bool,
    pids: Vec<i32>,
    stopped: Vec<i32>,
}

impl UnitProcesses {
    fn live(&self) -> impl Iterator<Item = (char, i32)> + '_ {
        self.pids
            .iter()
            .filter_map(|&pid| proc_stat(pid))
            .filter(|(state, _)| is_live(*state))
    }
}

/// Registry of the processes regulated on each unit.
///
/// Every unit has its own lock. The overflow and period paths only ever
/// `try_lock` it, so a concurrent registration on the same unit makes them
/// fail fast with [`ThrottleError::Contended`] while other units proceed.
#[derive(Debug)]
pub struct SignalGate {
    units: Vec<Mutex<UnitProcesses>>,
}

impl SignalGate {
    pub fn new(units: usize) -> Self {
        Self {
            units: (0..units).map(|_| Mutex::default()).collect(),
        }
    }

    pub fn register(&self, unit: usize, pid: i32) {
        let Some(slot) = self.units.get(unit) else {
            tracing::warn!(unit, pid, "process registered on an unknown unit, ignoring");
            return;
        };
        let mut entry = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entry.tracked = true;
        if !entry.pids.contains(&pid) {
            entry.pids.push(pid);
        }
        tracing::info!(unit, pid, "registered process");
    }

    fn try_unit(&self, unit: usize) -> Option<Result<MutexGuard<'_, UnitProcesses>, ThrottleError>> {
        let slot = self.units.get(unit)?;
        Some(match slot.try_lock() {
            Ok(entry) => Ok(entry),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(ThrottleError::Contended { unit }),
        })
    }

    fn with_unit(
        &self,
        unit: usize,
        f: impl FnOnce(&mut UnitProcesses) -> Result<u32, ThrottleError>,
    ) -> error_stack::Result<u32, ThrottleError> {
        match self.try_unit(unit) {
            // Nothing is ever registered on units outside the registry.
            None => Ok(0),
            Some(Ok(mut entry)) => f(&mut entry).map_err(|e| error_stack::report!(e)),
            Some(Err(e)) => Err(error_stack::report!(e)),
        }
    }
}

impl ThrottleGate for SignalGate {
    fn suspend(&self, unit: usize) -> error_stack::Result<u32, ThrottleError> {
        self.with_unit(unit, |entry| {
            let mut failures = Vec::new();
            let mut count = 0;
            let mut gone = Vec::new();
            for &pid in &entry.pids {
                if entry.stopped.contains(&pid) {
                    continue;
                }
                match send(pid, libc::SIGSTOP) {
                    Ok(()) => {
                        entry.stopped.push(pid);
                        count += 1;
                    }
                    Err(e) if e.is_gone() => gone.push(pid),
                    Err(e) => failures.push(e),
                }
            }
            if !gone.is_empty() {
                tracing::debug!(unit, ?gone, "dropping exited processes");
                entry.pids.retain(|p| !gone.contains(p));
            }
            if count == 0 && !failures.is_empty() {
                return Err(ThrottleError::Failed {
                    unit,
                    reason: failures[0].to_string(),
                });
            }
            for e in &failures {
                tracing::warn!(unit, error = %e, "failed to stop process");
            }
            Ok(count)
        })
    }

    fn resume(&self, unit: usize) -> error_stack::Result<u32, ThrottleError> {
        self.with_unit(unit, |entry| {
            let mut count = 0;
            let mut pending = Vec::new();
            for pid in entry.stopped.drain(..) {
                match send(pid, libc::SIGCONT) {
                    Ok(()) => count += 1,
                    Err(e) if e.is_gone() => {}
                    Err(e) => {
                        tracing::warn!(unit, error = %e, "failed to continue process");
                        pending.push(pid);
                    }
                }
            }
            entry.stopped = pending;
            if count == 0 && !entry.stopped.is_empty() {
                return Err(ThrottleError::Failed {
                    unit,
                    reason: format!("{} processes left stopped", entry.stopped.len()),
                });
            }
            Ok(count)
        })
    }

    fn runnable(&self, unit: usize) -> Option<u32> {
        let entry = self.try_unit(unit)?.ok()?;
        if !entry.tracked {
            return None;
        }
        Some(entry.live().count() as u32)
    }

    fn priority(&self, unit: usize) -> Option<i32> {
        let entry = self.try_unit(unit)?.ok()?;
        entry.live().map(|(_, nice)| nice).min()
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};
    use std::time::Duration;

    use memsched::{
        OverflowOutcome, QueueDispatcher, Regulator, RegulatorConfig, SimProvider, UnitSettings,
    };

    use super::*;

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("should spawn sleep")
    }

    fn stop(mut child: Child) {
        child.kill().expect("kill sleeper");
        child.wait().expect("reap sleeper");
    }

    #[test]
    fn suspends_and_resumes_registered_processes() {
        let child = sleeper();
        let gate = SignalGate::new(1);
        gate.register(0, child.id() as i32);

        assert_eq!(gate.suspend(0).expect("suspend"), 1);
        assert_eq!(gate.suspend(0).expect("suspend"), 0, "already stopped");
        assert_eq!(gate.resume(0).expect("resume"), 1);
        assert_eq!(gate.resume(0).expect("resume"), 0, "nothing left stopped");

        stop(child);
    }

    #[test]
    fn unit_without_processes_is_a_no_op() {
        let gate = SignalGate::new(4);
        assert_eq!(gate.suspend(3).expect("suspend"), 0);
        assert_eq!(gate.resume(3).expect("resume"), 0);
        assert_eq!(gate.suspend(9).expect("unknown unit"), 0);
        assert_eq!(gate.runnable(3), None);
        assert_eq!(gate.priority(3), None);
    }

    #[test]
    fn exited_processes_are_forgotten() {
        let child = sleeper();
        let pid = child.id() as i32;
        stop(child);

        let gate = SignalGate::new(2);
        gate.register(1, pid);
        assert_eq!(gate.runnable(1), Some(0));
        assert_eq!(gate.suspend(1).expect("suspend"), 0);
        assert!(gate.units[1].lock().expect("lock").pids.is_empty());
        assert_eq!(gate.runnable(1), Some(0), "unit stays tracked");
    }

    #[test]
    fn reports_live_processes_and_their_priority() {
        let child = sleeper();
        let gate = SignalGate::new(1);
        gate.register(0, child.id() as i32);

        assert_eq!(gate.runnable(0), Some(1));
        // Children inherit the nice value of the test process.
        let (_, nice) = proc_stat(std::process::id() as i32).expect("own stat");
        assert_eq!(gate.priority(0), Some(nice));

        stop(child);
        assert_eq!(gate.runnable(0), Some(0));
        assert_eq!(gate.priority(0), None);
    }

    #[test]
    fn contention_is_per_unit() {
        let child = sleeper();
        let gate = SignalGate::new(2);
        gate.register(1, child.id() as i32);

        let _held = gate.units[0].lock().expect("lock");
        let err = gate.suspend(0).expect_err("should be contended");
        assert_eq!(err.current_context(), &ThrottleError::Contended { unit: 0 });
        assert_eq!(gate.runnable(0), None);

        assert_eq!(gate.suspend(1).expect("other unit is free"), 1);
        assert_eq!(gate.resume(1).expect("resume"), 1);

        stop(child);
    }

    #[test_log::test]
    fn killed_stopped_process_does_not_block_throttling() {
        let provider = SimProvider::new();
        let gate = SignalGate::new(1);
        let first = sleeper();
        let second = sleeper();
        gate.register(0, first.id() as i32);
        gate.register(0, second.id() as i32);

        let cfg = RegulatorConfig {
            period: Duration::from_secs(1),
            ..Default::default()
        };
        let reg = Regulator::activate(cfg, vec![UnitSettings::limit(1000)], &provider, gate)
            .expect("should activate");
        let counter = provider.counter(0);
        let deadline = reg.global().deadline_ns();

        counter.add(1000);
        let outcome = reg
            .handle_overflow_at(0, 0, deadline - 1000, &QueueDispatcher::new())
            .expect("unit");
        assert_eq!(outcome, OverflowOutcome::Throttled(2));

        // A stopped process dies before the period ends.
        stop(first);
        reg.rollover_at(deadline);

        let snap = reg.snapshot_unit(0).expect("unit");
        assert_eq!(snap.throttled, 0);
        assert_eq!(snap.stats.throttle_count_repairs, 1);

        counter.add(1000);
        let outcome = reg
            .handle_overflow_at(0, 1, deadline + 1000, &QueueDispatcher::new())
            .expect("unit");
        assert_eq!(outcome, OverflowOutcome::Throttled(1));

        reg.deactivate();
        stop(second);
    }
}
