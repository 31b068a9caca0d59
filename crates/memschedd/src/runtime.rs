//! Threads driving the regulator: one worker per CPU, a signal poller and
//! the period timer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use memsched::{Dispatcher, Regulator, ThrottleGate, UnitTask};

/// How often idle workers look at the shutdown flag.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub poll_interval: Duration,
    pub queue_depth: usize,
    pub pin_threads: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(50),
            queue_depth: 64,
            pin_threads: true,
        }
    }
}

/// Delivers tasks over bounded per-unit queues. A full queue drops the task.
#[derive(Debug)]
struct ChannelDispatcher {
    senders: Vec<Sender<UnitTask>>,
    dropped: AtomicU64,
}

impl Dispatcher for ChannelDispatcher {
    fn post(&self, unit: usize, task: UnitTask) {
        let Some(sender) = self.senders.get(unit) else {
            return;
        };
        match sender.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(unit, ?task, "unit queue full, dropping task");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn settle(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

pub struct Runtime<G: ThrottleGate + 'static> {
    regulator: Arc<Regulator<G>>,
    dispatcher: Arc<ChannelDispatcher>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl<G: ThrottleGate + 'static> Runtime<G> {
    pub fn start(regulator: Arc<Regulator<G>>, options: RuntimeOptions) -> Result<Self> {
        let units = regulator.units();
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..units).map(|_| bounded(options.queue_depth)).unzip();
        let dispatcher = Arc::new(ChannelDispatcher {
            senders,
            dropped: AtomicU64::new(0),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut runtime = Self {
            regulator,
            dispatcher,
            shutdown,
            threads: Vec::with_capacity(units + 2),
        };

        for (unit, receiver) in receivers.into_iter().enumerate() {
            if !runtime.regulator.is_regulated(unit) {
                continue;
            }
            let handle = runtime.spawn_worker(unit, receiver, options.pin_threads)?;
            runtime.threads.push(handle);
        }
        let handle = runtime.spawn_signal_thread(options.poll_interval)?;
        runtime.threads.push(handle);
        let handle = runtime.spawn_timer_thread()?;
        runtime.threads.push(handle);

        tracing::info!(threads = runtime.threads.len(), "regulation runtime started");
        Ok(runtime)
    }

    fn spawn_worker(
        &self,
        unit: usize,
        receiver: Receiver<UnitTask>,
        pin: bool,
    ) -> Result<JoinHandle<()>> {
        let regulator = Arc::clone(&self.regulator);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = Arc::clone(&self.shutdown);
        thread::Builder::new()
            .name(format!("memsched-cpu{unit}"))
            .spawn(move || {
                if pin {
                    utils::affinity::pin_current_thread(unit);
                }
                loop {
                    match receiver.recv_timeout(WORKER_IDLE_TIMEOUT) {
                        Ok(task) => {
                            let now = regulator.now_ns();
                            if let Err(report) =
                                regulator.run_task_at(unit, task, now, dispatcher.as_ref())
                            {
                                tracing::warn!(unit, error = ?report, "task failed");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if shutdown.load(Ordering::Acquire) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!(unit, "worker stopped");
            })
            .with_context(|| format!("failed to spawn worker for cpu {unit}"))
    }

    fn spawn_signal_thread(&self, poll_interval: Duration) -> Result<JoinHandle<()>> {
        let regulator = Arc::clone(&self.regulator);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = Arc::clone(&self.shutdown);
        thread::Builder::new()
            .name("memsched-signal".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    for unit in 0..regulator.units() {
                        if let Some(task) = regulator.signal(unit) {
                            dispatcher.post(unit, task);
                        }
                    }
                    thread::sleep(poll_interval);
                }
            })
            .context("failed to spawn signal thread")
    }

    fn spawn_timer_thread(&self) -> Result<JoinHandle<()>> {
        let regulator = Arc::clone(&self.regulator);
        let shutdown = Arc::clone(&self.shutdown);
        thread::Builder::new()
            .name("memsched-period".into())
            .spawn(move || {
                let mut deadline = regulator.global().deadline_ns();
                while !shutdown.load(Ordering::Acquire) {
                    let now = regulator.now_ns();
                    if now < deadline {
                        thread::sleep(Duration::from_nanos(deadline - now));
                        continue;
                    }
                    deadline = regulator.rollover_at(now);
                }
            })
            .context("failed to spawn period timer")
    }

    /// Stops every thread, then the regulator.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "regulation thread panicked");
            }
        }
        self.regulator.deactivate();
        tracing::info!(
            dropped_tasks = self.dispatcher.dropped.load(Ordering::Relaxed),
            "regulation runtime stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use memsched::{RecordingGate, RegulatorConfig, SimProvider, UnitSettings};

    use super::*;

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            pin_threads: false,
            ..Default::default()
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test_log::test]
    fn periods_roll_over_and_shutdown_stops_counters() {
        let provider = SimProvider::new();
        let regulator = Arc::new(
            Regulator::activate(
                RegulatorConfig::default(),
                vec![UnitSettings::limit(1000); 2],
                &provider,
                RecordingGate::default(),
            )
            .expect("should activate"),
        );

        let runtime = Runtime::start(Arc::clone(&regulator), options()).expect("should start");
        assert!(wait_until(Duration::from_secs(2), || regulator.global().period() >= 5));
        runtime.shutdown();

        assert!(!regulator.is_active());
        assert!(!provider.counter(0).is_enabled());
        assert!(!provider.counter(1).is_enabled());
    }

    #[test_log::test]
    fn overflowing_unit_gets_throttled() {
        let provider = SimProvider::new();
        let regulator = Arc::new(
            Regulator::activate(
                RegulatorConfig::default(),
                vec![UnitSettings::limit(1000)],
                &provider,
                RecordingGate::default(),
            )
            .expect("should activate"),
        );
        let counter = provider.counter(0);

        let runtime = Runtime::start(Arc::clone(&regulator), options()).expect("should start");
        let throttled = wait_until(Duration::from_secs(2), || {
            counter.add(5_000);
            regulator.gate().suspend_calls(0) > 0
        });
        runtime.shutdown();

        assert!(throttled, "unit was never throttled");
        assert!(regulator.snapshot_unit(0).expect("unit").stats.throttle_events > 0);
    }

    #[test]
    fn full_queue_drops_tasks() {
        let (sender, _receiver) = bounded(1);
        let dispatcher = ChannelDispatcher {
            senders: vec![sender],
            dropped: AtomicU64::new(0),
        };
        dispatcher.post(0, UnitTask::Overflow { epoch: 0 });
        dispatcher.post(0, UnitTask::Overflow { epoch: 0 });
        dispatcher.post(9, UnitTask::Overflow { epoch: 0 });
        assert_eq!(dispatcher.dropped.load(Ordering::Relaxed), 1);
    }
}
