//! Per-CPU hardware counters backed by `perf_event_open(2)`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};

use memsched::{CounterError, CounterProvider, EventCounter, EventKind};

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

const FLAG_DISABLED: u64 = 1 << 0;
const FLAG_PINNED: u64 = 1 << 2;
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

/// `struct perf_event_attr`, `PERF_ATTR_SIZE_VER5` layout.
#[repr(C)]
#[derive(Debug, Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

impl PerfEventAttr {
    fn for_event(kind: EventKind) -> Self {
        let (type_, config) = match kind {
            EventKind::LlcMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
            EventKind::CpuClock => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
        };
        Self {
            type_,
            size: std::mem::size_of::<Self>() as u32,
            config,
            flags: FLAG_DISABLED | FLAG_PINNED | FLAG_EXCLUDE_KERNEL,
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PerfError {
    #[error("perf_event_open on cpu {cpu} failed: {source}")]
    Open { cpu: usize, source: io::Error },
    #[error("ioctl {request:#x} failed: {source}")]
    Ioctl {
        request: libc::c_ulong,
        source: io::Error,
    },
}

impl PerfError {
    /// Maps an open failure to the engine's counter error for `unit`.
    pub fn to_counter_error(&self, unit: usize) -> CounterError {
        let errno = match self {
            Self::Open { source, .. } | Self::Ioctl { source, .. } => {
                source.raw_os_error().unwrap_or(0)
            }
        };
        match errno {
            libc::EOPNOTSUPP => CounterError::Unsupported { unit },
            libc::ENOENT => CounterError::NotHardware { unit },
            errno => CounterError::Os { unit, errno },
        }
    }
}

/// One counting perf event pinned to a CPU.
#[derive(Debug)]
pub struct PerfCounter {
    cpu: usize,
    fd: OwnedFd,
    /// Last successfully read value, reported while reads fail.
    last: AtomicU64,
}

impl PerfCounter {
    pub fn open(cpu: usize, kind: EventKind) -> Result<Self, PerfError> {
        let attr = PerfEventAttr::for_event(kind);
        // SAFETY: attr outlives the call and its size field matches the layout.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                -1 as libc::pid_t,
                cpu as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(PerfError::Open {
                cpu,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: the syscall returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) };
        Ok(Self {
            cpu,
            fd,
            last: AtomicU64::new(0),
        })
    }

    fn ioctl(&self, request: libc::c_ulong) -> Result<(), PerfError> {
        // SAFETY: enable/disable take no argument.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, 0) };
        if rc < 0 {
            return Err(PerfError::Ioctl {
                request,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn read_count(&self) -> io::Result<u64> {
        let mut value = 0u64;
        // SAFETY: reading 8 bytes into a u64 owned by this frame.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }
}

impl EventCounter for PerfCounter {
    fn enable(&self) {
        if let Err(e) = self.ioctl(PERF_EVENT_IOC_ENABLE) {
            tracing::warn!(cpu = self.cpu, error = %e, "failed to enable counter");
        }
    }

    fn disable(&self) {
        if let Err(e) = self.ioctl(PERF_EVENT_IOC_DISABLE) {
            tracing::warn!(cpu = self.cpu, error = %e, "failed to disable counter");
        }
    }

    fn read(&self) -> u64 {
        match self.read_count() {
            Ok(value) => {
                self.last.store(value, Ordering::Relaxed);
                value
            }
            Err(e) => {
                tracing::warn!(cpu = self.cpu, error = %e, "failed to read counter");
                self.last.load(Ordering::Relaxed)
            }
        }
    }
}

/// Opens one [`PerfCounter`] per unit, unit `n` being CPU `n`.
#[derive(Debug, Default)]
pub struct PerfProvider;

impl CounterProvider for PerfProvider {
    fn create(
        &self,
        unit: usize,
        kind: EventKind,
    ) -> error_stack::Result<Box<dyn EventCounter>, CounterError> {
        match PerfCounter::open(unit, kind) {
            Ok(counter) => Ok(Box::new(counter)),
            Err(e) => {
                let context = e.to_counter_error(unit);
                Err(error_stack::Report::new(context).attach_printable(e.to_string()))
            }
        }
    }
}
