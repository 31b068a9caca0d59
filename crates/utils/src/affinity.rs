//! Thread pinning for per-unit workers.

/// Pins the calling thread to `cpu`. Returns `false` when the kernel refused.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> bool {
    use core::mem::{size_of, zeroed};

    if cpu >= libc::CPU_SETSIZE as usize {
        return false;
    }
    // SAFETY: cpu_set_t is plain data; CPU_SET is bounds checked above and
    // pthread_self is always a valid handle for the calling thread.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = zeroed();
        libc::CPU_SET(cpu, &mut set);
        libc::pthread_setaffinity_np(libc::pthread_self(), size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        tracing::warn!(cpu, errno = rc, "failed to pin thread");
    }
    rc == 0
}

/// Restricts process `pid` to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_process(pid: i32, cpu: usize) -> bool {
    use core::mem::{size_of, zeroed};

    if cpu >= libc::CPU_SETSIZE as usize {
        return false;
    }
    // SAFETY: as above; sched_setaffinity only reads the set.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = zeroed();
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(pid, size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        tracing::warn!(pid, cpu, error = %std::io::Error::last_os_error(), "failed to pin process");
    }
    rc == 0
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> bool {
    tracing::debug!(cpu, "thread pinning not supported on this platform");
    false
}

#[cfg(not(target_os = "linux"))]
pub fn pin_process(pid: i32, cpu: usize) -> bool {
    tracing::debug!(pid, cpu, "process pinning not supported on this platform");
    false
}

/// Number of CPUs currently online.
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_at_least_one_cpu() {
        assert!(online_cpus() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rejects_out_of_range_cpu() {
        assert!(!pin_current_thread(usize::MAX));
    }
}
