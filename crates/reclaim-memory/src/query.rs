use crate::error::MemoryError;
use parking_lot::Mutex;
use sysinfo::System;

/// The operating-system boundary: everything the subsystem needs to know
/// about process and machine memory.
///
/// Implementations may be expensive; callers sample at a bounded interval
/// rather than per cache operation.
pub trait MemoryQuery: Send + Sync {
    /// Resident set size of the current process.
    fn resident_bytes(&self) -> Result<u64, MemoryError>;

    /// Memory the OS reports as available for new allocations.
    fn available_bytes(&self) -> Result<u64, MemoryError>;

    /// Physical memory installed on the machine.
    fn total_bytes(&self) -> Result<u64, MemoryError>;
}

/// [`MemoryQuery`] backed by `/proc` (Linux) and `sysinfo`.
pub struct SystemMemoryQuery {
    system: Mutex<System>,
}

impl SystemMemoryQuery {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn resident_from_sysinfo(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

impl Default for SystemMemoryQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQuery for SystemMemoryQuery {
    fn resident_bytes(&self) -> Result<u64, MemoryError> {
        proc_status_rss_bytes()
            .or_else(|| self.resident_from_sysinfo())
            .ok_or_else(|| MemoryError::QueryFailure("resident set size unavailable".into()))
    }

    fn available_bytes(&self) -> Result<u64, MemoryError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        match system.available_memory() {
            0 => Err(MemoryError::QueryFailure(
                "available memory unavailable".into(),
            )),
            bytes => Ok(bytes),
        }
    }

    fn total_bytes(&self) -> Result<u64, MemoryError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        match system.total_memory() {
            0 => Err(MemoryError::QueryFailure("total memory unavailable".into())),
            bytes => Ok(bytes),
        }
    }
}

/// Best-effort `VmRSS` from `/proc/self/status`.
fn proc_status_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "reclaim.memory",
                        error = %err,
                        "failed to read /proc/self/status while sampling rss"
                    );
                }
                return None;
            }
        };
        parse_vm_rss(&status)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status
        .lines()
        .map(str::trim_start)
        .find(|line| line.starts_with("VmRSS:"))?;
    let kb = line["VmRSS:".len()..].split_whitespace().next()?;
    match kb.parse::<u64>() {
        Ok(kb) => Some(kb.saturating_mul(1024)),
        Err(err) => {
            static REPORTED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target: "reclaim.memory",
                    value = kb,
                    error = %err,
                    "failed to parse VmRSS"
                );
            }
            None
        }
    }
}
