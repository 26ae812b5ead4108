// Kernel resource limits applied in the child between fork and exec.

use nix::sys::resource::{setrlimit, Resource};
use sentinel_common::types::ResourceLimits;

/// Largest file a sandboxed process may write
const FILE_SIZE_LIMIT: u64 = 64 * 1024 * 1024;
const OPEN_FILES_LIMIT: u64 = 1024;
/// Minimum gap between the memory ceiling and RLIMIT_DATA
const DATA_HEADROOM: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLimits {
    pub cpu_secs: u64,
    pub data_bytes: Option<u64>,
    pub file_size_bytes: u64,
    pub open_files: u64,
}

impl KernelLimits {
    pub fn new(limits: &ResourceLimits, limit_data_segment: bool) -> Self {
        Self {
            cpu_secs: limits.cpu_time_secs.max(1),
            data_bytes: limit_data_segment.then(|| data_backstop(limits.memory_bytes)),
            file_size_bytes: FILE_SIZE_LIMIT,
            open_files: OPEN_FILES_LIMIT,
        }
    }

    /// Install the limits on the calling process.
    ///
    /// Runs inside `pre_exec`, so it only issues setrlimit syscalls and
    /// allocates nothing. The CPU hard limit sits one second above the soft
    /// limit: SIGXCPU first, SIGKILL if the program ignores it.
    pub fn apply(&self) -> std::io::Result<()> {
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        if let Some(bytes) = self.data_bytes {
            setrlimit(Resource::RLIMIT_DATA, bytes, bytes)?;
        }
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

/// RLIMIT_DATA for a given memory ceiling.
///
/// The RSS monitor enforces the ceiling itself; the kernel limit only stops
/// a tree from outrunning the monitor between two samples, so it sits
/// clearly above the ceiling.
pub fn data_backstop(memory_bytes: u64) -> u64 {
    memory_bytes.saturating_add(memory_bytes.max(DATA_HEADROOM))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_limit_is_optional() {
        let limits = ResourceLimits {
            cpu_time_secs: 2,
            memory_bytes: 128 * 1024 * 1024,
            ..Default::default()
        };

        assert_eq!(KernelLimits::new(&limits, true).data_bytes, Some(384 * 1024 * 1024));
        assert_eq!(KernelLimits::new(&limits, false).data_bytes, None);
    }

    #[test]
    fn test_data_backstop_sits_above_ceiling() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(data_backstop(64 * MIB), 320 * MIB);
        assert_eq!(data_backstop(1024 * MIB), 2048 * MIB);
        assert_eq!(data_backstop(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_zero_cpu_budget_still_bounded() {
        let limits = ResourceLimits::default();
        assert_eq!(KernelLimits::new(&limits, true).cpu_secs, 1);
    }
}
