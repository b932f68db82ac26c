//! Resource cap enforcement through the kernel cgroup interface.
//!
//! Caps are applied by writing well-known files under the cgroup
//! filesystem. All children share one cgroup (`my_cgroup`); creating it
//! is outside this system. Every write is best-effort: cgroup support is
//! environment-dependent and a missing controller must not block boot,
//! so failures are logged and the service runs uncapped.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::CGROUP_ROOT;

const CGROUP_NAME: &str = "my_cgroup";

/// Microseconds of CPU per 100 ms period granted per quota percent.
const CPU_QUOTA_US_PER_PERCENT: u64 = 10_000;

/// Writer for the shared service cgroup.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
}

impl CgroupController {
    /// Controller over the system cgroup filesystem.
    pub fn new() -> Self {
        Self::with_root(CGROUP_ROOT)
    }

    /// Controller over an alternate cgroup root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Apply memory and CPU caps to `pid` and enroll it in the cgroup.
    ///
    /// A zero limit means "no cap" and skips the corresponding write.
    /// Individual write failures are logged at WARN and do not fail the
    /// call: the service simply continues uncapped.
    pub fn apply(&self, pid: u32, memory_limit_bytes: u64, cpu_quota_percent: u8) {
        if memory_limit_bytes > 0 {
            self.write_file(
                &self.memory_dir().join("memory.limit_in_bytes"),
                &memory_limit_bytes.to_string(),
                false,
            );
        }

        if cpu_quota_percent > 0 {
            let quota_us = u64::from(cpu_quota_percent) * CPU_QUOTA_US_PER_PERCENT;
            self.write_file(
                &self.cpu_dir().join("cpu.cfs_quota_us"),
                &quota_us.to_string(),
                false,
            );
        }

        self.write_file(&self.memory_dir().join("cgroup.procs"), &pid.to_string(), true);
        debug!(
            pid = pid,
            memory_limit_bytes = memory_limit_bytes,
            cpu_quota_percent = cpu_quota_percent,
            "applied resource caps"
        );
    }

    fn write_file(&self, path: &Path, value: &str, append: bool) {
        let result = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", value));

        if let Err(e) = result {
            warn!(
                path = %path.display(),
                value = value,
                error = %e,
                "cgroup write failed, service continues uncapped"
            );
        }
    }

    fn memory_dir(&self) -> PathBuf {
        self.root.join("memory").join(CGROUP_NAME)
    }

    fn cpu_dir(&self) -> PathBuf {
        self.root.join("cpu").join(CGROUP_NAME)
    }
}

impl Default for CgroupController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn controller_with_dirs() -> (TempDir, CgroupController) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("memory/my_cgroup")).unwrap();
        std::fs::create_dir_all(dir.path().join("cpu/my_cgroup")).unwrap();
        let controller = CgroupController::with_root(dir.path());
        (dir, controller)
    }

    #[test]
    fn test_apply_writes_limits_and_membership() {
        let (dir, controller) = controller_with_dirs();

        controller.apply(1234, 67_108_864, 20);

        let mem = std::fs::read_to_string(dir.path().join("memory/my_cgroup/memory.limit_in_bytes"))
            .unwrap();
        assert_eq!(mem.trim(), "67108864");

        let cpu =
            std::fs::read_to_string(dir.path().join("cpu/my_cgroup/cpu.cfs_quota_us")).unwrap();
        assert_eq!(cpu.trim(), "200000");

        let procs =
            std::fs::read_to_string(dir.path().join("memory/my_cgroup/cgroup.procs")).unwrap();
        assert_eq!(procs.trim(), "1234");
    }

    #[test]
    fn test_zero_limits_skip_cap_files() {
        let (dir, controller) = controller_with_dirs();

        controller.apply(99, 0, 0);

        assert!(!dir
            .path()
            .join("memory/my_cgroup/memory.limit_in_bytes")
            .exists());
        assert!(!dir.path().join("cpu/my_cgroup/cpu.cfs_quota_us").exists());
        // Membership is always recorded.
        let procs =
            std::fs::read_to_string(dir.path().join("memory/my_cgroup/cgroup.procs")).unwrap();
        assert_eq!(procs.trim(), "99");
    }

    #[test]
    fn test_membership_appends() {
        let (dir, controller) = controller_with_dirs();

        controller.apply(1, 0, 0);
        controller.apply(2, 0, 0);

        let procs =
            std::fs::read_to_string(dir.path().join("memory/my_cgroup/cgroup.procs")).unwrap();
        let pids: Vec<&str> = procs.lines().collect();
        assert_eq!(pids, vec!["1", "2"]);
    }

    #[test]
    fn test_missing_cgroup_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let controller = CgroupController::with_root(dir.path().join("nonexistent"));

        // Must not panic or error; the caps are simply not applied.
        controller.apply(42, 1024, 50);
    }
}
