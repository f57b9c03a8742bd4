//! Cgroups v2 resource management.
//!
//! Provides interfaces for creating one control group per container under
//! the unified hierarchy, applying CPU, memory, and I/O limits, attaching
//! processes, and reading usage counters.

pub mod cpu;
pub mod io;
pub mod memory;

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use stockade_common::config::CgroupConfig;
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::{ContainerId, ResourceLimits};

/// Controllers enabled for container groups.
const CONTROLLERS: [&str; 4] = ["cpu", "memory", "io", "pids"];

/// Limit values actually written to a cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedLimits {
    /// `cpu.max` as `(quota_us, period_us)`.
    pub cpu_max: Option<(u64, u64)>,
    /// `cpu.weight`.
    pub cpu_weight: Option<u64>,
    /// `memory.max` in bytes.
    pub memory_max: Option<u64>,
    /// `io.weight`.
    pub io_weight: Option<u16>,
}

/// Handle to a container's control group.
#[derive(Debug)]
pub struct CgroupHandle {
    /// Path of the group directory.
    pub path: PathBuf,
    /// Limits currently applied.
    pub limits: AppliedLimits,
    destroyed: bool,
}

impl CgroupHandle {
    /// Wraps an existing group directory.
    #[must_use]
    pub const fn new(path: PathBuf, limits: AppliedLimits) -> Self {
        Self {
            path,
            limits,
            destroyed: false,
        }
    }

    /// Returns whether [`CgroupController::destroy`] already removed the group.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

/// Point-in-time resource usage of one control group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Total CPU time consumed, in microseconds.
    pub cpu_usage_usec: u64,
    /// Current memory usage in bytes.
    pub memory_current_bytes: u64,
    /// Peak memory usage in bytes (zero on kernels without `memory.peak`).
    pub memory_peak_bytes: u64,
    /// Bytes read from block devices.
    pub io_read_bytes: u64,
    /// Bytes written to block devices.
    pub io_write_bytes: u64,
    /// Processes killed by the kernel for exceeding the memory ceiling.
    pub oom_kills: u64,
    /// Number of tasks currently in the group.
    pub pids_current: u64,
}

/// Creates, limits, and removes container control groups.
#[derive(Debug, Clone)]
pub struct CgroupController {
    config: CgroupConfig,
}

impl CgroupController {
    /// Creates a controller using the given placement and limit policy.
    #[must_use]
    pub const fn new(config: CgroupConfig) -> Self {
        Self { config }
    }

    /// Returns the parent group holding every container group.
    #[must_use]
    pub fn parent_path(&self) -> PathBuf {
        self.config.root.join(&self.config.parent)
    }

    /// Returns the group path for a container.
    #[must_use]
    pub fn group_path(&self, id: &ContainerId) -> PathBuf {
        self.parent_path().join(id.as_str())
    }

    /// Creates the parent group and delegates the container controllers to
    /// it. Controllers the kernel does not offer are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::ResourceLimit`] if the parent group cannot be
    /// created.
    pub fn ensure_hierarchy(&self) -> Result<()> {
        let parent = self.parent_path();
        std::fs::create_dir_all(&parent).map_err(|e| StockadeError::ResourceLimit {
            message: format!("cannot create cgroup parent {}: {e}", parent.display()),
        })?;
        for dir in [&self.config.root, &parent] {
            for controller in CONTROLLERS {
                if let Err(e) = write_control(dir, "cgroup.subtree_control", &format!("+{controller}")) {
                    tracing::warn!(dir = %dir.display(), controller, error = %e, "controller not enabled");
                }
            }
        }
        tracing::info!(parent = %parent.display(), "cgroup hierarchy ready");
        Ok(())
    }

    /// Checks limits against the configured policy and returns what would
    /// be written.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::ResourceLimit`] naming the first bad value.
    pub fn validate_limits(&self, limits: &ResourceLimits) -> Result<AppliedLimits> {
        let invalid = |message: String| Err(StockadeError::ResourceLimit { message });

        if let Some(mem) = limits.memory_limit_bytes {
            if mem < self.config.min_memory_bytes {
                return invalid(format!(
                    "memory_limit_bytes {mem} is below the minimum of {}",
                    self.config.min_memory_bytes
                ));
            }
        }
        let period = limits.cpu_period.unwrap_or(self.config.default_cpu_period_us);
        if !cpu::PERIOD_RANGE.contains(&period) {
            return invalid(format!(
                "cpu_period {period} is outside {}..={}",
                cpu::PERIOD_RANGE.start(),
                cpu::PERIOD_RANGE.end()
            ));
        }
        if let Some(quota) = limits.cpu_quota {
            if quota < self.config.min_cpu_quota_us {
                return invalid(format!(
                    "cpu_quota {quota} is below the minimum of {}",
                    self.config.min_cpu_quota_us
                ));
            }
        }
        if let Some(shares) = limits.cpu_shares {
            if !(cpu::MIN_SHARES..=cpu::MAX_SHARES).contains(&shares) {
                return invalid(format!(
                    "cpu_shares {shares} is outside {}..={}",
                    cpu::MIN_SHARES,
                    cpu::MAX_SHARES
                ));
            }
        }
        if let Some(weight) = limits.io_weight {
            if !io::WEIGHT_RANGE.contains(&weight) {
                return invalid(format!("io_weight {weight} is outside 1..=1000"));
            }
        }

        Ok(AppliedLimits {
            cpu_max: limits.cpu_quota.map(|quota| (quota, period)),
            cpu_weight: limits.cpu_shares.map(cpu::shares_to_weight),
            memory_max: limits.memory_limit_bytes,
            io_weight: limits.io_weight,
        })
    }

    /// Creates a new control group for the container and applies limits.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::ResourceLimit`] if a limit is invalid, the
    /// group already exists or cannot be created, or a control file write
    /// fails. A partially configured group is removed before returning.
    pub fn create_group(&self, id: &ContainerId, limits: &ResourceLimits) -> Result<CgroupHandle> {
        let applied = self.validate_limits(limits)?;
        let path = self.group_path(id);
        std::fs::create_dir(&path).map_err(|e| StockadeError::ResourceLimit {
            message: format!("cannot create cgroup {}: {e}", path.display()),
        })?;

        if let Err(e) = apply_limits(&path, &applied) {
            if let Err(cleanup) = std::fs::remove_dir(&path) {
                tracing::warn!(path = %path.display(), error = %cleanup, "failed to remove partial cgroup");
            }
            return Err(e);
        }
        tracing::info!(id = %id, path = %path.display(), limits = ?applied, "cgroup created");
        Ok(CgroupHandle::new(path, applied))
    }

    /// Moves a process into the group. Must run before the process executes
    /// its workload.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::ResourceLimit`] if writing to `cgroup.procs`
    /// fails, or [`StockadeError::NotFound`] on a destroyed handle.
    pub fn attach(&self, handle: &CgroupHandle, pid: u32) -> Result<()> {
        ensure_live(handle)?;
        write_control(&handle.path, "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, path = %handle.path.display(), "added process to cgroup");
        Ok(())
    }

    /// Kills every process in the group.
    ///
    /// Uses `cgroup.kill` where the kernel provides it (5.14+), otherwise
    /// sends `SIGKILL` to each PID listed in `cgroup.procs`.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.kill` cannot be written, or
    /// [`StockadeError::Teardown`] if a process cannot be signalled, or
    /// [`StockadeError::NotFound`] on a destroyed handle.
    pub fn kill_all(&self, handle: &CgroupHandle) -> Result<()> {
        ensure_live(handle)?;
        if handle.path.join("cgroup.kill").exists() {
            write_control(&handle.path, "cgroup.kill", "1")?;
            tracing::info!(path = %handle.path.display(), "killed leftover processes");
            return Ok(());
        }
        let procs = read_control(&handle.path, "cgroup.procs").unwrap_or_default();
        for pid in procs.lines().filter_map(|line| line.trim().parse::<i32>().ok()) {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(StockadeError::Teardown {
                        message: format!("cannot kill {pid} in {}: {e}", handle.path.display()),
                    });
                }
            }
            tracing::info!(pid, path = %handle.path.display(), "killed leftover process");
        }
        Ok(())
    }

    /// Reads current usage. Missing or unparsable counters read as zero.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] only for a destroyed handle.
    pub fn read_usage(&self, handle: &CgroupHandle) -> Result<ResourceUsage> {
        ensure_live(handle)?;
        let path = &handle.path;
        let (io_read_bytes, io_write_bytes) = read_control(path, "io.stat")
            .map(|stat| io::parse_io_stat(&stat))
            .unwrap_or_default();
        Ok(ResourceUsage {
            cpu_usage_usec: read_control(path, "cpu.stat")
                .map(|stat| cpu::parse_usage_usec(&stat))
                .unwrap_or(0),
            memory_current_bytes: memory::current(path),
            memory_peak_bytes: memory::peak(path),
            io_read_bytes,
            io_write_bytes,
            oom_kills: memory::oom_kills(path),
            pids_current: read_control(path, "pids.current")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
        })
    }

    /// Removes the control group once no process remains in it.
    ///
    /// Calling it again, or on a group that no longer exists, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::ResourceBusy`] while processes are attached,
    /// or [`StockadeError::Teardown`] if the directory cannot be removed.
    pub fn destroy(&self, handle: &mut CgroupHandle) -> Result<()> {
        if handle.destroyed {
            return Ok(());
        }
        if !handle.path.exists() {
            handle.destroyed = true;
            return Ok(());
        }
        let busy = read_control(&handle.path, "cgroup.procs")
            .is_some_and(|procs| procs.lines().any(|l| !l.trim().is_empty()));
        if busy {
            return Err(StockadeError::ResourceBusy {
                path: handle.path.clone(),
            });
        }
        match std::fs::remove_dir(&handle.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                return Err(StockadeError::ResourceBusy {
                    path: handle.path.clone(),
                });
            }
            Err(e) => {
                return Err(StockadeError::Teardown {
                    message: format!("cannot remove cgroup {}: {e}", handle.path.display()),
                });
            }
        }
        handle.destroyed = true;
        tracing::info!(path = %handle.path.display(), "cgroup destroyed");
        Ok(())
    }
}

fn apply_limits(path: &Path, applied: &AppliedLimits) -> Result<()> {
    if let Some((quota, period)) = applied.cpu_max {
        cpu::set_cpu_max(path, quota, period)?;
    }
    if let Some(weight) = applied.cpu_weight {
        cpu::set_cpu_weight(path, weight)?;
    }
    if let Some(mem) = applied.memory_max {
        memory::set_memory_max(path, mem)?;
    }
    if let Some(weight) = applied.io_weight {
        io::set_io_weight(path, weight)?;
    }
    Ok(())
}

fn ensure_live(handle: &CgroupHandle) -> Result<()> {
    if handle.destroyed {
        return Err(StockadeError::NotFound {
            kind: "cgroup",
            id: handle.path.display().to_string(),
        });
    }
    Ok(())
}

/// Writes a value to a control file of a cgroup.
pub(crate) fn write_control(cgroup_path: &Path, file: &str, value: &str) -> Result<()> {
    let target = cgroup_path.join(file);
    std::fs::write(&target, value).map_err(|e| StockadeError::ResourceLimit {
        message: format!("cannot write {value:?} to {}: {e}", target.display()),
    })
}

/// Reads a control file, returning `None` if it is missing or unreadable.
pub(crate) fn read_control(cgroup_path: &Path, file: &str) -> Option<String> {
    std::fs::read_to_string(cgroup_path.join(file)).ok()
}

/// Finds `key value` in a flat-keyed control file.
pub(crate) fn parse_keyed(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once(' ')?;
        (k == key).then(|| v.trim().parse().ok()).flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(root: &Path) -> CgroupController {
        let config = CgroupConfig {
            root: root.to_path_buf(),
            ..CgroupConfig::default()
        };
        let controller = CgroupController::new(config);
        std::fs::create_dir_all(controller.parent_path()).unwrap();
        controller
    }

    fn id(s: &str) -> ContainerId {
        ContainerId::new(s).unwrap()
    }

    #[test]
    fn create_group_writes_control_files() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let limits = ResourceLimits {
            cpu_quota: Some(50_000),
            memory_limit_bytes: Some(512 * 1024 * 1024),
            io_weight: Some(300),
            ..ResourceLimits::default()
        };
        let handle = ctl.create_group(&id("web"), &limits).unwrap();
        assert_eq!(handle.path, ctl.group_path(&id("web")));
        let read = |f: &str| std::fs::read_to_string(handle.path.join(f)).unwrap();
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("memory.max"), "536870912");
        assert_eq!(read("io.weight"), "default 300");
        assert!(!handle.path.join("cpu.weight").exists());
        assert_eq!(handle.limits.cpu_max, Some((50_000, 100_000)));
    }

    #[test]
    fn memory_below_floor_is_rejected_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let limits = ResourceLimits {
            memory_limit_bytes: Some(1024),
            ..ResourceLimits::default()
        };
        let err = ctl.create_group(&id("tiny"), &limits).unwrap_err();
        assert!(matches!(err, StockadeError::ResourceLimit { .. }));
        assert!(!ctl.group_path(&id("tiny")).exists());
    }

    #[test]
    fn io_weight_out_of_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        for weight in [0, 1001] {
            let limits = ResourceLimits {
                io_weight: Some(weight),
                ..ResourceLimits::default()
            };
            assert!(ctl.validate_limits(&limits).is_err(), "weight {weight}");
        }
    }

    #[test]
    fn missing_parent_hierarchy_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = CgroupController::new(CgroupConfig {
            root: dir.path().join("absent"),
            ..CgroupConfig::default()
        });
        let err = ctl.create_group(&id("x"), &ResourceLimits::default()).unwrap_err();
        assert!(matches!(err, StockadeError::ResourceLimit { .. }));
    }

    #[test]
    fn groups_are_never_shared() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let _first = ctl.create_group(&id("same"), &ResourceLimits::default()).unwrap();
        assert!(ctl.create_group(&id("same"), &ResourceLimits::default()).is_err());
    }

    #[test]
    fn attach_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let handle = ctl.create_group(&id("a"), &ResourceLimits::default()).unwrap();
        ctl.attach(&handle, 4242).unwrap();
        assert_eq!(
            std::fs::read_to_string(handle.path.join("cgroup.procs")).unwrap(),
            "4242"
        );
    }

    #[test]
    fn destroy_refuses_busy_group() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let mut handle = ctl.create_group(&id("busy"), &ResourceLimits::default()).unwrap();
        std::fs::write(handle.path.join("cgroup.procs"), "77\n").unwrap();
        let err = ctl.destroy(&mut handle).unwrap_err();
        assert!(matches!(err, StockadeError::ResourceBusy { .. }));
        assert!(!handle.is_destroyed());
    }

    #[test]
    fn kill_all_uses_cgroup_kill_when_available() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let handle = ctl.create_group(&id("kill"), &ResourceLimits::default()).unwrap();
        std::fs::write(handle.path.join("cgroup.kill"), "").unwrap();
        ctl.kill_all(&handle).unwrap();
        assert_eq!(std::fs::read_to_string(handle.path.join("cgroup.kill")).unwrap(), "1");
    }

    #[test]
    fn kill_all_signals_listed_processes_without_cgroup_kill() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let handle = ctl.create_group(&id("old"), &ResourceLimits::default()).unwrap();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(handle.path.join("cgroup.procs"), format!("{}\n", child.id())).unwrap();

        ctl.kill_all(&handle).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(std::os::unix::process::ExitStatusExt::signal(&status), Some(9));
    }

    #[test]
    fn destroy_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let mut handle = ctl.create_group(&id("gone"), &ResourceLimits::default()).unwrap();
        std::fs::remove_dir_all(&handle.path).unwrap();
        ctl.destroy(&mut handle).unwrap();
        assert!(handle.is_destroyed());
        ctl.destroy(&mut handle).unwrap();
    }

    #[test]
    fn usage_reads_counters_and_fails_after_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let mut handle = ctl.create_group(&id("u"), &ResourceLimits::default()).unwrap();
        std::fs::write(handle.path.join("cpu.stat"), "usage_usec 900\n").unwrap();
        std::fs::write(handle.path.join("memory.current"), "8192\n").unwrap();
        std::fs::write(handle.path.join("io.stat"), "8:0 rbytes=5 wbytes=7\n").unwrap();
        std::fs::write(handle.path.join("pids.current"), "3\n").unwrap();

        let usage = ctl.read_usage(&handle).unwrap();
        assert_eq!(usage.cpu_usage_usec, 900);
        assert_eq!(usage.memory_current_bytes, 8192);
        assert_eq!((usage.io_read_bytes, usage.io_write_bytes), (5, 7));
        assert_eq!(usage.pids_current, 3);
        assert_eq!(usage.oom_kills, 0);

        std::fs::remove_dir_all(&handle.path).unwrap();
        ctl.destroy(&mut handle).unwrap();
        assert!(matches!(
            ctl.read_usage(&handle),
            Err(StockadeError::NotFound { .. })
        ));
    }
}
