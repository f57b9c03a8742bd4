//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max` and `memory.swap.max`, and reads the usage and
//! OOM counters. The kernel enforces the ceiling; nothing here kills.

use std::path::Path;

use stockade_common::error::Result;

use super::{read_control, write_control};

/// Sets the hard memory limit for a cgroup and disables swap for it, so a
/// breach triggers the kernel OOM killer instead of swapping.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails. A missing
/// `memory.swap.max` (swap accounting disabled) is ignored.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    write_control(cgroup_path, "memory.max", &bytes.to_string())?;
    if cgroup_path.join("memory.swap.max").exists() {
        write_control(cgroup_path, "memory.swap.max", "0")?;
    }
    tracing::debug!(bytes, "memory max limit set");
    Ok(())
}

/// Returns `memory.current`, or zero when unavailable.
#[must_use]
pub fn current(cgroup_path: &Path) -> u64 {
    read_control(cgroup_path, "memory.current")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Returns `memory.peak`, or zero on kernels that lack it.
#[must_use]
pub fn peak(cgroup_path: &Path) -> u64 {
    read_control(cgroup_path, "memory.peak")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Returns the number of OOM kills recorded in `memory.events`.
#[must_use]
pub fn oom_kills(cgroup_path: &Path) -> u64 {
    read_control(cgroup_path, "memory.events")
        .and_then(|events| super::parse_keyed(&events, "oom_kill"))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_limit_and_disables_swap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.swap.max"), "max").unwrap();
        set_memory_max(dir.path(), 536_870_912).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("memory.max")).unwrap(),
            "536870912"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("memory.swap.max")).unwrap(),
            "0"
        );
    }

    #[test]
    fn reads_counters_and_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(current(dir.path()), 0);
        std::fs::write(dir.path().join("memory.current"), "4096\n").unwrap();
        std::fs::write(
            dir.path().join("memory.events"),
            "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n",
        )
        .unwrap();
        assert_eq!(current(dir.path()), 4096);
        assert_eq!(oom_kills(dir.path()), 1);
        assert_eq!(peak(dir.path()), 0);
    }
}
