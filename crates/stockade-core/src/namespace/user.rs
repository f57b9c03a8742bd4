//! User namespace isolation.
//!
//! Maps container UIDs/GIDs onto an unprivileged host range so that root in
//! the container is not root on the host.

use std::path::{Path, PathBuf};

use stockade_common::config::IdMapConfig;
use stockade_common::error::{Result, StockadeError};

/// Sysctl bounding how many user namespaces may exist.
const MAX_USER_NAMESPACES: &str = "/proc/sys/user/max_user_namespaces";

/// Returns the `user.max_user_namespaces` limit, if readable.
#[must_use]
pub fn max_user_namespaces() -> Option<u64> {
    std::fs::read_to_string(MAX_USER_NAMESPACES)
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

/// Renders a single-range id map line.
#[must_use]
pub fn map_line(container_id: u32, host_id: u32, size: u32) -> String {
    format!("{container_id} {host_id} {size}\n")
}

/// Writes the UID and GID maps of process `pid`.
///
/// Container id 0 maps to the configured host id. An unprivileged writer
/// must deny `setgroups` before the GID map is accepted; a privileged one
/// leaves it enabled.
///
/// # Errors
///
/// Returns [`StockadeError::NamespaceSetup`] if any of the proc files cannot
/// be written.
pub fn write_id_maps(pid: u32, map: &IdMapConfig) -> Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    let privileged = nix::unistd::geteuid().is_root();
    write_maps_in(&proc_dir, map, privileged)?;
    tracing::debug!(pid, host_uid = map.host_uid, host_gid = map.host_gid, size = map.size, "wrote UID/GID map");
    Ok(())
}

fn write_maps_in(proc_dir: &Path, map: &IdMapConfig, privileged: bool) -> Result<()> {
    if !privileged {
        write_proc(&proc_dir.join("setgroups"), "deny")?;
    }
    write_proc(&proc_dir.join("uid_map"), &map_line(0, map.host_uid, map.size))?;
    write_proc(&proc_dir.join("gid_map"), &map_line(0, map.host_gid, map.size))
}

fn write_proc(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).map_err(|e| StockadeError::NamespaceSetup {
        message: format!("cannot write {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_root_onto_host_range() {
        let dir = tempfile::tempdir().unwrap();
        let map = IdMapConfig {
            host_uid: 200_000,
            host_gid: 300_000,
            size: 1000,
        };
        write_maps_in(dir.path(), &map, true).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("uid_map")).unwrap(),
            "0 200000 1000\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("gid_map")).unwrap(),
            "0 300000 1000\n"
        );
        assert!(!dir.path().join("setgroups").exists());
    }

    #[test]
    fn unprivileged_writer_denies_setgroups() {
        let dir = tempfile::tempdir().unwrap();
        write_maps_in(dir.path(), &IdMapConfig::default(), false).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("setgroups")).unwrap(),
            "deny"
        );
    }
}
