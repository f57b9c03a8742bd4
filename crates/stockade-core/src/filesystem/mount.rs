//! Mount utilities for container filesystem setup.
//!
//! Handles mounting `/proc` and a minimal `/dev` inside the container's
//! mount namespace, and inspecting the host mount table. Everything the
//! child runs here takes pre-built C strings and never allocates.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::mount::{MsFlags, mount};
use nix::sys::stat::Mode;
use nix::unistd::mkdir;
use stockade_common::error::{Result, StockadeError};

use crate::namespace::launch::{AtStep, ChildFault};

/// Device nodes bind-mounted from the host into the container's `/dev`.
const DEVICES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

/// Returns whether `path` is a mount point in the caller's mount namespace.
///
/// Reads `/proc/self/mountinfo`; a missing path is never a mount point.
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(target) = path.canonicalize() else {
        return false;
    };
    let Ok(table) = std::fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    table
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| PathBuf::from(unescape_mountinfo(mount_point)) == target)
}

/// Decodes the octal escapes (`\040` for space and friends) used in
/// `/proc/self/mountinfo`.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Makes every mount in the current namespace private so that mounts made
/// by the container never propagate back to the host.
///
/// # Errors
///
/// Returns the errno of the failed remount.
pub fn make_mounts_private() -> nix::Result<()> {
    mount(
        None::<&CStr>,
        c"/",
        None::<&CStr>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&CStr>,
    )
}

/// Pseudo-filesystems mounted under a new root.
///
/// Paths are converted when the plan is built so that [`Self::mount`] can
/// run in a freshly cloned child without allocating.
#[derive(Debug)]
pub struct EssentialMounts {
    proc_dir: Option<CString>,
    dev_dir: CString,
    devices: Vec<(CString, CString)>,
    dev_subdirs: [CString; 2],
}

impl EssentialMounts {
    /// Plans `/dev` (a tmpfs holding the host's basic device nodes) under
    /// `rootfs`, plus `/proc` when `fresh_proc` is set (a new PID namespace
    /// exists, so the mount shows the container's own process tree).
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NamespaceSetup`] if a path contains a NUL byte.
    pub fn plan(rootfs: &Path, fresh_proc: bool) -> Result<Self> {
        let dev = rootfs.join("dev");
        let devices = DEVICES
            .iter()
            .map(|name| Path::new("/dev").join(name))
            .filter(|host| host.exists())
            .map(|host| {
                let target = host.file_name().map_or_else(|| dev.clone(), |name| dev.join(name));
                Ok((path_cstring(&host)?, path_cstring(&target)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            proc_dir: fresh_proc.then(|| path_cstring(&rootfs.join("proc"))).transpose()?,
            dev_dir: path_cstring(&dev)?,
            devices,
            dev_subdirs: [path_cstring(&dev.join("pts"))?, path_cstring(&dev.join("shm"))?],
        })
    }

    /// Performs the planned mounts.
    ///
    /// # Errors
    ///
    /// Returns the failed step and its errno.
    pub fn mount(&self) -> std::result::Result<(), ChildFault> {
        if let Some(proc_dir) = &self.proc_dir {
            ensure_dir(proc_dir).at("create /proc")?;
            mount(
                Some(c"proc"),
                proc_dir.as_c_str(),
                Some(c"proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None::<&CStr>,
            )
            .at("mount /proc")?;
        }

        ensure_dir(&self.dev_dir).at("create /dev")?;
        mount(
            Some(c"tmpfs"),
            self.dev_dir.as_c_str(),
            Some(c"tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some(c"mode=755,size=65536k"),
        )
        .at("mount /dev")?;

        for (host, target) in &self.devices {
            let node = open(
                target.as_c_str(),
                OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                Mode::from_bits_truncate(0o644),
            )
            .at("create device node")?;
            drop(node);
            bind_mount(host, target).at("bind device node")?;
        }
        for dir in &self.dev_subdirs {
            ensure_dir(dir).at("create /dev subdirectory")?;
        }
        Ok(())
    }
}

/// Creates a recursive bind mount from source to target.
///
/// # Errors
///
/// Returns the errno of the failed `mount(2)`.
pub fn bind_mount(source: &CStr, target: &CStr) -> nix::Result<()> {
    mount(
        Some(source),
        target,
        None::<&CStr>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&CStr>,
    )
}

/// Creates one directory level, accepting an existing one.
pub(crate) fn ensure_dir(path: &CStr) -> nix::Result<()> {
    match mkdir(path, Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Converts a path for use after `clone(2)`.
pub(crate) fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| StockadeError::NamespaceSetup {
        message: format!("path {} contains a NUL byte", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(unescape_mountinfo(r"/mnt/with\040space"), "/mnt/with space");
        assert_eq!(unescape_mountinfo("/plain"), "/plain");
    }

    #[test]
    fn root_is_a_mount_point() {
        assert!(is_mount_point(Path::new("/")));
    }

    #[test]
    fn plan_converts_paths_up_front() {
        let plan = EssentialMounts::plan(Path::new("/srv/root"), true).unwrap();
        assert_eq!(plan.proc_dir.as_deref(), Some(c"/srv/root/proc"));
        assert_eq!(plan.dev_dir.as_c_str(), c"/srv/root/dev");
        assert_eq!(plan.dev_subdirs[0].as_c_str(), c"/srv/root/dev/pts");
        assert!(plan.devices.iter().all(|(host, target)| {
            target.to_bytes().starts_with(b"/srv/root/dev/") && host.to_bytes().starts_with(b"/dev/")
        }));

        let shared = EssentialMounts::plan(Path::new("/srv/root"), false).unwrap();
        assert!(shared.proc_dir.is_none());
    }

    #[test]
    fn ensure_dir_accepts_existing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = path_cstring(&dir.path().join("proc")).unwrap();
        ensure_dir(&target).unwrap();
        ensure_dir(&target).unwrap();
        assert!(dir.path().join("proc").is_dir());
    }

    #[test]
    fn fresh_tempdir_is_not_a_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(dir.path()));
        assert!(!is_mount_point(&dir.path().join("missing")));
    }
}
