//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::ffi::CString;
use std::path::Path;

use nix::mount::{MntFlags, umount2};
use nix::unistd::{chdir, chroot};
use stockade_common::error::Result;

use super::mount::{self, EssentialMounts, path_cstring};
use crate::namespace::launch::{AtStep, ChildFault};

/// Name of the temporary directory that receives the old root.
const OLD_ROOT: &str = ".pivot_old";

/// How the child leaves the host root for the container root.
#[derive(Debug)]
pub struct RootSwitch {
    new_root: CString,
    put_old: CString,
    old_root: CString,
    /// Present when the child has its own mount namespace.
    mounts: Option<EssentialMounts>,
}

impl RootSwitch {
    /// Plans the switch to `new_root`.
    ///
    /// With `isolate_mounts` the child makes its mounts private, mounts
    /// `/dev` (and `/proc` when `fresh_proc`), and pivots; the old root is
    /// lazily detached and its placeholder removed, leaving nothing of the
    /// host visible. Without a mount namespace it falls back to `chroot(2)`.
    ///
    /// # Errors
    ///
    /// Returns an error if a path cannot be converted.
    pub fn plan(new_root: &Path, isolate_mounts: bool, fresh_proc: bool) -> Result<Self> {
        let mounts = isolate_mounts
            .then(|| EssentialMounts::plan(new_root, fresh_proc))
            .transpose()?;
        Ok(Self {
            new_root: path_cstring(new_root)?,
            put_old: path_cstring(&new_root.join(OLD_ROOT))?,
            old_root: path_cstring(&Path::new("/").join(OLD_ROOT))?,
            mounts,
        })
    }

    /// Switches root. Runs in the cloned child and never allocates.
    ///
    /// # Errors
    ///
    /// Returns the failed step and its errno.
    pub fn enter(&self) -> std::result::Result<(), ChildFault> {
        let Some(mounts) = &self.mounts else {
            chroot(self.new_root.as_c_str()).at("chroot")?;
            return chdir(c"/").at("chdir to new root");
        };

        mount::make_mounts_private().at("make mounts private")?;
        mounts.mount()?;
        // pivot_root(2) requires the new root to be a mount point.
        mount::bind_mount(&self.new_root, &self.new_root).at("bind new root")?;
        mount::ensure_dir(&self.put_old).at("create old root placeholder")?;
        nix::unistd::pivot_root(self.new_root.as_c_str(), self.put_old.as_c_str()).at("pivot_root")?;
        chdir(c"/").at("chdir to new root")?;
        umount2(self.old_root.as_c_str(), MntFlags::MNT_DETACH).at("detach old root")?;
        // SAFETY: `old_root` is a NUL-terminated path owned by `self`.
        let removed = unsafe { libc::rmdir(self.old_root.as_ptr()) };
        nix::errno::Errno::result(removed).map(drop).at("remove old root placeholder")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pivot_plan_places_old_root_inside_new_root() {
        let plan = RootSwitch::plan(Path::new("/srv/root"), true, false).unwrap();
        assert_eq!(plan.put_old.as_c_str(), c"/srv/root/.pivot_old");
        assert_eq!(plan.old_root.as_c_str(), c"/.pivot_old");
        assert!(plan.mounts.is_some());
    }

    #[test]
    fn without_mount_namespace_nothing_is_mounted() {
        let plan = RootSwitch::plan(Path::new("/srv/root"), false, true).unwrap();
        assert!(plan.mounts.is_none());
    }
}
