//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks multiple read-only layers with a single writable upper layer,
//! enabling cheap container creation and copy-on-write semantics.

use std::path::{Path, PathBuf};

use stockade_common::error::{Result, StockadeError};

/// Longest mount data string the kernel accepts (one page minus the NUL).
const MAX_MOUNT_DATA: usize = 4095;

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Builds the `lowerdir=...,upperdir=...,workdir=...` option string.
    ///
    /// Overlay lists lower directories topmost first, so the bottom-to-top
    /// layer order is reversed here.
    ///
    /// # Errors
    ///
    /// Returns an error if a path contains an option separator or the
    /// string would exceed the kernel's mount data limit.
    pub fn mount_options(&self) -> Result<String> {
        if self.lower_dirs.is_empty() {
            return Err(StockadeError::FilesystemSetup {
                message: "overlay needs at least one lower layer".into(),
            });
        }
        let all = self
            .lower_dirs
            .iter()
            .chain([&self.upper_dir, &self.work_dir]);
        for path in all {
            let text = path.to_string_lossy();
            if text.contains(':') || text.contains(',') {
                return Err(StockadeError::FilesystemSetup {
                    message: format!("layer path {text} contains an overlay separator"),
                });
            }
        }

        let lowers = self
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers,
            self.upper_dir.display(),
            self.work_dir.display()
        );
        if opts.len() > MAX_MOUNT_DATA {
            return Err(StockadeError::FilesystemSetup {
                message: format!(
                    "overlay options are {} bytes, limit is {MAX_MOUNT_DATA}",
                    opts.len()
                ),
            });
        }
        Ok(opts)
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// The upper, work, and merged directories must already exist.
///
/// # Errors
///
/// Returns an error if the option string is invalid or the mount syscall
/// fails (for example when the underlying filesystem cannot host an upper
/// layer).
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let opts = config.mount_options()?;
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| StockadeError::FilesystemSetup {
        message: format!(
            "overlay mount at {} failed: {e}",
            config.merged_dir.display()
        ),
    })?;

    tracing::info!(merged = %config.merged_dir.display(), layers = config.lower_dirs.len(), "overlayfs mounted");
    Ok(())
}

/// Unmounts an `OverlayFS` at the given path.
///
/// Uses `MNT_DETACH` to lazily detach the filesystem. A path that is not a
/// mount point, or no longer exists, is treated as already unmounted.
///
/// # Errors
///
/// Returns an error if the unmount syscall fails for any other reason.
pub fn unmount_overlay(merged_dir: &Path) -> Result<()> {
    use nix::errno::Errno;

    if !super::mount::is_mount_point(merged_dir) {
        tracing::debug!(path = %merged_dir.display(), "overlay not mounted");
        return Ok(());
    }
    match nix::mount::umount2(merged_dir, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::info!(path = %merged_dir.display(), "overlayfs unmounted");
            Ok(())
        }
        Err(Errno::EINVAL | Errno::ENOENT) => {
            tracing::debug!(path = %merged_dir.display(), "overlay already unmounted");
            Ok(())
        }
        Err(e) => Err(StockadeError::Teardown {
            message: format!("unmount overlay at {} failed: {e}", merged_dir.display()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(lowers: &[&str]) -> OverlayConfig {
        OverlayConfig {
            lower_dirs: lowers.iter().map(PathBuf::from).collect(),
            upper_dir: PathBuf::from("/c/upper"),
            work_dir: PathBuf::from("/c/work"),
            merged_dir: PathBuf::from("/c/merged"),
        }
    }

    #[test]
    fn lowerdir_lists_last_layer_first() {
        let opts = config(&["/layers/base", "/layers/mid", "/layers/top"])
            .mount_options()
            .unwrap();
        assert_eq!(
            opts,
            "lowerdir=/layers/top:/layers/mid:/layers/base,upperdir=/c/upper,workdir=/c/work"
        );
    }

    #[test]
    fn separator_in_layer_path_is_rejected() {
        let err = config(&["/layers/a:b"]).mount_options().unwrap_err();
        assert!(matches!(err, StockadeError::FilesystemSetup { .. }));
    }

    #[test]
    fn empty_lower_list_is_rejected() {
        assert!(config(&[]).mount_options().is_err());
    }

    #[test]
    fn oversized_options_are_rejected() {
        let long = format!("/{}", "x".repeat(300));
        let lowers: Vec<&str> = std::iter::repeat_n(long.as_str(), 20).collect();
        assert!(config(&lowers).mount_options().is_err());
    }

    #[test]
    fn unmounting_a_plain_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        unmount_overlay(dir.path()).unwrap();
        unmount_overlay(&dir.path().join("missing")).unwrap();
    }
}
