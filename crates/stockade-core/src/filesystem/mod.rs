//! Filesystem layer management for container isolation.
//!
//! Builds each container's root as an `OverlayFS` union of shared read-only
//! layers plus a private upper layer, and tears it down again. Lower layers
//! are never copied, written, or removed by this module.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;

use std::path::{Path, PathBuf};

use stockade_common::error::{Result, StockadeError};
use stockade_common::types::ContainerId;

use self::overlayfs::OverlayConfig;

/// A container's prepared root filesystem.
#[derive(Debug)]
pub struct FilesystemMount {
    /// Read-only lower layers, bottom to top.
    pub lower_dirs: Vec<PathBuf>,
    /// Container-private writable layer.
    pub upper_dir: PathBuf,
    /// Overlay scratch directory.
    pub work_dir: PathBuf,
    /// The view the container sees as `/`.
    pub merged_dir: PathBuf,
    /// Directory holding upper, work, and merged.
    container_dir: PathBuf,
    torn_down: bool,
}

impl FilesystemMount {
    /// Describes a mount rooted at `container_dir` without touching the
    /// filesystem.
    #[must_use]
    pub fn new(container_dir: PathBuf, lower_dirs: Vec<PathBuf>) -> Self {
        Self {
            lower_dirs,
            upper_dir: container_dir.join("upper"),
            work_dir: container_dir.join("work"),
            merged_dir: container_dir.join("merged"),
            container_dir,
            torn_down: false,
        }
    }

    /// Returns whether [`LayerManager::teardown`] already completed.
    #[must_use]
    pub const fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            lower_dirs: self.lower_dirs.clone(),
            upper_dir: self.upper_dir.clone(),
            work_dir: self.work_dir.clone(),
            merged_dir: self.merged_dir.clone(),
        }
    }
}

/// Removes a freshly created container directory unless disarmed.
struct DirGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_dir_all(self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove partial container dir");
            }
        }
    }
}

/// Prepares and removes per-container overlay roots under one directory.
#[derive(Debug, Clone)]
pub struct LayerManager {
    layers_dir: PathBuf,
}

impl LayerManager {
    /// Creates a manager that places container directories under `layers_dir`.
    #[must_use]
    pub fn new(layers_dir: impl Into<PathBuf>) -> Self {
        Self {
            layers_dir: layers_dir.into(),
        }
    }

    /// Returns the directory a container's layers live in.
    #[must_use]
    pub fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.layers_dir.join(id.as_str())
    }

    /// Builds the union root for a container.
    ///
    /// `lower_dirs` are ordered bottom to top; later entries shadow earlier
    /// ones on path collisions.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::FilesystemSetup`] if a lower layer is missing
    /// or unreadable, the container directory already exists or cannot be
    /// created, or the overlay mount fails. Nothing is left behind on error.
    pub fn prepare_root(&self, id: &ContainerId, lower_dirs: &[PathBuf]) -> Result<FilesystemMount> {
        validate_layers(lower_dirs)?;

        std::fs::create_dir_all(&self.layers_dir).map_err(|e| setup_error(&self.layers_dir, &e))?;
        let container_dir = self.container_dir(id);
        std::fs::create_dir(&container_dir).map_err(|e| setup_error(&container_dir, &e))?;
        let mut guard = DirGuard {
            path: &container_dir,
            armed: true,
        };

        let mut fs_mount = FilesystemMount::new(container_dir.clone(), lower_dirs.to_vec());
        for dir in [&fs_mount.upper_dir, &fs_mount.work_dir, &fs_mount.merged_dir] {
            std::fs::create_dir(dir).map_err(|e| setup_error(dir, &e))?;
        }
        overlayfs::mount_overlay(&fs_mount.overlay_config())?;

        guard.armed = false;
        tracing::info!(id = %id, merged = %fs_mount.merged_dir.display(), "container root prepared");
        Ok(fs_mount)
    }

    /// Unmounts the merged view and removes the upper and work layers.
    ///
    /// Safe to call repeatedly and on partially prepared mounts. Lower
    /// layers are never touched.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Teardown`] if the unmount or directory removal
    /// fails.
    pub fn teardown(&self, fs_mount: &mut FilesystemMount) -> Result<()> {
        if fs_mount.torn_down {
            return Ok(());
        }
        overlayfs::unmount_overlay(&fs_mount.merged_dir)?;

        match std::fs::remove_dir_all(&fs_mount.container_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StockadeError::Teardown {
                    message: format!(
                        "cannot remove {}: {e}",
                        fs_mount.container_dir.display()
                    ),
                });
            }
        }
        fs_mount.torn_down = true;
        tracing::info!(dir = %fs_mount.container_dir.display(), "container root torn down");
        Ok(())
    }
}

/// Checks that every lower layer exists, is a directory, and is readable.
///
/// # Errors
///
/// Returns [`StockadeError::FilesystemSetup`] naming the first bad layer.
pub fn validate_layers(lower_dirs: &[PathBuf]) -> Result<()> {
    if lower_dirs.is_empty() {
        return Err(StockadeError::FilesystemSetup {
            message: "at least one lower layer is required".into(),
        });
    }
    for layer in lower_dirs {
        if !layer.is_dir() {
            return Err(StockadeError::FilesystemSetup {
                message: format!("lower layer {} does not exist or is not a directory", layer.display()),
            });
        }
        let _ = std::fs::read_dir(layer).map_err(|e| StockadeError::FilesystemSetup {
            message: format!("lower layer {} is not readable: {e}", layer.display()),
        })?;
    }
    Ok(())
}

fn setup_error(path: &Path, e: &std::io::Error) -> StockadeError {
    StockadeError::FilesystemSetup {
        message: format!("cannot create {}: {e}", path.display()),
    }
}
