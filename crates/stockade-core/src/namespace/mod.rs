//! Linux namespace management for container isolation.
//!
//! A [`NamespaceSet`] records which kernel isolation domains a container
//! gets. The namespaces come into existence when the entry process is cloned
//! with the set's flags (see [`launch`]); the set then holds references to
//! them until the container is destroyed.

pub mod launch;
pub mod user;
pub mod uts;

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use nix::sched::CloneFlags;
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::NamespaceKind;

/// Returns the `clone(2)` flag creating a namespace of `kind`.
#[must_use]
pub const fn clone_flag(kind: NamespaceKind) -> CloneFlags {
    match kind {
        NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
        NamespaceKind::Mnt => CloneFlags::CLONE_NEWNS,
        NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
    }
}

/// Checks that the running kernel can create namespaces of `kind`.
///
/// # Errors
///
/// Returns [`StockadeError::NamespaceSetup`] if the kind is unsupported or,
/// for user namespaces, disabled by `user.max_user_namespaces`.
pub fn check_support(kind: NamespaceKind) -> Result<()> {
    let link = Path::new("/proc/self/ns").join(kind.proc_name());
    if std::fs::symlink_metadata(&link).is_err() {
        return Err(StockadeError::NamespaceSetup {
            message: format!("kernel does not support {kind} namespaces"),
        });
    }
    if kind == NamespaceKind::User && user::max_user_namespaces() == Some(0) {
        return Err(StockadeError::NamespaceSetup {
            message: "user namespaces are disabled (user.max_user_namespaces = 0)".into(),
        });
    }
    Ok(())
}

/// The namespaces a container isolates, plus references keeping them alive.
#[derive(Debug)]
pub struct NamespaceSet {
    requested: BTreeSet<NamespaceKind>,
    refs: Vec<(NamespaceKind, File)>,
}

impl NamespaceSet {
    /// Validates kernel support for every requested kind and returns the set.
    /// Kinds not requested are shared with the host.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NamespaceSetup`] naming the first
    /// unsupported kind.
    pub fn create_isolated(requested: &BTreeSet<NamespaceKind>) -> Result<Self> {
        for kind in requested {
            check_support(*kind)?;
        }
        let set = Self {
            requested: requested.clone(),
            refs: Vec::new(),
        };
        tracing::debug!(isolated = ?set.requested, shared = ?set.shared(), "namespace set prepared");
        Ok(set)
    }

    /// Returns whether `kind` is isolated.
    #[must_use]
    pub fn isolates(&self, kind: NamespaceKind) -> bool {
        self.requested.contains(&kind)
    }

    /// Returns the kinds shared with the host.
    #[must_use]
    pub fn shared(&self) -> Vec<NamespaceKind> {
        NamespaceKind::ALL
            .into_iter()
            .filter(|kind| !self.requested.contains(kind))
            .collect()
    }

    /// Returns the combined `clone(2)` flags.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        self.requested
            .iter()
            .fold(CloneFlags::empty(), |flags, kind| flags | clone_flag(*kind))
    }

    /// Opens `/proc/<pid>/ns/<kind>` for every isolated kind and holds the
    /// references.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NamespaceSetup`] if a reference cannot be
    /// opened. References opened so far are kept and released by
    /// [`Self::close`].
    pub fn hold_refs(&mut self, pid: u32) -> Result<()> {
        for kind in self.requested.clone() {
            let path = format!("/proc/{pid}/ns/{}", kind.proc_name());
            let file = File::open(&path).map_err(|e| StockadeError::NamespaceSetup {
                message: format!("cannot open {path}: {e}"),
            })?;
            self.refs.push((kind, file));
        }
        tracing::debug!(pid, count = self.refs.len(), "holding namespace references");
        Ok(())
    }

    /// Returns how many namespace references are held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.refs.len()
    }

    /// Drops every held reference. Idempotent.
    pub fn close(&mut self) {
        if !self.refs.is_empty() {
            tracing::debug!(count = self.refs.len(), "closing namespace references");
            self.refs.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(kinds: &[NamespaceKind]) -> BTreeSet<NamespaceKind> {
        kinds.iter().copied().collect()
    }

    #[test]
    fn flags_cover_requested_kinds_only() {
        let set = NamespaceSet {
            requested: set_of(&[NamespaceKind::Pid, NamespaceKind::Mnt]),
            refs: Vec::new(),
        };
        let flags = set.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert_eq!(
            set.shared(),
            vec![
                NamespaceKind::User,
                NamespaceKind::Net,
                NamespaceKind::Uts,
                NamespaceKind::Ipc
            ]
        );
    }

    #[test]
    fn empty_request_shares_everything() {
        let set = NamespaceSet::create_isolated(&BTreeSet::new()).unwrap();
        assert!(set.clone_flags().is_empty());
        assert_eq!(set.shared().len(), NamespaceKind::ALL.len());
    }

    #[test]
    fn own_namespaces_can_be_held_and_closed() {
        let requested = set_of(&[NamespaceKind::Uts, NamespaceKind::Ipc]);
        let mut set = NamespaceSet::create_isolated(&requested).unwrap();
        set.hold_refs(std::process::id()).unwrap();
        assert_eq!(set.held(), 2);
        set.close();
        assert_eq!(set.held(), 0);
        set.close();
    }
}
