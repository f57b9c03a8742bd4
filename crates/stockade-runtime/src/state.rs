//! Persistent state management.
//!
//! Maintains a local JSON index of container snapshots so that a separate
//! process (`stockade ps`, `stockade inspect`) can observe containers
//! without a daemon. The orchestrator stays the source of truth.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use stockade_common::error::{Result, StockadeError};
use stockade_common::types::ContainerId;

use crate::container::ContainerInfo;

/// JSON file holding the latest snapshot of every known container.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl StateStore {
    /// Creates a store backed by `path`. Nothing is read or written yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the index file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every entry. A missing file is an empty index.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(&self) -> Result<Vec<ContainerInfo>> {
        tracing::debug!(path = %self.path.display(), "loading state index");
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StockadeError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Returns the entry for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] if no entry exists, or an error if
    /// the index cannot be loaded.
    pub fn find(&self, id: &ContainerId) -> Result<ContainerInfo> {
        self.load()?
            .into_iter()
            .find(|info| &info.id == id)
            .ok_or_else(|| StockadeError::NotFound {
                kind: "container",
                id: id.to_string(),
            })
    }

    /// Inserts or replaces the entry for `info.id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or written.
    pub fn upsert(&self, info: &ContainerInfo) -> Result<()> {
        self.update(|entries| {
            match entries.iter_mut().find(|e| e.id == info.id) {
                Some(existing) => *existing = info.clone(),
                None => entries.push(info.clone()),
            }
        })
    }

    /// Removes the entry for `id`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or written.
    pub fn remove(&self, id: &ContainerId) -> Result<()> {
        self.update(|entries| entries.retain(|e| &e.id != id))
    }

    fn update(&self, apply: impl FnOnce(&mut Vec<ContainerInfo>)) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load()?;
        apply(&mut entries);
        self.save(&entries)
    }

    /// Writes the index atomically through a temporary file and rename.
    fn save(&self, entries: &[ContainerInfo]) -> Result<()> {
        let io_err = |path: &Path, e| StockadeError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), count = entries.len(), "state index saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use stockade_common::types::LifecycleState;

    use super::*;

    fn info(id: &str, state: LifecycleState) -> ContainerInfo {
        ContainerInfo {
            id: ContainerId::new(id).unwrap(),
            state,
            pid: None,
            hostname: id.into(),
            namespaces: Vec::new(),
            layers: vec![PathBuf::from("/layers/base")],
            root: None,
            cgroup: None,
            network: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_status: None,
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn upsert_replaces_and_remove_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/state.json"));
        store.upsert(&info("a", LifecycleState::Created)).unwrap();
        store.upsert(&info("b", LifecycleState::Created)).unwrap();
        store.upsert(&info("a", LifecycleState::Running)).unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 2);
        let a = store.find(&ContainerId::new("a").unwrap()).unwrap();
        assert_eq!(a.state, LifecycleState::Running);

        store.remove(&ContainerId::new("a").unwrap()).unwrap();
        assert!(matches!(
            store.find(&ContainerId::new("a").unwrap()),
            Err(StockadeError::NotFound { .. })
        ));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn corrupt_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = StateStore::new(path);
        assert!(matches!(store.load(), Err(StockadeError::Serialization { .. })));
    }
}
