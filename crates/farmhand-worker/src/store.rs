//! Local state store for the task marker.
//!
//! The marker lives in a small JSON file keyed by worker id. Writes go to a
//! temporary file that is synced and then renamed over the old one, so a
//! reader sees either the previous marker or the new one, never a mix.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use farmhand_core::{PersistedTaskMarker, WorkerId};

/// Marker store errors. Any of these is fatal for the worker.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot access marker file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("marker file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable home of the [`PersistedTaskMarker`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store for `worker_id` inside `state_dir`.
    pub fn new(state_dir: &Path, worker_id: &WorkerId) -> Self {
        Self {
            path: state_dir.join(format!("task-marker-{}.json", worker_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the marker, if one exists.
    pub async fn load(&self) -> Result<Option<PersistedTaskMarker>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let marker = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(marker))
    }

    /// Atomically replace the marker. Returns once the write is durable.
    pub async fn save(&self, marker: &PersistedTaskMarker) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(marker).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        debug!(
            task_id = %marker.task_id,
            status = %marker.status,
            seq_reserved = marker.seq_reserved,
            "Task marker saved"
        );
        Ok(())
    }

    /// Remove the marker. Removing a missing marker is not an error.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        sync_parent(&self.path).await.map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Task marker cleared");
        Ok(())
    }
}

/// Write `bytes` to `path` via a synced temporary file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        tokio::fs::remove_file(&tmp).await.ok();
        return Err(e);
    }
    sync_parent(path).await
}

/// Make a rename or unlink in the parent directory durable.
#[cfg(unix)]
async fn sync_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => return Ok(()),
    };
    match tokio::fs::File::open(&parent).await {
        Ok(dir) => dir.sync_all().await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmhand_core::{TaskId, TaskStatus};

    fn store(dir: &Path) -> StateStore {
        StateStore::new(dir, &WorkerId::new("w-1"))
    }

    #[tokio::test]
    async fn test_missing_marker_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut marker = PersistedTaskMarker::claimed(TaskId::new("t1"));

        store.save(&marker).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(marker.clone()));

        marker.finish(TaskStatus::Completed, None, 3);
        store.save(&marker).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.final_seq, Some(3));

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .save(&PersistedTaskMarker::claimed(TaskId::new("t1")))
            .await
            .unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["task-marker-w-1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_marker_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        tokio::fs::write(store.path(), b"garbage").await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_creates_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = store(&nested);
        store
            .save(&PersistedTaskMarker::claimed(TaskId::new("t1")))
            .await
            .unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
