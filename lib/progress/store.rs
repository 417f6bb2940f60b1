use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{OrderedProgress, ProgressSnapshot};

#[derive(Error, Debug)]
pub enum ProgressStoreError {
    #[error("progress snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("progress snapshot at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Local JSON snapshot of one scan's `OrderedProgress`.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when no snapshot has been written yet.
    pub async fn load(&self) -> Result<Option<OrderedProgress>, ProgressStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        let snapshot: ProgressSnapshot =
            serde_json::from_slice(&bytes).map_err(|source| ProgressStoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(OrderedProgress::from_snapshot(&snapshot)))
    }

    /// Writes through a temp file and rename so a crash never leaves a truncated snapshot.
    pub async fn save(&self, progress: &OrderedProgress) -> Result<(), ProgressStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }
        let encoded = serde_json::to_vec_pretty(&progress.snapshot()).map_err(|source| {
            ProgressStoreError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, encoded)
            .await
            .map_err(|source| self.io_error(source))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: io::Error) -> ProgressStoreError {
        ProgressStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ProgressStore, ProgressStoreError};
    use crate::progress::OrderedProgress;

    #[tokio::test]
    async fn snapshot_survives_a_save_load_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProgressStore::new(dir.path().join("scan-a/progress.json"));
        assert!(store.load().await.expect("load empty").is_none());

        let progress = OrderedProgress::load(40, [42, 45]);
        store.save(&progress).await.expect("save");

        assert_eq!(store.load().await.expect("load"), Some(progress));
    }

    #[tokio::test]
    async fn unreadable_snapshot_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("progress.json");
        std::fs::write(&path, b"{\"frontier\": ").expect("write");

        let err = ProgressStore::new(&path)
            .load()
            .await
            .expect_err("truncated json should fail");
        assert!(matches!(err, ProgressStoreError::Corrupt { .. }));
    }
}
