use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use super::{validate_key, CreateOutcome, DeleteOutcome, LeaseStore, StoreError, StoreFile};

/// Lease store rooted in a shared directory (NFS mount, synced folder, local disk in tests).
///
/// Create-if-absent writes the payload to a hidden temp file and hard-links it into place, so a
/// reader never observes a half-written lease and exactly one creator wins.
pub struct FsLeaseStore {
    root: PathBuf,
    temp_seq: AtomicU64,
}

impl FsLeaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, op: &'static str, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(op, key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    fn temp_path_for(&self, target: &Path) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{file_name}.{}.{seq}.tmp", std::process::id()))
    }

    async fn write_temp(&self, op: &'static str, target: &Path, contents: &[u8]) -> Result<PathBuf, StoreError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| map_io_error(op, err))?;
        }
        let temp_path = self.temp_path_for(target);
        tokio::fs::write(&temp_path, contents)
            .await
            .map_err(|err| map_io_error(op, err))?;
        Ok(temp_path)
    }

    async fn collect_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(map_io_error("list", err)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| map_io_error("list", err))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = if dir_key.is_empty() {
                    name
                } else {
                    format!("{dir_key}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| map_io_error("list", err))?;
                if file_type.is_dir() {
                    // Only descend into directories that can still contain matching keys.
                    if prefix.starts_with(&key) || key.starts_with(prefix) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

impl LeaseStore for FsLeaseStore {
    fn create_if_absent<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<CreateOutcome, StoreError>> {
        Box::pin(async move {
            let target = self.path_for("create", key)?;
            let temp_path = self.write_temp("create", &target, payload).await?;
            let linked = tokio::fs::hard_link(&temp_path, &target).await;
            let _ = tokio::fs::remove_file(&temp_path).await;

            match linked {
                Ok(()) => Ok(CreateOutcome::Created),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    Ok(CreateOutcome::AlreadyExists)
                }
                Err(err) => Err(map_io_error("create", err)),
            }
        })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move {
            let path = self.path_for("read", key)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(map_io_error("read", err)),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<DeleteOutcome, StoreError>> {
        Box::pin(async move {
            let path = self.path_for("delete", key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(DeleteOutcome::Deleted),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
                Err(err) => Err(map_io_error("delete", err)),
            }
        })
    }

    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, StoreError>> {
        stream::once(self.collect_keys(prefix))
            .flat_map(|listing| match listing {
                Ok(keys) => stream::iter(keys.into_iter().map(Ok)).left_stream(),
                Err(err) => stream::iter(std::iter::once(Err(err))).right_stream(),
            })
            .boxed()
    }

    fn commit_batch<'a>(
        &'a self,
        files: &'a [StoreFile],
        _message: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            // Stage everything first so a failed write leaves no published file behind.
            let mut staged = Vec::with_capacity(files.len());
            for file in files {
                let target = self.path_for("commit", &file.key)?;
                match self.write_temp("commit", &target, &file.contents).await {
                    Ok(temp_path) => staged.push((temp_path, target)),
                    Err(err) => {
                        for (temp_path, _) in &staged {
                            let _ = tokio::fs::remove_file(temp_path).await;
                        }
                        return Err(err);
                    }
                }
            }
            for (temp_path, target) in staged {
                tokio::fs::rename(&temp_path, &target)
                    .await
                    .map_err(|err| map_io_error("commit", err))?;
            }
            Ok(())
        })
    }
}

fn map_io_error(op: &'static str, err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
            StoreError::fatal(op, err.to_string())
        }
        _ => StoreError::transient(op, err.to_string()),
    }
}
