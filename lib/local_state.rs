use std::path::{Path, PathBuf};

use tracing::info;

/// Per-scan directory holding the queue log, progress snapshot and failure log.
///
/// Keyed by scan identity so independent scan configurations never share files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStateDir {
    dir: PathBuf,
    scan_id: String,
}

impl ScanStateDir {
    pub fn new(state_root: impl AsRef<Path>, scan_id: &str) -> Self {
        let scan_id = sanitize_scan_id(scan_id);
        Self {
            dir: state_root.as_ref().join(&scan_id),
            scan_id,
        }
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue_log_path(&self) -> PathBuf {
        self.dir.join("pending_queue.jsonl")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join("progress.json")
    }

    pub fn failures_path(&self) -> PathBuf {
        self.dir.join("failures.jsonl")
    }

    pub fn owner_path(&self) -> PathBuf {
        self.dir.join("owner_id")
    }

    /// Owner id this scan's leases are taken under.
    ///
    /// An explicit id is recorded and used. Otherwise the id recorded by an earlier run wins, so
    /// a restarted process still recognizes the item leases it took before it died; on the
    /// first run `fallback` is recorded.
    pub async fn pin_owner_id(
        &self,
        explicit: Option<&str>,
        fallback: &str,
    ) -> std::io::Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.owner_path();
        let owner = match explicit {
            Some(owner) => owner.trim().to_string(),
            None => match tokio::fs::read_to_string(&path).await {
                Ok(recorded) if !recorded.trim().is_empty() => {
                    return Ok(recorded.trim().to_string())
                }
                Ok(_) => fallback.to_string(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => fallback.to_string(),
                Err(err) => return Err(err),
            },
        };

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, owner.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        info!(
            event = "scan_owner_pinned",
            scan_id = %self.scan_id,
            owner = %owner,
            "recorded owner id for scan"
        );
        Ok(owner)
    }
}

fn sanitize_scan_id(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::ScanStateDir;

    #[tokio::test]
    async fn restarted_process_keeps_the_recorded_owner() {
        let root = tempfile::tempdir().expect("state root");
        let state = ScanStateDir::new(root.path(), "oldest");

        let first = state.pin_owner_id(None, "host-111").await.expect("pin");
        let after_restart = state.pin_owner_id(None, "host-222").await.expect("pin");
        assert_eq!(first, "host-111");
        assert_eq!(after_restart, "host-111");

        let explicit = state
            .pin_owner_id(Some("gpu-a"), "host-333")
            .await
            .expect("pin");
        assert_eq!(explicit, "gpu-a");
        assert_eq!(state.pin_owner_id(None, "host-444").await.expect("pin"), "gpu-a");
    }

    #[test]
    fn scan_ids_are_reduced_to_safe_directory_names() {
        let state = ScanStateDir::new("/tmp/state", "oldest/../range=300");
        assert_eq!(state.scan_id(), "oldest____range_300");
        assert!(state.queue_log_path().ends_with("oldest____range_300/pending_queue.jsonl"));
        assert_eq!(ScanStateDir::new("/tmp", "  ").scan_id(), "default");
    }
}
