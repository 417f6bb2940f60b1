use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::types::{EntryOrigin, QueueEntry};
use crate::work::WorkId;

#[derive(Error, Debug)]
#[error("failure log io error at {path}: {source}")]
pub struct FailureLogError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// One item that left the pipeline without being published, kept for operator triage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub run_id: String,
    pub work_id: WorkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    pub origin: EntryOrigin,
    pub attempts: u32,
    pub failure_class: String,
    pub message: String,
    pub failed_at_ms: u64,
}

impl FailureRecord {
    pub fn from_entry(
        run_id: impl Into<String>,
        entry: &QueueEntry,
        failure_class: &str,
        message: impl Into<String>,
        failed_at_ms: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            work_id: entry.work_id.clone(),
            position: entry.position,
            origin: entry.origin,
            attempts: entry.attempt_count,
            failure_class: failure_class.to_string(),
            message: message.into(),
            failed_at_ms,
        }
    }
}

/// Append-only `failures.jsonl` for one scan.
pub struct FailureLog {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id: run_id.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn append(&self, record: &FailureRecord) -> Result<(), FailureLogError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.error(source))?;
        }
        let mut line = serde_json::to_vec(record).map_err(|err| self.error(err.into()))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.error(source))?;
        file.write_all(&line)
            .await
            .map_err(|source| self.error(source))?;
        file.sync_data().await.map_err(|source| self.error(source))
    }

    /// Every parseable record, oldest first. Unparseable lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<FailureRecord>, FailureLogError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.error(err)),
        };
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn error(&self, source: std::io::Error) -> FailureLogError {
        FailureLogError {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FailureLog, FailureRecord};
    use crate::pipeline::types::{EntryOrigin, QueueEntry};
    use crate::work::WorkId;

    #[tokio::test]
    async fn records_append_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = FailureLog::new(dir.path().join("scan").join("failures.jsonl"), "run-1");
        assert!(log.read_all().await.expect("empty").is_empty());

        let entry = QueueEntry::new(WorkId::parse("p9").expect("id"), EntryOrigin::Manual)
            .with_position(9);
        let record = FailureRecord::from_entry(log.run_id(), &entry, "processing", "exit 3", 42);
        log.append(&record).await.expect("append");
        log.append(&record).await.expect("append");

        let records = log.read_all().await.expect("read");
        assert_eq!(records, vec![record.clone(), record]);
        assert_eq!(records[0].position, Some(9));
    }
}
