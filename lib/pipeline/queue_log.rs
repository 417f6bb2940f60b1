use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::types::{CompletionKind, QueueEntry};

#[derive(Error, Debug)]
pub enum QueueLogError {
    #[error("queue log io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A complete line that does not parse. Needs an operator; replay stops here.
    #[error("queue log {path} is corrupt at line {line}: {source}")]
    Corruption {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl QueueLogError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Enqueue { seq: u64, entry: QueueEntry },
    Ack { seq: u64, outcome: CompletionKind },
}

/// An accepted entry that has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEntry {
    pub seq: u64,
    pub entry: QueueEntry,
}

struct Writer {
    file: File,
    next_seq: u64,
}

/// Append-only JSONL log of accepted entries and their acknowledgements.
///
/// Every append is flushed to disk before it returns. A torn final line (crash mid-write) is
/// dropped on open; any other unparseable line is reported as corruption.
pub struct QueueLog {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl QueueLog {
    /// Opens or creates the log and returns the entries still pending from earlier runs.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<LoggedEntry>), QueueLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| QueueLogError::io(&path, err))?;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(QueueLogError::io(&path, err)),
        };
        let replay = replay(&path, &bytes)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| QueueLogError::io(&path, err))?;
        if replay.valid_len < bytes.len() {
            warn!(
                event = "queue_log_torn_tail",
                path = %path.display(),
                dropped_bytes = bytes.len() - replay.valid_len,
                "dropping partially written final queue log line"
            );
            file.set_len(replay.valid_len as u64)
                .await
                .map_err(|err| QueueLogError::io(&path, err))?;
        }

        let pending: Vec<LoggedEntry> = replay.pending.into_values().collect();
        if !pending.is_empty() {
            info!(
                event = "queue_log_replayed",
                path = %path.display(),
                pending = pending.len(),
                "found unfinished entries from an earlier run"
            );
        }

        Ok((
            Self {
                path,
                writer: Mutex::new(Writer {
                    file,
                    next_seq: replay.next_seq,
                }),
            },
            pending,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably records an accepted entry and returns its sequence number.
    pub async fn append(&self, entry: &QueueEntry) -> Result<u64, QueueLogError> {
        let mut writer = self.writer.lock().await;
        let seq = writer.next_seq;
        let record = LogRecord::Enqueue {
            seq,
            entry: entry.clone(),
        };
        self.write_record(&mut writer.file, &record).await?;
        writer.next_seq += 1;
        Ok(seq)
    }

    pub async fn ack(&self, seq: u64, outcome: CompletionKind) -> Result<(), QueueLogError> {
        let mut writer = self.writer.lock().await;
        self.write_record(&mut writer.file, &LogRecord::Ack { seq, outcome })
            .await
    }

    /// Pending entries as currently recorded on disk.
    pub async fn pending(&self) -> Result<Vec<LoggedEntry>, QueueLogError> {
        let _writer = self.writer.lock().await;
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| QueueLogError::io(&self.path, err))?;
        Ok(replay(&self.path, &bytes)?.pending.into_values().collect())
    }

    /// Drops every pending entry. Returns how many were discarded.
    pub async fn clear(&self) -> Result<usize, QueueLogError> {
        let pending = self.pending().await?;
        self.compact(&[]).await?;
        Ok(pending.len())
    }

    /// Rewrites the log so it holds exactly `live`, keeping their sequence numbers.
    pub async fn compact(&self, live: &[LoggedEntry]) -> Result<(), QueueLogError> {
        let mut writer = self.writer.lock().await;

        let mut body = Vec::new();
        for logged in live {
            let record = LogRecord::Enqueue {
                seq: logged.seq,
                entry: logged.entry.clone(),
            };
            body.extend(encode_line(&self.path, &record)?);
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(|err| QueueLogError::io(&tmp_path, err))?;
        tmp.write_all(&body)
            .await
            .map_err(|err| QueueLogError::io(&tmp_path, err))?;
        tmp.sync_all()
            .await
            .map_err(|err| QueueLogError::io(&tmp_path, err))?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|err| QueueLogError::io(&self.path, err))?;

        writer.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| QueueLogError::io(&self.path, err))?;
        info!(
            event = "queue_log_compacted",
            path = %self.path.display(),
            live = live.len(),
            "rewrote queue log with live entries only"
        );
        Ok(())
    }

    async fn write_record(&self, file: &mut File, record: &LogRecord) -> Result<(), QueueLogError> {
        let line = encode_line(&self.path, record)?;
        file.write_all(&line)
            .await
            .map_err(|err| QueueLogError::io(&self.path, err))?;
        file.sync_data()
            .await
            .map_err(|err| QueueLogError::io(&self.path, err))
    }
}

fn encode_line(path: &Path, record: &LogRecord) -> Result<Vec<u8>, QueueLogError> {
    let mut line = serde_json::to_vec(record).map_err(|err| QueueLogError::Io {
        path: path.to_path_buf(),
        source: err.into(),
    })?;
    line.push(b'\n');
    Ok(line)
}

struct Replay {
    pending: BTreeMap<u64, LoggedEntry>,
    next_seq: u64,
    valid_len: usize,
}

fn replay(path: &Path, bytes: &[u8]) -> Result<Replay, QueueLogError> {
    let mut pending = BTreeMap::new();
    let mut next_seq = 0;
    let mut offset = 0;
    let mut line_no = 0;

    while offset < bytes.len() {
        line_no += 1;
        let (line, terminated, consumed) = match bytes[offset..].iter().position(|b| *b == b'\n') {
            Some(idx) => (&bytes[offset..offset + idx], true, idx + 1),
            None => (&bytes[offset..], false, bytes.len() - offset),
        };

        if line.iter().all(u8::is_ascii_whitespace) {
            offset += consumed;
            continue;
        }

        match serde_json::from_slice::<LogRecord>(line) {
            Ok(LogRecord::Enqueue { seq, entry }) => {
                next_seq = next_seq.max(seq + 1);
                pending.insert(seq, LoggedEntry { seq, entry });
            }
            Ok(LogRecord::Ack { seq, .. }) => {
                pending.remove(&seq);
            }
            // Unterminated tail: the process died mid-append.
            Err(_) if !terminated => break,
            Err(source) => {
                return Err(QueueLogError::Corruption {
                    path: path.to_path_buf(),
                    line: line_no,
                    source,
                })
            }
        }
        offset += consumed;
    }

    Ok(Replay {
        pending,
        next_seq,
        valid_len: offset,
    })
}
