//! Minimal object-store surface that all cross-client coordination is built on.
//!
//! Implementations must provide create-if-absent atomicity per key and nothing more: no
//! compare-and-swap, no cross-key transactions, no read-after-write guarantee for listings.
//! Nothing in this module retries; retry and breaker policy live in `commit_governor`.

mod fs;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

pub use fs::FsLeaseStore;
pub use memory::{MemoryLeaseStore, StoreOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// One file in a batched commit. Existing keys are overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFile {
    pub key: String,
    pub contents: Vec<u8>,
}

impl StoreFile {
    pub fn new(key: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            contents: contents.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure during {op}: {message}")]
    Transient { op: &'static str, message: String },
    #[error("store rate limited {op} (retry after {retry_after:?})")]
    RateLimited {
        op: &'static str,
        retry_after: Option<Duration>,
    },
    #[error("store rejected {op}: {message}")]
    Fatal { op: &'static str, message: String },
}

impl StoreError {
    pub fn transient(op: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            op,
            message: message.into(),
        }
    }

    pub fn fatal(op: &'static str, message: impl Into<String>) -> Self {
        Self::Fatal {
            op,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Shared remote store holding leases, done markers and published artifacts.
pub trait LeaseStore: Send + Sync {
    fn create_if_absent<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<CreateOutcome, StoreError>>;

    /// Returns `None` when the key does not exist.
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<DeleteOutcome, StoreError>>;

    /// Lazily yields keys under `prefix`. Listings may be stale or partial.
    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, StoreError>>;

    /// Writes every file in one remote operation, overwriting existing keys.
    fn commit_batch<'a>(
        &'a self,
        files: &'a [StoreFile],
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl<T> LeaseStore for Arc<T>
where
    T: LeaseStore + ?Sized,
{
    fn create_if_absent<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<CreateOutcome, StoreError>> {
        (**self).create_if_absent(key, payload)
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        (**self).read(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<DeleteOutcome, StoreError>> {
        (**self).delete(key)
    }

    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, StoreError>> {
        (**self).list_prefix(prefix)
    }

    fn commit_batch<'a>(
        &'a self,
        files: &'a [StoreFile],
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).commit_batch(files, message)
    }
}

pub type SharedLeaseStore = Arc<dyn LeaseStore>;

/// Rejects keys that could escape the store root or collide with temp files.
pub(crate) fn validate_key(op: &'static str, key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StoreError::fatal(op, format!("invalid store key `{key}`")));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment.starts_with('.') {
            return Err(StoreError::fatal(
                op,
                format!("invalid segment `{segment}` in store key `{key}`"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_key, StoreError};
    use std::time::Duration;

    #[test]
    fn key_validation_rejects_traversal_and_hidden_segments() {
        assert!(validate_key("read", "locks/abc.json").is_ok());
        assert!(validate_key("read", "../etc/passwd").is_err());
        assert!(validate_key("read", "/abs/key").is_err());
        assert!(validate_key("read", "locks//double").is_err());
        assert!(validate_key("read", "locks/.tmp").is_err());
        assert!(validate_key("read", "").is_err());
    }

    #[test]
    fn rate_limited_errors_are_retryable_and_expose_delay() {
        let err = StoreError::RateLimited {
            op: "commit",
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(!StoreError::fatal("commit", "forbidden").is_retryable());
        assert!(StoreError::transient("read", "reset").is_retryable());
    }
}
