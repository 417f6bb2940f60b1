use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use super::{CreateOutcome, DeleteOutcome, LeaseStore, StoreError, StoreFile};

/// Store operation kinds, used for call accounting and fault scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Read,
    Delete,
    List,
    Commit,
}

impl StoreOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Commit => "commit",
        }
    }

    fn is_mutation(self) -> bool {
        matches!(self, Self::Create | Self::Delete | Self::Commit)
    }
}

/// In-process store shared by simulated clients in tests and single-host dry runs.
///
/// Faults can be scripted per operation (`fail_next`) or switched on for every mutation
/// (`set_outage`) to exercise retry and breaker behavior.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryLeaseStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    scripted_faults: Mutex<HashMap<StoreOp, VecDeque<StoreError>>>,
    call_counts: Mutex<HashMap<StoreOp, u32>>,
    outage: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues errors returned, in order, by the next calls of `op`.
    pub fn fail_next(&self, op: StoreOp, errors: Vec<StoreError>) {
        lock(&self.scripted_faults)
            .entry(op)
            .or_default()
            .extend(errors);
    }

    /// While enabled every mutation fails with a transient error.
    pub fn set_outage(&self, enabled: bool) {
        self.outage.store(enabled, Ordering::SeqCst);
    }

    pub fn calls(&self, op: StoreOp) -> u32 {
        *lock(&self.call_counts).get(&op).unwrap_or(&0)
    }

    pub fn mutation_calls(&self) -> u32 {
        self.calls(StoreOp::Create) + self.calls(StoreOp::Delete) + self.calls(StoreOp::Commit)
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(key).cloned()
    }

    /// Writes a key directly, bypassing accounting and faults.
    pub fn insert_raw(&self, key: impl Into<String>, contents: impl Into<Vec<u8>>) {
        lock(&self.objects).insert(key.into(), contents.into());
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        lock(&self.objects)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn begin(&self, op: StoreOp) -> Result<(), StoreError> {
        *lock(&self.call_counts).entry(op).or_insert(0) += 1;

        if let Some(err) = lock(&self.scripted_faults)
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if op.is_mutation() && self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::transient(op.as_str(), "simulated outage"));
        }
        Ok(())
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn create_if_absent<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<CreateOutcome, StoreError>> {
        Box::pin(async move {
            self.begin(StoreOp::Create)?;
            let mut objects = lock(&self.objects);
            if objects.contains_key(key) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            objects.insert(key.to_string(), payload.to_vec());
            Ok(CreateOutcome::Created)
        })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move {
            self.begin(StoreOp::Read)?;
            Ok(self.get(key))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<DeleteOutcome, StoreError>> {
        Box::pin(async move {
            self.begin(StoreOp::Delete)?;
            let removed = lock(&self.objects).remove(key);
            Ok(match removed {
                Some(_) => DeleteOutcome::Deleted,
                None => DeleteOutcome::NotFound,
            })
        })
    }

    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, StoreError>> {
        let listing = self
            .begin(StoreOp::List)
            .map(|()| self.keys_with_prefix(prefix));
        match listing {
            Ok(keys) => stream::iter(keys.into_iter().map(Ok)).boxed(),
            Err(err) => stream::iter(std::iter::once(Err(err))).boxed(),
        }
    }

    fn commit_batch<'a>(
        &'a self,
        files: &'a [StoreFile],
        _message: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.begin(StoreOp::Commit)?;
            let mut objects = lock(&self.objects);
            for file in files {
                objects.insert(file.key.clone(), file.contents.clone());
            }
            Ok(())
        })
    }
}
