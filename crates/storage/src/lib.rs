//! dotkv-storage: thin contract over the embedded ordered-KV engine.
//!
//! The engine itself is an external collaborator; vnodes consume it only
//! through the [`OrderedStore`] trait. All operations are synchronous,
//! the async boundary is at the caller (the vnode task).
//!
//! Opening a namespace that a prior instance has not yet released reports
//! [`StorageError::Locked`]; [`open_with_retry`] wraps the open sequence
//! with the mandated retry/backoff policy.

pub mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("namespace '{0}' is locked by another instance")]
    Locked(String),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Coarse classification carried on the wire back to coordinators.
    pub fn kind(&self) -> StorageKind {
        match self {
            StorageError::Io(_) => StorageKind::Io,
            StorageError::Locked(_) => StorageKind::Lock,
            StorageError::Corrupt(_) => StorageKind::Corrupt,
        }
    }
}

/// Classification of a [`StorageError`], cheap to copy into reply messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Io,
    Lock,
    Corrupt,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Io => write!(f, "io"),
            StorageKind::Lock => write!(f, "lock"),
            StorageKind::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// A single operation inside a [`OrderedStore::batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Synchronous contract over one ordered-KV namespace.
///
/// Keys are opaque byte strings iterated in lexicographic order by the
/// fold operations.
pub trait OrderedStore: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Apply a sequence of operations atomically.
    fn batch(&mut self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Visit every `(key, value)` pair in key order.
    fn fold(&self, f: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), StorageError>;

    /// Visit every key in key order.
    fn fold_keys(&self, f: &mut dyn FnMut(&[u8])) -> Result<(), StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError>;

    /// Tear down the namespace, removing all stored data.
    fn destroy(self: Box<Self>) -> Result<(), StorageError>;
}

/// Retry policy for engine open/destroy sequences.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Open sequence: up to 5 retries, 2000 ms apart.
    pub const OPEN: Self = Self {
        attempts: 5,
        backoff: Duration::from_millis(2000),
    };

    /// Destroy sequence: up to 2 retries, 2000 ms apart.
    pub const DESTROY: Self = Self {
        attempts: 2,
        backoff: Duration::from_millis(2000),
    };

    pub fn with_backoff(self, backoff: Duration) -> Self {
        Self { backoff, ..self }
    }
}

/// Run `op` until it succeeds or the lock-retry budget is exhausted.
///
/// Only [`StorageError::Locked`] is retried; a prior instance may still be
/// releasing its resources. Any other error surfaces immediately.
pub fn with_lock_retry<T>(
    policy: RetryPolicy,
    mut op: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(StorageError::Locked(ns)) if attempt < policy.attempts => {
                attempt += 1;
                tracing::warn!(
                    namespace = %ns,
                    attempt,
                    max = policy.attempts,
                    "namespace locked, retrying after backoff"
                );
                std::thread::sleep(policy.backoff);
            }
            other => return other,
        }
    }
}

/// Open a [`MemoryStore`] namespace with the standard open retry policy.
pub fn open_with_retry(
    namespace: &str,
    policy: RetryPolicy,
) -> Result<MemoryStore, StorageError> {
    with_lock_retry(policy, || MemoryStore::open(namespace))
}
