//! Error kinds consumed by coordinators and vnodes.

use dotkv_storage::StorageKind;

/// Error carried in reply messages between entities.
///
/// Cheap to copy; the full [`dotkv_storage::StorageError`] stays at the
/// vnode, only its classification travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(StorageKind),
    #[error("timeout")]
    Timeout,
    #[error("mailbox overloaded")]
    Overload,
    #[error("vnode not ready")]
    NotReady,
    #[error("invalid context")]
    InvalidContext,
}

impl From<&dotkv_storage::StorageError> for ErrorKind {
    fn from(e: &dotkv_storage::StorageError) -> Self {
        ErrorKind::Storage(e.kind())
    }
}
