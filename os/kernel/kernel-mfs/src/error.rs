use crate::inum::{InodeNumber, MNodeType};
use alloc::string::String;
use thiserror::Error;

/// Insert into a [`WeakCache`](crate::WeakCache) under a key that is
/// already present.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("key already present in weak cache")]
pub struct AlreadyExists;

/// Failures reported by a [`BackingStore`](crate::BackingStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}: no such node")]
    NotFound(InodeNumber),
    #[error("{inum}: i/o error reading page {index}")]
    Io { inum: InodeNumber, index: u64 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MfsError {
    #[error("{0:?}: entry exists")]
    Exists(String),
    #[error("{0:?}: no such entry")]
    NoEntry(String),
    #[error("{inum}: stored as {found:?}")]
    TypeMismatch {
        inum: InodeNumber,
        found: MNodeType,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
