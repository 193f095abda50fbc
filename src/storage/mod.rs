//! Storage layer for the update engine, built on sled.
//!
//! - `backend`: the sled database and its trees
//! - `entity`: buckets and the per-entity sequence counter (the sequence store)
//! - `lock`: per-entity write locks taken by units of work
//! - `log`: the append-only update log with ordered range scans
//! - `retention`: optional background pruning of old log rows
//!
//! Keys are laid out big-endian so that sled's byte ordering matches `(kind, entity_id, seq)`
//! ordering, which makes "latest seq of a bucket" a reverse prefix scan and catch-up a forward
//! range scan.

pub mod backend;
pub mod entity;
pub mod lock;
pub mod log;
pub mod retention;

pub use backend::{Backend, BackendConfig, BackendError, BackendResult};
pub use entity::{Bucket, BucketKind, EntityRecord, EntityStore};
pub use lock::{EntityLockGuard, EntityLocks};
pub use log::{UpdateLog, UpdateRow};
pub use retention::{PruneStats, Pruner, RetentionMode};

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(Bucket),

    #[error("Entity already exists: {0}")]
    EntityExists(Bucket),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Backend(BackendError::SledError(e))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Codec(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
