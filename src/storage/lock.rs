//! Per-entity write locks kept in the `locks` tree.
//!
//! A lock is a row keyed by the bucket whose value is the holder's token. It is taken with a
//! compare-and-swap from absent and released with a compare-and-swap back to absent, so two
//! writers of the same entity are serialized by the storage layer, while writers of different
//! entities touch different keys and never wait on each other.
//!
//! Tokens come from [`sled::Db::generate_id`], which never repeats for a database. Only one
//! process can open a sled database, so [`Backend::new`] drops rows left behind by a previous
//! process.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sled::IVec;
use tracing::{debug, warn};

use crate::storage::{Backend, Bucket, StorageResult};

/// First sleep between attempts on a held lock.
const MIN_BACKOFF: Duration = Duration::from_micros(50);

/// Longest sleep between attempts on a held lock.
const MAX_BACKOFF: Duration = Duration::from_millis(5);

/// The lock table.
#[derive(Clone)]
pub struct EntityLocks {
    backend: Arc<Backend>,
}

impl EntityLocks {
    pub fn new(backend: &Arc<Backend>) -> Self {
        Self {
            backend: backend.clone(),
        }
    }

    /// A fresh holder token.
    pub fn token(&self) -> StorageResult<u64> {
        Ok(self.backend.generate_id()?)
    }

    /// Takes the lock of `bucket` for `token`, waiting up to `wait` for the current holder.
    ///
    /// Returns `None` when the wait ran out.
    pub fn acquire(
        &self,
        bucket: Bucket,
        token: u64,
        wait: Duration,
    ) -> StorageResult<Option<EntityLockGuard>> {
        let deadline = Instant::now() + wait;
        let mut backoff = MIN_BACKOFF;

        loop {
            let swapped = self.backend.locks().compare_and_swap(
                bucket.key(),
                None as Option<&[u8]>,
                Some(token.to_be_bytes().to_vec()),
            )?;
            if swapped.is_ok() {
                return Ok(Some(EntityLockGuard {
                    locks: self.clone(),
                    bucket,
                    token,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(bucket = %bucket, ?wait, "Timed out waiting for entity lock");
                return Ok(None);
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Token of the current holder of `bucket`, if any.
    pub fn holder(&self, bucket: Bucket) -> StorageResult<Option<u64>> {
        Ok(self
            .backend
            .locks()
            .get(bucket.key())?
            .and_then(|value| decode_token(&value)))
    }

    fn release(&self, bucket: Bucket, token: u64) -> StorageResult<()> {
        let swapped = self.backend.locks().compare_and_swap(
            bucket.key(),
            Some(token.to_be_bytes()),
            None as Option<IVec>,
        )?;
        if swapped.is_err() {
            warn!(bucket = %bucket, token, "Entity lock was not held by its releaser");
        }
        Ok(())
    }
}

/// A held entity lock, released on drop.
pub struct EntityLockGuard {
    locks: EntityLocks,
    bucket: Bucket,
    token: u64,
}

impl EntityLockGuard {
    pub fn bucket(&self) -> Bucket {
        self.bucket
    }
}

impl Drop for EntityLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(self.bucket, self.token) {
            warn!(bucket = %self.bucket, error = %e, "Failed to release entity lock");
        }
    }
}

fn decode_token(value: &[u8]) -> Option<u64> {
    value.try_into().ok().map(u64::from_be_bytes)
}
