//! Units of work.
//!
//! A [`UnitOfWork`] is the view a business operation gets of the database while it runs inside
//! [`UpdateEngine::transaction`](crate::updates::UpdateEngine::transaction). Reads see the
//! committed trees overlaid with the unit's own writes. Writes are staged in memory and applied
//! by [`UnitOfWork::commit`] in one short sled transaction, which first checks that every
//! entity and business record the unit read is unchanged. The caller's logic never runs inside
//! a storage transaction, and a failed or abandoned unit leaves nothing behind.
//!
//! Allocating a sequence number takes the entity's lock (see [`EntityLocks`]). The lock is
//! held until the unit is dropped, after its commit or rollback.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use sled::IVec;
use tracing::debug;

use crate::storage::log::{encode_row, row_key};
use crate::storage::{
    Backend, Bucket, EntityLockGuard, EntityLocks, EntityRecord, StorageError, UpdateLog,
    UpdateRow,
};
use crate::updates::allocator::SequenceGuard;
use crate::updates::{UpdatesError, UpdatesResult};

/// One run of a unit of work.
pub struct UnitOfWork<'a> {
    backend: &'a Backend,
    log: &'a UpdateLog,
    locks: &'a EntityLocks,
    lock_wait: Duration,

    /// Lock holder token, issued on the first lock
    token: Option<u64>,
    held: BTreeMap<Bucket, EntityLockGuard>,

    /// Committed values seen by this run, re-checked at commit
    entity_reads: BTreeMap<Bucket, Option<IVec>>,
    app_reads: BTreeMap<Vec<u8>, Option<IVec>>,

    entity_writes: BTreeMap<Bucket, EntityRecord>,
    app_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    row_writes: Vec<(Vec<u8>, Vec<u8>)>,

    /// Rows appended by this run, published once it commits
    written: Vec<UpdateRow>,
}

impl<'a> UnitOfWork<'a> {
    pub(crate) fn new(
        backend: &'a Backend,
        log: &'a UpdateLog,
        locks: &'a EntityLocks,
        lock_wait: Duration,
    ) -> Self {
        Self {
            backend,
            log,
            locks,
            lock_wait,
            token: None,
            held: BTreeMap::new(),
            entity_reads: BTreeMap::new(),
            app_reads: BTreeMap::new(),
            entity_writes: BTreeMap::new(),
            app_writes: BTreeMap::new(),
            row_writes: Vec::new(),
            written: Vec::new(),
        }
    }

    /// Registers an entity in this unit of work, so it can receive updates before commit.
    pub fn create_entity(&mut self, bucket: Bucket) -> UpdatesResult<EntityRecord> {
        if self.entity_record(bucket)?.is_some() {
            return Err(UpdatesError::EntityExists(bucket));
        }
        let record = EntityRecord::new(Utc::now());
        self.entity_writes.insert(bucket, record.clone());
        debug!(bucket = %bucket, "Registered entity in unit of work");
        Ok(record)
    }

    pub fn entity_exists(&mut self, bucket: Bucket) -> UpdatesResult<bool> {
        Ok(self.entity_record(bucket)?.is_some())
    }

    /// Reads a business record, including writes made earlier in this unit of work.
    pub fn get_record(&mut self, key: &[u8]) -> UpdatesResult<Option<IVec>> {
        if let Some(staged) = self.app_writes.get(key) {
            return Ok(staged.as_deref().map(IVec::from));
        }
        if let Some(seen) = self.app_reads.get(key) {
            return Ok(seen.clone());
        }
        let seen = self.backend.app().get(key).map_err(StorageError::from)?;
        self.app_reads.insert(key.to_vec(), seen.clone());
        Ok(seen)
    }

    pub fn put_record(&mut self, key: &[u8], value: &[u8]) -> UpdatesResult<Option<IVec>> {
        let previous = self.get_record(key)?;
        self.app_writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(previous)
    }

    pub fn remove_record(&mut self, key: &[u8]) -> UpdatesResult<Option<IVec>> {
        let previous = self.get_record(key)?;
        self.app_writes.insert(key.to_vec(), None);
        Ok(previous)
    }

    /// Writes one row at an already allocated seq.
    pub(crate) fn append_row(
        &mut self,
        bucket: Bucket,
        seq: i64,
        payload: &[u8],
    ) -> UpdatesResult<UpdateRow> {
        let row = UpdateRow {
            bucket,
            seq,
            payload: payload.to_vec(),
            created_at: Utc::now(),
        };
        self.row_writes.push((
            row_key(bucket, seq).to_vec(),
            encode_row(row.created_at, &row.payload)?,
        ));
        self.written.push(row.clone());
        Ok(row)
    }

    pub(crate) fn written(&self) -> &[UpdateRow] {
        &self.written
    }

    /// Applies the staged writes atomically.
    ///
    /// Fails with `Conflict` when a record this run read was changed by someone else, or when
    /// one of its rows already exists; nothing is written then.
    pub(crate) fn commit(&self) -> UpdatesResult<()> {
        if self.entity_writes.is_empty() && self.app_writes.is_empty() && self.row_writes.is_empty()
        {
            return Ok(());
        }

        let entity_writes = self
            .entity_writes
            .iter()
            .map(|(bucket, record)| Ok((bucket.key(), record.encode()?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let trees = (
            self.backend.entities(),
            self.backend.updates(),
            self.backend.app(),
        );
        let result = trees.transaction(|(entities, updates, app)| {
            for (bucket, seen) in &self.entity_reads {
                if entities.get(bucket.key())? != *seen {
                    debug!(bucket = %bucket, "Entity record changed under unit of work");
                    return conflict();
                }
            }
            for (key, seen) in &self.app_reads {
                if app.get(key.as_slice())? != *seen {
                    return conflict();
                }
            }

            for (key, value) in &self.row_writes {
                if updates.insert(key.as_slice(), value.as_slice())?.is_some() {
                    return conflict();
                }
            }
            for (key, value) in &entity_writes {
                entities.insert(&key[..], value.as_slice())?;
            }
            for (key, value) in &self.app_writes {
                match value {
                    Some(value) => app.insert(key.as_slice(), value.as_slice())?,
                    None => app.remove(key.as_slice())?,
                };
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StorageError::from(e).into()),
        }
    }

    fn entity_record(&mut self, bucket: Bucket) -> UpdatesResult<Option<EntityRecord>> {
        if let Some(record) = self.entity_writes.get(&bucket) {
            return Ok(Some(record.clone()));
        }
        let data = match self.entity_reads.get(&bucket) {
            Some(seen) => seen.clone(),
            None => {
                let seen = self.backend.entities().get(bucket.key()).map_err(StorageError::from)?;
                self.entity_reads.insert(bucket, seen.clone());
                seen
            }
        };
        Ok(data.map(|data| EntityRecord::decode(&data)).transpose()?)
    }
}

fn conflict<T>() -> ConflictableTransactionResult<T, UpdatesError> {
    Err(ConflictableTransactionError::Abort(UpdatesError::Conflict))
}

impl SequenceGuard for UnitOfWork<'_> {
    fn lock_entity(&mut self, bucket: Bucket) -> UpdatesResult<()> {
        if self.held.contains_key(&bucket) {
            return Ok(());
        }
        let token = match self.token {
            Some(token) => token,
            None => {
                let token = self.locks.token()?;
                self.token = Some(token);
                token
            }
        };
        // A timeout may be a lock cycle with another unit; re-running releases ours
        let guard = self
            .locks
            .acquire(bucket, token, self.lock_wait)?
            .ok_or(UpdatesError::Conflict)?;
        self.held.insert(bucket, guard);
        Ok(())
    }

    fn persisted_seq(&mut self, bucket: Bucket) -> UpdatesResult<Option<i64>> {
        Ok(self
            .entity_record(bucket)?
            .ok_or(UpdatesError::EntityNotFound(bucket))?
            .update_seq)
    }

    fn persist_seq(&mut self, bucket: Bucket, seq: i64) -> UpdatesResult<()> {
        let mut record = self
            .entity_record(bucket)?
            .ok_or(UpdatesError::EntityNotFound(bucket))?;
        record.update_seq = Some(seq);
        self.entity_writes.insert(bucket, record);
        Ok(())
    }

    fn row_exists(&self, bucket: Bucket, seq: i64) -> UpdatesResult<bool> {
        if self
            .written
            .iter()
            .any(|row| row.bucket == bucket && row.seq == seq)
        {
            return Ok(true);
        }
        Ok(self.backend.updates().get(row_key(bucket, seq)).map_err(StorageError::from)?.is_some())
    }

    fn log_head(&self, bucket: Bucket) -> UpdatesResult<i64> {
        let staged = self
            .written
            .iter()
            .filter(|row| row.bucket == bucket)
            .map(|row| row.seq)
            .max()
            .unwrap_or(0);
        Ok(self.log.latest_seq(bucket)?.max(staged))
    }
}
