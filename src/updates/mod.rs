//! The update synchronization engine.
//!
//! Business operations append updates to a bucket's log through a [`UnitOfWork`]; clients
//! catch up through [`UpdateEngine::get_updates`]. The engine guarantees, per bucket:
//!
//! - sequence numbers start at 1 and are issued exactly once, in commit order
//! - the persisted counter on the entity record advances in the same commit as the rows it
//!   accounts for
//! - a unit of work commits all of its rows and counter advances, or none of them
//!
//! Writers of the same entity are serialized by the entity's lock row in storage, taken when a
//! unit of work first allocates a seq for it and released when the unit ends. Writers of
//! different entities take different locks and run in parallel; they only share the short
//! storage commit at the end of each unit.

pub mod allocator;
pub mod enqueue;
pub mod sync;
pub mod transaction;

pub use allocator::SequenceGuard;
pub use enqueue::{Enqueued, UpdateWrite};
pub use sync::{BucketState, CatchUpReader, GetUpdates, ResultType, UpdatesSlice};
pub use transaction::UnitOfWork;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::realtime::RealtimeHub;
use crate::storage::{
    Backend, Bucket, EntityLocks, EntityRecord, EntityStore, StorageError, UpdateLog,
};

/// Engine errors.
#[derive(Error, Debug)]
pub enum UpdatesError {
    #[error("Entity not found: {0}")]
    EntityNotFound(Bucket),

    #[error("Entity already exists: {0}")]
    EntityExists(Bucket),

    #[error("Sequence allocation kept conflicting after {attempts} attempts")]
    AllocationConflict { attempts: u32 },

    /// A concurrent writer invalidated this unit of work, or an entity lock could not be had
    /// in time; the unit of work is re-run.
    #[error("Transaction conflict")]
    Conflict,

    #[error("Unit of work aborted: {0}")]
    Aborted(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for UpdatesError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::EntityNotFound(bucket) => UpdatesError::EntityNotFound(bucket),
            StorageError::EntityExists(bucket) => UpdatesError::EntityExists(bucket),
            other => UpdatesError::Storage(other),
        }
    }
}

pub type UpdatesResult<T> = Result<T, UpdatesError>;

/// Engine tuning.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Largest catch-up span served incrementally; longer spans get `TooLong`.
    pub max_total_updates: usize,

    /// Page size used when a request does not specify one.
    pub default_page_size: usize,

    /// Upper bound on any requested page size.
    pub max_page_size: usize,

    /// How many times a conflicting unit of work is run before giving up.
    pub max_allocation_attempts: u32,

    /// How long a writer waits for another writer's entity lock before re-running.
    pub lock_wait: Duration,

    /// Per-subscriber buffer of the realtime hub, in commits.
    pub subscriber_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_total_updates: 1000,
            default_page_size: 100,
            max_page_size: 1000,
            max_allocation_attempts: 16,
            lock_wait: Duration::from_secs(2),
            subscriber_buffer: 256,
        }
    }
}

/// Entry point for enqueuing and reading updates.
pub struct UpdateEngine {
    backend: Arc<Backend>,
    entities: EntityStore,
    log: UpdateLog,
    locks: EntityLocks,
    reader: CatchUpReader,
    hub: Arc<RealtimeHub>,
    config: EngineConfig,
}

impl UpdateEngine {
    pub fn new(backend: Arc<Backend>, config: EngineConfig, hub: Arc<RealtimeHub>) -> Arc<Self> {
        let entities = EntityStore::new(&backend);
        let log = UpdateLog::new(&backend);
        let locks = EntityLocks::new(&backend);
        let reader = CatchUpReader::new(log.clone(), &config);

        info!(
            max_total_updates = config.max_total_updates,
            max_allocation_attempts = config.max_allocation_attempts,
            lock_wait_ms = config.lock_wait.as_millis() as u64,
            "Update engine initialized"
        );

        Arc::new(Self {
            backend,
            entities,
            log,
            locks,
            reader,
            hub,
            config,
        })
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn log(&self) -> &UpdateLog {
        &self.log
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    pub fn reader(&self) -> &CatchUpReader {
        &self.reader
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers an entity so updates can be enqueued for its bucket.
    pub fn create_entity(&self, bucket: Bucket) -> UpdatesResult<EntityRecord> {
        Ok(self.entities.create(bucket)?)
    }

    /// Runs `f` as one atomic unit of work.
    ///
    /// Everything `f` writes through the unit of work (entity records, log rows, counter
    /// advances and business records) commits together when `f` returns `Ok`, and is discarded
    /// when it returns `Err`. `f` runs outside any storage transaction; it is re-run when a
    /// concurrent writer invalidated what it read or an entity lock could not be had in time,
    /// at most `max_allocation_attempts` times in total, so it must not have side effects
    /// outside the unit of work. Committed rows are published to realtime subscribers before
    /// the unit's entity locks are released, so each bucket reaches the hub in seq order.
    pub fn transaction<T, F>(&self, mut f: F) -> UpdatesResult<T>
    where
        F: FnMut(&mut UnitOfWork<'_>) -> UpdatesResult<T>,
    {
        let max_attempts = self.config.max_allocation_attempts.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                debug!(attempt, "Re-running unit of work");
            }

            let mut unit =
                UnitOfWork::new(&self.backend, &self.log, &self.locks, self.config.lock_wait);
            let outcome = f(&mut unit).and_then(|value| unit.commit().map(|()| value));
            match outcome {
                Ok(value) => {
                    self.hub.publish(unit.written());
                    return Ok(value);
                }
                Err(UpdatesError::Conflict) => continue,
                Err(e) => return Err(e),
            }
        }

        warn!(
            attempts = max_attempts,
            "Giving up on unit of work after repeated conflicts"
        );
        Err(UpdatesError::AllocationConflict {
            attempts: max_attempts,
        })
    }

    /// Appends one update to `bucket` in its own unit of work.
    pub fn enqueue(&self, bucket: Bucket, payload: &[u8]) -> UpdatesResult<Enqueued> {
        self.transaction(|unit| unit.enqueue(bucket, payload))
    }

    /// Appends a batch of updates atomically. Results follow the order of `writes`.
    pub fn enqueue_many(&self, writes: &[UpdateWrite]) -> UpdatesResult<Vec<Enqueued>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        self.transaction(|unit| unit.enqueue_many(writes))
    }

    /// Serves a catch-up slice of a bucket's log.
    pub fn get_updates(&self, request: &GetUpdates) -> UpdatesResult<UpdatesSlice> {
        self.reader.get_updates(request)
    }

    /// Latest committed position of a bucket.
    pub fn get_state(&self, bucket: Bucket) -> UpdatesResult<BucketState> {
        self.reader.get_state(bucket)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    pub(crate) fn setup_engine_with(config: EngineConfig) -> Arc<UpdateEngine> {
        let backend = Backend::temporary().unwrap();
        let hub = RealtimeHub::new(config.subscriber_buffer);
        UpdateEngine::new(backend, config, hub)
    }

    pub(crate) fn setup_engine() -> Arc<UpdateEngine> {
        setup_engine_with(EngineConfig::default())
    }

    #[test]
    fn test_storage_errors_map_to_engine_errors() {
        let err: UpdatesError = StorageError::EntityNotFound(Bucket::Chat(1)).into();
        assert!(matches!(err, UpdatesError::EntityNotFound(Bucket::Chat(1))));

        let err: UpdatesError = StorageError::Codec("bad".to_string()).into();
        assert!(matches!(err, UpdatesError::Storage(StorageError::Codec(_))));
    }

    #[test]
    fn test_create_entity_twice() {
        let engine = setup_engine();

        engine.create_entity(Bucket::User(1)).unwrap();
        let err = engine.create_entity(Bucket::User(1)).unwrap_err();
        assert!(matches!(err, UpdatesError::EntityExists(Bucket::User(1))));
    }

    #[test]
    fn test_transaction_returns_value_and_commits() {
        let engine = setup_engine();
        engine.create_entity(Bucket::Chat(4)).unwrap();

        let seqs = engine
            .transaction(|unit| {
                unit.put_record(b"chat/4/title", b"general")?;
                let first = unit.enqueue(Bucket::Chat(4), b"a")?;
                let second = unit.enqueue(Bucket::Chat(4), b"b")?;
                Ok((first.seq, second.seq))
            })
            .unwrap();

        assert_eq!(seqs, (1, 2));
        assert_eq!(engine.log().latest_seq(Bucket::Chat(4)).unwrap(), 2);
        assert_eq!(
            engine.backend.app().get(b"chat/4/title").unwrap().unwrap().as_ref(),
            b"general"
        );
    }

    #[test]
    fn test_conflict_budget_is_bounded() {
        let engine = setup_engine_with(EngineConfig {
            max_allocation_attempts: 3,
            ..EngineConfig::default()
        });
        let runs = Cell::new(0u32);

        let err = engine
            .transaction(|_unit| -> UpdatesResult<()> {
                runs.set(runs.get() + 1);
                Err(UpdatesError::Conflict)
            })
            .unwrap_err();

        assert!(matches!(err, UpdatesError::AllocationConflict { attempts: 3 }));
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn test_writer_of_other_entity_does_not_wait() {
        let engine = setup_engine();
        engine.create_entity(Bucket::Chat(1)).unwrap();
        engine.create_entity(Bucket::Chat(2)).unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let engine = engine.clone();
            thread::spawn(move || {
                engine
                    .transaction(|unit| {
                        let enqueued = unit.enqueue(Bucket::Chat(1), b"slow")?;
                        locked_tx.send(()).unwrap();
                        // Business logic still running while chat:1 is locked
                        release_rx.recv_timeout(Duration::from_secs(10)).ok();
                        Ok(enqueued.seq)
                    })
                    .unwrap()
            })
        };
        locked_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let writer = {
            let engine = engine.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let seq = engine.enqueue(Bucket::Chat(2), b"fast").unwrap().seq;
                done_tx.send(started.elapsed()).unwrap();
                seq
            })
        };

        // chat:2 commits while chat:1's unit of work is still open
        let elapsed = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(engine.log().latest_seq(Bucket::Chat(1)).unwrap(), 0);

        release_tx.send(()).unwrap();
        assert_eq!(holder.join().unwrap(), 1);
        assert_eq!(writer.join().unwrap(), 1);
        assert_eq!(engine.log().latest_seq(Bucket::Chat(1)).unwrap(), 1);
    }

    #[test]
    fn test_writer_of_same_entity_waits_for_commit() {
        let engine = setup_engine();
        engine.create_entity(Bucket::Space(5)).unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = {
            let engine = engine.clone();
            thread::spawn(move || {
                engine
                    .transaction(|unit| {
                        let enqueued = unit.enqueue(Bucket::Space(5), b"first")?;
                        locked_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(100));
                        Ok(enqueued.seq)
                    })
                    .unwrap()
            })
        };
        locked_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let second = engine.enqueue(Bucket::Space(5), b"second").unwrap();

        assert_eq!(holder.join().unwrap(), 1);
        assert_eq!(second.seq, 2);
        assert_eq!(engine.entities().update_seq(Bucket::Space(5)).unwrap(), Some(2));
    }

    #[test]
    fn test_lock_wait_exhausts_attempts() {
        let engine = setup_engine_with(EngineConfig {
            max_allocation_attempts: 2,
            lock_wait: Duration::from_millis(10),
            ..EngineConfig::default()
        });
        engine.create_entity(Bucket::User(9)).unwrap();
        let token = engine.locks().token().unwrap();
        let _guard = engine
            .locks()
            .acquire(Bucket::User(9), token, Duration::ZERO)
            .unwrap()
            .unwrap();

        let err = engine.enqueue(Bucket::User(9), b"blocked").unwrap_err();

        assert!(matches!(err, UpdatesError::AllocationConflict { attempts: 2 }));
        assert_eq!(engine.log().latest_seq(Bucket::User(9)).unwrap(), 0);
        assert_eq!(engine.locks().holder(Bucket::User(9)).unwrap(), Some(token));
    }
}
