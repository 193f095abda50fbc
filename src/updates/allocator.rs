//! Sequence allocation.
//!
//! The persisted counter on the entity record is authoritative. The update log is consulted only
//! when the counter was never initialized, or when the row right after the counter already
//! exists (the counter drifted behind the log). In both cases the next seq is the log head plus
//! one, and the counter is written back in the same unit of work as the row.
//!
//! Everything above happens under the entity's lock, so the counter read-modify-write of two
//! writers of one entity never interleaves, while writers of other entities proceed untouched.

use tracing::{debug, warn};

use crate::storage::Bucket;
use crate::updates::{UpdatesError, UpdatesResult};

/// Exclusive access to one entity's sequence state for the duration of a unit of work.
///
/// Once [`lock_entity`](SequenceGuard::lock_entity) returns, no other guard can lock the same
/// entity until this one commits or rolls back. [`UnitOfWork`](crate::updates::UnitOfWork)
/// implements it with lock rows in storage.
pub trait SequenceGuard {
    /// Takes exclusive access to the entity's sequence state. Fails with `Conflict` when the
    /// lock could not be had in time.
    fn lock_entity(&mut self, bucket: Bucket) -> UpdatesResult<()>;

    /// The entity's persisted counter. Fails with `EntityNotFound` for unknown entities.
    fn persisted_seq(&mut self, bucket: Bucket) -> UpdatesResult<Option<i64>>;

    /// Records `seq` as the last issued sequence number of the entity.
    fn persist_seq(&mut self, bucket: Bucket, seq: i64) -> UpdatesResult<()>;

    /// Whether a row with this seq is already in the log.
    fn row_exists(&self, bucket: Bucket, seq: i64) -> UpdatesResult<bool>;

    /// Highest seq in the bucket's log, 0 when empty.
    fn log_head(&self, bucket: Bucket) -> UpdatesResult<i64>;
}

/// Issues the next sequence number of `bucket` and advances the persisted counter.
pub fn allocate<G: SequenceGuard + ?Sized>(guard: &mut G, bucket: Bucket) -> UpdatesResult<i64> {
    guard.lock_entity(bucket)?;
    let seq = match guard.persisted_seq(bucket)? {
        Some(last) => {
            let next = last + 1;
            if guard.row_exists(bucket, next)? {
                warn!(
                    bucket = %bucket,
                    counter = last,
                    "Sequence counter is behind the update log, resynchronizing"
                );
                next_after_head(guard, bucket)?
            } else {
                next
            }
        }
        None => {
            let next = next_after_head(guard, bucket)?;
            debug!(bucket = %bucket, seq = next, "Initializing sequence counter from the log");
            next
        }
    };

    guard.persist_seq(bucket, seq)?;
    Ok(seq)
}

fn next_after_head<G: SequenceGuard + ?Sized>(guard: &G, bucket: Bucket) -> UpdatesResult<i64> {
    let next = guard.log_head(bucket)? + 1;
    if guard.row_exists(bucket, next)? {
        // Only a writer bypassing the entity lock can move the head under us
        return Err(UpdatesError::Conflict);
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    use chrono::Utc;

    use crate::storage::log::{encode_row, row_key};
    use crate::updates::tests::setup_engine;

    #[derive(Default)]
    struct MemoryGuard {
        counters: HashMap<Bucket, Option<i64>>,
        rows: BTreeSet<(Bucket, i64)>,
        locked: BTreeSet<Bucket>,
    }

    impl SequenceGuard for MemoryGuard {
        fn lock_entity(&mut self, bucket: Bucket) -> UpdatesResult<()> {
            self.locked.insert(bucket);
            Ok(())
        }

        fn persisted_seq(&mut self, bucket: Bucket) -> UpdatesResult<Option<i64>> {
            assert!(self.locked.contains(&bucket), "counter read without the entity lock");
            self.counters
                .get(&bucket)
                .copied()
                .ok_or(UpdatesError::EntityNotFound(bucket))
        }

        fn persist_seq(&mut self, bucket: Bucket, seq: i64) -> UpdatesResult<()> {
            self.counters.insert(bucket, Some(seq));
            self.rows.insert((bucket, seq));
            Ok(())
        }

        fn row_exists(&self, bucket: Bucket, seq: i64) -> UpdatesResult<bool> {
            Ok(self.rows.contains(&(bucket, seq)))
        }

        fn log_head(&self, bucket: Bucket) -> UpdatesResult<i64> {
            Ok(self
                .rows
                .iter()
                .filter(|(b, _)| *b == bucket)
                .map(|(_, seq)| *seq)
                .max()
                .unwrap_or(0))
        }
    }

    #[test]
    fn test_counter_path_never_scans() {
        let mut guard = MemoryGuard::default();
        guard.counters.insert(Bucket::User(1), Some(4));

        assert_eq!(allocate(&mut guard, Bucket::User(1)).unwrap(), 5);
        assert_eq!(allocate(&mut guard, Bucket::User(1)).unwrap(), 6);
        assert_eq!(guard.counters[&Bucket::User(1)], Some(6));
    }

    #[test]
    fn test_uninitialized_counter_continues_after_log_head() {
        let mut guard = MemoryGuard::default();
        guard.counters.insert(Bucket::Chat(1), None);
        guard.rows.extend((1..=3).map(|seq| (Bucket::Chat(1), seq)));

        assert_eq!(allocate(&mut guard, Bucket::Chat(1)).unwrap(), 4);
        assert_eq!(guard.counters[&Bucket::Chat(1)], Some(4));
        assert!(guard.locked.contains(&Bucket::Chat(1)));
    }

    #[test]
    fn test_unknown_entity() {
        let mut guard = MemoryGuard::default();
        let err = allocate(&mut guard, Bucket::Space(1)).unwrap_err();
        assert!(matches!(err, UpdatesError::EntityNotFound(Bucket::Space(1))));
        assert!(guard.rows.is_empty());
    }

    fn seed_rows(engine: &crate::updates::UpdateEngine, bucket: Bucket, upto: i64) {
        let updates = engine.backend.updates();
        for seq in 1..=upto {
            updates
                .insert(row_key(bucket, seq), encode_row(Utc::now(), b"seeded").unwrap())
                .unwrap();
        }
    }

    #[test]
    fn test_sequences_start_at_one_and_increase() {
        let engine = setup_engine();
        engine.create_entity(Bucket::User(10)).unwrap();
        engine.create_entity(Bucket::User(11)).unwrap();

        let seqs: Vec<i64> = (0..5)
            .map(|_| engine.enqueue(Bucket::User(10), b"u").unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        // Other entities are sequenced independently
        assert_eq!(engine.enqueue(Bucket::User(11), b"u").unwrap().seq, 1);
        assert_eq!(engine.entities().update_seq(Bucket::User(10)).unwrap(), Some(5));
    }

    #[test]
    fn test_lazy_init_from_log() {
        let engine = setup_engine();
        engine.create_entity(Bucket::User(1)).unwrap();
        seed_rows(&engine, Bucket::User(1), 9);

        assert_eq!(engine.entities().update_seq(Bucket::User(1)).unwrap(), None);
        let enqueued = engine.enqueue(Bucket::User(1), b"next").unwrap();

        assert_eq!(enqueued.seq, 10);
        assert_eq!(engine.entities().update_seq(Bucket::User(1)).unwrap(), Some(10));
    }

    #[test]
    fn test_stale_counter_recovery() {
        let engine = setup_engine();
        engine.create_entity(Bucket::Chat(3)).unwrap();
        seed_rows(&engine, Bucket::Chat(3), 7);
        engine
            .entities()
            .set_update_seq(Bucket::Chat(3), Some(2))
            .unwrap();

        let enqueued = engine.enqueue(Bucket::Chat(3), b"next").unwrap();

        assert_eq!(enqueued.seq, 8);
        assert_eq!(engine.entities().update_seq(Bucket::Chat(3)).unwrap(), Some(8));
        assert_eq!(engine.log().get(Bucket::Chat(3), 8).unwrap().unwrap().payload, b"next");
        assert_eq!(engine.log().get(Bucket::Chat(3), 3).unwrap().unwrap().payload, b"seeded");
    }

    #[test]
    fn test_counter_ahead_of_log_is_authoritative() {
        let engine = setup_engine();
        engine.create_entity(Bucket::Space(2)).unwrap();
        seed_rows(&engine, Bucket::Space(2), 3);
        engine
            .entities()
            .set_update_seq(Bucket::Space(2), Some(20))
            .unwrap();

        assert_eq!(engine.enqueue(Bucket::Space(2), b"x").unwrap().seq, 21);
    }

    #[test]
    fn test_missing_entity_writes_nothing() {
        let engine = setup_engine();

        let err = engine.enqueue(Bucket::User(404), b"x").unwrap_err();

        assert!(matches!(err, UpdatesError::EntityNotFound(Bucket::User(404))));
        assert_eq!(engine.log().latest_seq(Bucket::User(404)).unwrap(), 0);
        assert!(engine.entities().get(Bucket::User(404)).unwrap().is_none());
        assert_eq!(engine.locks().holder(Bucket::User(404)).unwrap(), None);
    }
}
