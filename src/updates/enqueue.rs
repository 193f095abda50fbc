//! Enqueuing updates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::storage::Bucket;
use crate::updates::allocator::allocate;
use crate::updates::{UnitOfWork, UpdatesResult};

/// One update destined for a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateWrite {
    pub bucket: Bucket,
    /// Encoded update variant
    pub payload: Vec<u8>,
}

impl UpdateWrite {
    pub fn new(bucket: Bucket, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket,
            payload: payload.into(),
        }
    }
}

/// Position assigned to an enqueued update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Enqueued {
    pub bucket: Bucket,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

impl UnitOfWork<'_> {
    /// Allocates the next seq of `bucket` and appends the update at it.
    pub fn enqueue(&mut self, bucket: Bucket, payload: &[u8]) -> UpdatesResult<Enqueued> {
        let seq = allocate(self, bucket)?;
        let row = self.append_row(bucket, seq, payload)?;
        Ok(Enqueued {
            bucket,
            seq,
            created_at: row.created_at,
        })
    }

    /// Enqueues a batch. Entities are visited in key order; entries of the same entity keep
    /// their relative order, and results are returned in the order of `writes`.
    pub fn enqueue_many(&mut self, writes: &[UpdateWrite]) -> UpdatesResult<Vec<Enqueued>> {
        let mut by_bucket: BTreeMap<Bucket, Vec<usize>> = BTreeMap::new();
        for (index, write) in writes.iter().enumerate() {
            by_bucket.entry(write.bucket).or_default().push(index);
        }

        let mut results: Vec<Option<Enqueued>> = vec![None; writes.len()];
        for (bucket, indices) in by_bucket {
            for index in indices {
                results[index] = Some(self.enqueue(bucket, &writes[index].payload)?);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    use chrono::Utc;

    use crate::storage::log::{encode_row, row_key};
    use crate::updates::tests::setup_engine;
    use crate::updates::UpdatesError;

    #[test]
    fn test_batch_preserves_input_order() {
        let engine = setup_engine();
        engine.create_entity(Bucket::Chat(9)).unwrap();
        engine.create_entity(Bucket::User(1)).unwrap();
        engine.enqueue(Bucket::Chat(9), b"earlier").unwrap();

        let results = engine
            .enqueue_many(&[
                UpdateWrite::new(Bucket::Chat(9), "first"),
                UpdateWrite::new(Bucket::User(1), "second"),
                UpdateWrite::new(Bucket::Chat(9), "third"),
            ])
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].bucket, Bucket::Chat(9));
        assert_eq!(results[1].bucket, Bucket::User(1));
        assert_eq!(results[2].bucket, Bucket::Chat(9));
        assert_eq!((results[0].seq, results[1].seq, results[2].seq), (2, 1, 3));

        let rows = engine.log().scan(Bucket::Chat(9), 1, 3, 0).unwrap();
        assert_eq!(rows[0].payload, b"first");
        assert_eq!(rows[1].payload, b"third");
    }

    #[test]
    fn test_batch_failure_is_atomic() {
        let engine = setup_engine();
        engine.create_entity(Bucket::Chat(1)).unwrap();

        let err = engine
            .enqueue_many(&[
                UpdateWrite::new(Bucket::Chat(1), "ok"),
                UpdateWrite::new(Bucket::Chat(2), "missing entity"),
            ])
            .unwrap_err();

        assert!(matches!(err, UpdatesError::EntityNotFound(Bucket::Chat(2))));
        assert_eq!(engine.log().latest_seq(Bucket::Chat(1)).unwrap(), 0);
        assert_eq!(engine.entities().update_seq(Bucket::Chat(1)).unwrap(), None);
    }

    #[test]
    fn test_empty_batch() {
        let engine = setup_engine();
        assert!(engine.enqueue_many(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writers_get_unique_contiguous_seqs() {
        let engine = setup_engine();
        let bucket = Bucket::Chat(77);
        engine.create_entity(bucket).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let engine = engine.clone();
                thread::spawn(move || {
                    (0..5)
                        .map(|i| {
                            engine
                                .enqueue(bucket, format!("{}-{}", t, i).as_bytes())
                                .unwrap()
                                .seq
                        })
                        .collect::<Vec<i64>>()
                })
            })
            .collect();

        let mut all = BTreeSet::new();
        for handle in handles {
            let seqs = handle.join().unwrap();
            // Each writer observes its own updates in increasing order
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }

        assert_eq!(all, (1..=40).collect::<BTreeSet<i64>>());
        assert_eq!(engine.entities().update_seq(bucket).unwrap(), Some(40));
        assert_eq!(engine.log().latest_seq(bucket).unwrap(), 40);
    }

    #[test]
    fn test_different_entities_do_not_share_sequences() {
        let engine = setup_engine();
        for id in 1..=3 {
            engine.create_entity(Bucket::Space(id)).unwrap();
        }

        let writes: Vec<UpdateWrite> = (1..=3)
            .flat_map(|id| (0..2).map(move |_| UpdateWrite::new(Bucket::Space(id), "x")))
            .collect();
        let results = engine.enqueue_many(&writes).unwrap();

        let seqs: Vec<i64> = results.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn test_batch_over_many_fresh_entities() {
        let engine = setup_engine();
        for id in 1..=40 {
            engine.create_entity(Bucket::Chat(id)).unwrap();
        }
        // A few of them already have rows but no counter
        for id in 1..=5 {
            for seq in 1..=3 {
                let row = encode_row(Utc::now(), b"old").unwrap();
                engine
                    .backend
                    .updates()
                    .insert(row_key(Bucket::Chat(id), seq), row)
                    .unwrap();
            }
        }

        let writes: Vec<UpdateWrite> = (1..=40)
            .map(|id| UpdateWrite::new(Bucket::Chat(id), "hello"))
            .collect();
        let results = engine.enqueue_many(&writes).unwrap();

        for (id, result) in (1..=40).zip(&results) {
            let expected = if id <= 5 { 4 } else { 1 };
            assert_eq!(result.bucket, Bucket::Chat(id));
            assert_eq!(result.seq, expected);
            assert_eq!(
                engine.entities().update_seq(Bucket::Chat(id)).unwrap(),
                Some(expected)
            );
        }
        assert!(engine.backend.locks().is_empty());
    }

    #[test]
    fn test_concurrent_writers_of_different_entities() {
        let engine = setup_engine();
        for id in 0..8 {
            engine.create_entity(Bucket::User(id)).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|id| {
                let engine = engine.clone();
                thread::spawn(move || {
                    (0..10)
                        .map(|_| engine.enqueue(Bucket::User(id), b"x").unwrap().seq)
                        .collect::<Vec<i64>>()
                })
            })
            .collect();

        for (id, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), (1..=10).collect::<Vec<i64>>());
            let bucket = Bucket::User(id as i64);
            assert_eq!(engine.log().latest_seq(bucket).unwrap(), 10);
        }
    }
}
