//! The update log.
//!
//! Rows live in the `updates` tree under `{kind:u8}{entity_id:i64 be}{seq:i64 be}`. A key is
//! written at most once; the storage key itself is the uniqueness constraint on
//! `(bucket, entity_id, seq)`. Rows are never rewritten. Only the retention pruner removes them,
//! and it records the highest removed seq of the bucket as the bucket's floor in `meta`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::entity::BUCKET_KEY_LEN;
use crate::storage::{Backend, Bucket, StorageError, StorageResult};

/// Length of an update row key: bucket key + big-endian seq.
pub const ROW_KEY_LEN: usize = BUCKET_KEY_LEN + 8;

const FLOOR_PREFIX: &[u8] = b"floor/";

/// One committed update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRow {
    pub bucket: Bucket,
    pub seq: i64,
    /// Encoded update variant, opaque to the engine
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// On-disk value of a row; the bucket and seq live in the key.
#[derive(Serialize, Deserialize)]
struct StoredRow {
    created_at_ms: i64,
    payload: Vec<u8>,
}

/// Builds the storage key of `(bucket, seq)`.
pub fn row_key(bucket: Bucket, seq: i64) -> [u8; ROW_KEY_LEN] {
    let mut key = [0u8; ROW_KEY_LEN];
    key[..BUCKET_KEY_LEN].copy_from_slice(&bucket.key());
    key[BUCKET_KEY_LEN..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Splits a row key into its bucket and seq.
pub fn decode_row_key(key: &[u8]) -> StorageResult<(Bucket, i64)> {
    if key.len() != ROW_KEY_LEN {
        return Err(StorageError::Codec(format!(
            "update row key has {} bytes, expected {}",
            key.len(),
            ROW_KEY_LEN
        )));
    }
    let bucket = Bucket::from_key(key)?;
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&key[BUCKET_KEY_LEN..]);
    Ok((bucket, i64::from_be_bytes(seq)))
}

pub(crate) fn encode_row(created_at: DateTime<Utc>, payload: &[u8]) -> StorageResult<Vec<u8>> {
    let stored = StoredRow {
        created_at_ms: created_at.timestamp_millis(),
        payload: payload.to_vec(),
    };
    Ok(bincode::serialize(&stored)?)
}

fn decode_row(key: &[u8], value: &[u8]) -> StorageResult<UpdateRow> {
    let (bucket, seq) = decode_row_key(key)?;
    let stored: StoredRow = bincode::deserialize(value)?;
    let created_at = DateTime::from_timestamp_millis(stored.created_at_ms).ok_or_else(|| {
        StorageError::Codec(format!("row {}#{} has an invalid timestamp", bucket, seq))
    })?;
    Ok(UpdateRow {
        bucket,
        seq,
        payload: stored.payload,
        created_at,
    })
}

fn floor_key(bucket: Bucket) -> Vec<u8> {
    let mut key = Vec::with_capacity(FLOOR_PREFIX.len() + BUCKET_KEY_LEN);
    key.extend_from_slice(FLOOR_PREFIX);
    key.extend_from_slice(&bucket.key());
    key
}

/// Read access to committed log rows, plus pruning for the retention worker.
///
/// Reads never take the per-entity lock; they see committed rows only.
#[derive(Clone)]
pub struct UpdateLog {
    rows: sled::Tree,
    meta: sled::Tree,
}

impl UpdateLog {
    pub fn new(backend: &Backend) -> Self {
        Self {
            rows: backend.updates().clone(),
            meta: backend.meta().clone(),
        }
    }

    /// Highest committed seq of the bucket, 0 when the bucket has no rows.
    pub fn latest_seq(&self, bucket: Bucket) -> StorageResult<i64> {
        match self.rows.scan_prefix(bucket.key()).next_back() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_row_key(&key)?.1)
            }
            None => Ok(0),
        }
    }

    /// The newest row of the bucket.
    pub fn latest(&self, bucket: Bucket) -> StorageResult<Option<UpdateRow>> {
        self.rows
            .scan_prefix(bucket.key())
            .next_back()
            .map(|item| {
                let (key, value) = item?;
                decode_row(&key, &value)
            })
            .transpose()
    }

    /// Lowest seq still stored for the bucket.
    pub fn first_seq(&self, bucket: Bucket) -> StorageResult<Option<i64>> {
        self.rows
            .scan_prefix(bucket.key())
            .next()
            .map(|item| {
                let (key, _) = item?;
                Ok(decode_row_key(&key)?.1)
            })
            .transpose()
    }

    pub fn get(&self, bucket: Bucket, seq: i64) -> StorageResult<Option<UpdateRow>> {
        let key = row_key(bucket, seq);
        self.rows
            .get(key)?
            .map(|value| decode_row(&key, &value))
            .transpose()
    }

    /// Rows with `after < seq <= upto` in ascending order, at most `limit` of them.
    /// A limit of 0 means no limit.
    pub fn scan(
        &self,
        bucket: Bucket,
        after: i64,
        upto: i64,
        limit: usize,
    ) -> StorageResult<Vec<UpdateRow>> {
        let mut rows = Vec::new();
        let Some(range) = self.range_bounds(bucket, after, upto) else {
            return Ok(rows);
        };

        for item in self.rows.range(range) {
            let (key, value) = item?;
            rows.push(decode_row(&key, &value)?);

            if limit > 0 && rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }

    /// Number of rows with `after < seq <= upto`, counting no further than `cap`.
    pub fn count_between(
        &self,
        bucket: Bucket,
        after: i64,
        upto: i64,
        cap: usize,
    ) -> StorageResult<usize> {
        let Some(range) = self.range_bounds(bucket, after, upto) else {
            return Ok(0);
        };

        let mut count = 0;
        for item in self.rows.range(range) {
            item?;
            count += 1;
            if count >= cap {
                break;
            }
        }
        Ok(count)
    }

    fn range_bounds(
        &self,
        bucket: Bucket,
        after: i64,
        upto: i64,
    ) -> Option<std::ops::RangeInclusive<[u8; ROW_KEY_LEN]>> {
        // Sequences start at 1; negative seqs would sort after positive ones big-endian.
        let from = after.max(0).checked_add(1)?;
        if upto < from {
            return None;
        }
        Some(row_key(bucket, from)..=row_key(bucket, upto))
    }

    /// Highest seq removed by retention, 0 when nothing was ever pruned.
    pub fn pruned_floor(&self, bucket: Bucket) -> StorageResult<i64> {
        match self.meta.get(floor_key(bucket))? {
            Some(value) => {
                let bytes: [u8; 8] = value[..].try_into().map_err(|_| {
                    StorageError::Codec(format!("retention floor of {} is malformed", bucket))
                })?;
                Ok(i64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Removes rows with `seq <= through` and raises the bucket's floor.
    ///
    /// The floor is persisted before any row is removed, so a reader that observes a missing
    /// row below the floor always also observes the floor.
    pub fn prune_through(&self, bucket: Bucket, through: i64) -> StorageResult<usize> {
        let floor = self.pruned_floor(bucket)?;
        if through <= floor {
            return Ok(0);
        }

        self.meta
            .insert(floor_key(bucket), through.to_be_bytes().to_vec())?;
        self.meta.flush()?;

        let mut batch = sled::Batch::default();
        let mut count = 0;
        if let Some(range) = self.range_bounds(bucket, 0, through) {
            for item in self.rows.range(range) {
                let (key, _) = item?;
                batch.remove(key);
                count += 1;
            }
        }
        self.rows.apply_batch(batch)?;

        debug!(bucket = %bucket, through, removed = count, "Pruned update log");
        Ok(count)
    }
}
