//! Buckets and the sequence store.
//!
//! Every user, chat and space that can receive updates has an entity record in the `entities`
//! tree. The record carries `update_seq`, the last sequence number issued for the entity's
//! bucket. `None` means the counter was never initialized and must be derived from the update
//! log on the next allocation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Backend, StorageError, StorageResult};

/// Length of an encoded bucket key: kind tag + big-endian entity id.
pub const BUCKET_KEY_LEN: usize = 9;

/// The kind of entity a bucket belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BucketKind {
    User,
    Chat,
    Space,
}

impl BucketKind {
    /// Single-byte tag used as the first byte of every storage key.
    pub fn tag(self) -> u8 {
        match self {
            BucketKind::User => 1,
            BucketKind::Chat => 2,
            BucketKind::Space => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(BucketKind::User),
            2 => Some(BucketKind::Chat),
            3 => Some(BucketKind::Space),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BucketKind::User => "user",
            BucketKind::Chat => "chat",
            BucketKind::Space => "space",
        }
    }
}

/// The unit of sequencing: one entity's update stream.
///
/// Updates are totally ordered within a bucket and never ordered across buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Bucket {
    User(i64),
    Chat(i64),
    Space(i64),
}

impl Bucket {
    pub fn new(kind: BucketKind, entity_id: i64) -> Self {
        match kind {
            BucketKind::User => Bucket::User(entity_id),
            BucketKind::Chat => Bucket::Chat(entity_id),
            BucketKind::Space => Bucket::Space(entity_id),
        }
    }

    pub fn kind(&self) -> BucketKind {
        match self {
            Bucket::User(_) => BucketKind::User,
            Bucket::Chat(_) => BucketKind::Chat,
            Bucket::Space(_) => BucketKind::Space,
        }
    }

    pub fn entity_id(&self) -> i64 {
        match *self {
            Bucket::User(id) | Bucket::Chat(id) | Bucket::Space(id) => id,
        }
    }

    /// Encodes the bucket as `{kind:u8}{entity_id:i64 be}`.
    pub fn key(&self) -> [u8; BUCKET_KEY_LEN] {
        let mut key = [0u8; BUCKET_KEY_LEN];
        key[0] = self.kind().tag();
        key[1..].copy_from_slice(&self.entity_id().to_be_bytes());
        key
    }

    /// Decodes a bucket from the first `BUCKET_KEY_LEN` bytes of a key.
    pub fn from_key(key: &[u8]) -> StorageResult<Self> {
        if key.len() < BUCKET_KEY_LEN {
            return Err(StorageError::Codec(format!(
                "bucket key too short: {} bytes",
                key.len()
            )));
        }
        let kind = BucketKind::from_tag(key[0])
            .ok_or_else(|| StorageError::Codec(format!("unknown bucket tag {}", key[0])))?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&key[1..BUCKET_KEY_LEN]);
        Ok(Bucket::new(kind, i64::from_be_bytes(id)))
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.entity_id())
    }
}

/// Persisted state of one entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Creation time in unix milliseconds
    pub created_at_ms: i64,

    /// Last issued sequence number, `None` until the first allocation
    pub update_seq: Option<i64>,
}

impl EntityRecord {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at_ms: created_at.timestamp_millis(),
            update_seq: None,
        }
    }

    pub(crate) fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn decode(data: &[u8]) -> StorageResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Non-transactional access to entity records.
///
/// Allocation never goes through this type; it reads and writes the counter inside a unit of
/// work. This is the registration and administration surface.
#[derive(Clone)]
pub struct EntityStore {
    tree: sled::Tree,
}

impl EntityStore {
    pub fn new(backend: &Backend) -> Self {
        Self {
            tree: backend.entities().clone(),
        }
    }

    /// Registers an entity with an uninitialized counter.
    pub fn create(&self, bucket: Bucket) -> StorageResult<EntityRecord> {
        let record = EntityRecord::new(Utc::now());
        let swapped = self.tree.compare_and_swap(
            bucket.key(),
            None as Option<&[u8]>,
            Some(record.encode()?),
        )?;
        if swapped.is_err() {
            return Err(StorageError::EntityExists(bucket));
        }
        debug!(bucket = %bucket, "Registered entity");
        Ok(record)
    }

    pub fn get(&self, bucket: Bucket) -> StorageResult<Option<EntityRecord>> {
        self.tree
            .get(bucket.key())?
            .map(|data| EntityRecord::decode(&data))
            .transpose()
    }

    pub fn exists(&self, bucket: Bucket) -> StorageResult<bool> {
        Ok(self.tree.contains_key(bucket.key())?)
    }

    /// Returns the persisted counter of an existing entity.
    pub fn update_seq(&self, bucket: Bucket) -> StorageResult<Option<i64>> {
        self.get(bucket)?
            .map(|record| record.update_seq)
            .ok_or(StorageError::EntityNotFound(bucket))
    }

    /// Administrative override of the persisted counter. `None` forces the next allocation to
    /// re-derive the counter from the update log.
    pub fn set_update_seq(&self, bucket: Bucket, update_seq: Option<i64>) -> StorageResult<()> {
        let key = bucket.key();
        loop {
            let current = self
                .tree
                .get(key)?
                .ok_or(StorageError::EntityNotFound(bucket))?;
            let mut record = EntityRecord::decode(&current)?;
            record.update_seq = update_seq;
            let swapped =
                self.tree
                    .compare_and_swap(key, Some(current), Some(record.encode()?))?;
            if swapped.is_ok() {
                info!(bucket = %bucket, update_seq = ?update_seq, "Sequence counter overridden");
                return Ok(());
            }
        }
    }

    /// Iterates over every registered entity in key order.
    pub fn list(&self) -> impl Iterator<Item = StorageResult<(Bucket, EntityRecord)>> + '_ {
        self.tree.iter().map(|item| {
            let (key, value) = item?;
            Ok((Bucket::from_key(&key)?, EntityRecord::decode(&value)?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_store() -> (std::sync::Arc<Backend>, EntityStore) {
        let backend = Backend::temporary().unwrap();
        let store = EntityStore::new(&backend);
        (backend, store)
    }

    #[test]
    fn test_bucket_key_roundtrip_and_order() {
        let a = Bucket::User(7);
        assert_eq!(Bucket::from_key(&a.key()).unwrap(), a);

        // Keys of the same kind sort by entity id
        assert!(Bucket::Chat(2).key() < Bucket::Chat(10).key());
        assert!(Bucket::User(u32::MAX as i64).key() < Bucket::Chat(1).key());
    }

    #[test]
    fn test_bucket_from_bad_key() {
        assert!(Bucket::from_key(&[1, 2, 3]).is_err());
        let mut key = Bucket::Space(1).key();
        key[0] = 9;
        assert!(Bucket::from_key(&key).is_err());
    }

    #[test]
    fn test_bucket_display() {
        assert_eq!(Bucket::Space(12).to_string(), "space:12");
        assert_eq!(Bucket::new(BucketKind::Chat, 3), Bucket::Chat(3));
    }

    #[test]
    fn test_create_and_get() {
        let (_backend, store) = setup_store();

        let record = store.create(Bucket::User(1)).unwrap();
        assert_eq!(record.update_seq, None);
        assert!(store.exists(Bucket::User(1)).unwrap());
        assert!(!store.exists(Bucket::Chat(1)).unwrap());
        assert_eq!(store.get(Bucket::User(1)).unwrap(), Some(record));
    }

    #[test]
    fn test_create_twice_fails() {
        let (_backend, store) = setup_store();

        store.create(Bucket::Chat(5)).unwrap();
        let err = store.create(Bucket::Chat(5)).unwrap_err();
        assert!(matches!(err, StorageError::EntityExists(Bucket::Chat(5))));
    }

    #[test]
    fn test_set_update_seq() {
        let (_backend, store) = setup_store();

        store.create(Bucket::Space(2)).unwrap();
        store.set_update_seq(Bucket::Space(2), Some(41)).unwrap();
        assert_eq!(store.update_seq(Bucket::Space(2)).unwrap(), Some(41));

        store.set_update_seq(Bucket::Space(2), None).unwrap();
        assert_eq!(store.update_seq(Bucket::Space(2)).unwrap(), None);

        let err = store.set_update_seq(Bucket::Space(3), Some(1)).unwrap_err();
        assert!(matches!(err, StorageError::EntityNotFound(_)));
    }

    #[test]
    fn test_list() {
        let (_backend, store) = setup_store();

        store.create(Bucket::Chat(2)).unwrap();
        store.create(Bucket::User(9)).unwrap();

        let buckets: Vec<Bucket> = store.list().map(|r| r.unwrap().0).collect();
        assert_eq!(buckets, vec![Bucket::User(9), Bucket::Chat(2)]);
    }
}
