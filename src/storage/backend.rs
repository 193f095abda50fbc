//! Sled-backed persistent storage backend.
//!
//! The backend owns the sled database and the logical trees the update engine works on:
//! - `entities`: one record per user, chat or space, holding the bucket's sequence counter
//! - `updates`: the append-only update log, keyed by `(kind, entity_id, seq)`
//! - `app`: business records that callers write in the same unit of work as their updates
//! - `meta`: engine bookkeeping (retention floors)
//! - `locks`: per-entity write locks
//!
//! A unit of work commits with one short sled transaction over `entities`, `updates` and `app`.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Maximum page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages to disk. 0 disables periodic flushing.
    pub flush_interval_ms: u64,

    /// Keep the database in a throwaway location that is removed on drop.
    /// `data_dir` is ignored when set.
    pub temporary: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            temporary: false,
        }
    }
}

/// The persistent storage backend using sled.
pub struct Backend {
    db: sled::Db,

    /// Entity records carrying the per-bucket sequence counter
    entities: sled::Tree,

    /// Update log rows. Key format: `{kind:u8}{entity_id:i64 be}{seq:i64 be}`
    updates: sled::Tree,

    /// Caller-owned business records
    app: sled::Tree,

    /// Engine metadata
    meta: sled::Tree,

    /// Entity write locks, keyed like `entities`
    locks: sled::Tree,
}

impl Backend {
    /// Opens (or creates) the database described by `config`.
    pub fn new(config: BackendConfig) -> BackendResult<Arc<Self>> {
        debug!("Initializing storage backend at {:?}", config.data_dir);

        if !config.temporary {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        let flush_every = (config.flush_interval_ms > 0).then_some(config.flush_interval_ms);
        let mut sled_config = sled::Config::new().temporary(config.temporary);
        if !config.temporary {
            sled_config = sled_config.path(&config.data_dir);
        }
        let db = sled_config
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(flush_every)
            .open()
            .map_err(|e| {
                BackendError::ConfigError(format!("Failed to open sled database: {}", e))
            })?;

        let entities = db.open_tree("entities")?;
        let updates = db.open_tree("updates")?;
        let app = db.open_tree("app")?;
        let meta = db.open_tree("meta")?;
        let locks = db.open_tree("locks")?;

        // Holders of these locks died with the process that last opened the database
        let stale = locks.len();
        if stale > 0 {
            locks.clear()?;
            info!(stale, "Cleared entity locks left by a previous process");
        }

        info!(
            "Storage backend initialized with cache_size={}MB, flush_interval={}ms",
            config.cache_size_mb, config.flush_interval_ms
        );

        Ok(Arc::new(Self {
            db,
            entities,
            updates,
            app,
            meta,
            locks,
        }))
    }

    /// Opens a throwaway database, removed when the backend is dropped.
    pub fn temporary() -> BackendResult<Arc<Self>> {
        Self::new(BackendConfig {
            data_dir: PathBuf::new(),
            cache_size_mb: 16,
            flush_interval_ms: 0,
            temporary: true,
        })
    }

    pub fn entities(&self) -> &sled::Tree {
        &self.entities
    }

    pub fn updates(&self) -> &sled::Tree {
        &self.updates
    }

    pub fn app(&self) -> &sled::Tree {
        &self.app
    }

    pub fn meta(&self) -> &sled::Tree {
        &self.meta
    }

    pub fn locks(&self) -> &sled::Tree {
        &self.locks
    }

    /// A database-wide unique id.
    pub fn generate_id(&self) -> BackendResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Returns the approximate total size of the database in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
