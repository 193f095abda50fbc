//! Background retention worker for the update log.
//!
//! Retention removes the oldest rows of every bucket so that at most `retain` rows remain. The
//! newest row of a bucket is never removed, so the log head and the persisted counter stay in
//! agreement. Clients whose catch-up position falls below a bucket's pruned floor get `TooLong`
//! and resynchronize from a snapshot.
//!
//! Retention modes:
//! - Periodic: prune every N seconds
//! - Once: a single pass (tests, maintenance)

use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::storage::{Bucket, EntityStore, StorageResult, UpdateLog};

/// Retention strategy.
#[derive(Clone, Debug)]
pub enum RetentionMode {
    /// Prune at a fixed interval
    Periodic(Duration),

    /// Prune once and exit
    Once,
}

/// Outcome of one pruning pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Buckets that had rows removed
    pub buckets: usize,
    /// Rows removed across all buckets
    pub rows: usize,
}

/// Background pruner that bounds the length of every bucket's log.
pub struct Pruner {
    log: UpdateLog,
    entities: EntityStore,
    mode: RetentionMode,

    /// Rows kept per bucket, at least 1
    retain: i64,
}

impl Pruner {
    pub fn new(log: UpdateLog, entities: EntityStore, mode: RetentionMode, retain: u64) -> Self {
        Self {
            log,
            entities,
            mode,
            retain: i64::try_from(retain).unwrap_or(i64::MAX).max(1),
        }
    }

    /// Spawns a background tokio task that performs pruning.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode.clone() {
                RetentionMode::Periodic(interval_duration) => {
                    self.run_periodic(interval_duration).await;
                }
                RetentionMode::Once => self.run_and_log(),
            }
        })
    }

    async fn run_periodic(&self, interval_duration: Duration) {
        let mut ticker = interval(interval_duration);

        info!(
            retain = self.retain,
            "Starting periodic retention with interval: {:?}", interval_duration
        );

        loop {
            ticker.tick().await;
            self.run_and_log();
        }
    }

    fn run_and_log(&self) {
        match self.prune_once() {
            Ok(stats) if stats.rows > 0 => {
                info!(
                    buckets = stats.buckets,
                    rows = stats.rows,
                    "Retention pass completed"
                );
            }
            Ok(_) => debug!("Retention pass found nothing to prune"),
            Err(e) => warn!("Retention pass failed: {}", e),
        }
    }

    /// Prunes every registered bucket once.
    pub fn prune_once(&self) -> StorageResult<PruneStats> {
        let mut stats = PruneStats::default();
        for entry in self.entities.list() {
            let (bucket, _) = entry?;
            let removed = self.prune_bucket(bucket)?;
            if removed > 0 {
                stats.buckets += 1;
                stats.rows += removed;
            }
        }
        Ok(stats)
    }

    /// Prunes one bucket down to the newest `retain` rows.
    pub fn prune_bucket(&self, bucket: Bucket) -> StorageResult<usize> {
        let latest = self.log.latest_seq(bucket)?;
        let through = latest - self.retain;
        if through <= 0 {
            return Ok(0);
        }
        self.log.prune_through(bucket, through)
    }
}
