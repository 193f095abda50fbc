//! Realtime hub for pushing committed updates to connected clients.
//!
//! Clients that stay connected do not need to poll `get_updates`: they subscribe to a bucket and
//! the engine publishes every committed row to the bucket's subscribers right after commit.
//!
//! - DashMap for concurrent subscription registration
//! - Bounded tokio channels per subscriber, one message per commit
//! - A subscriber that falls behind is dropped, never fed a partial stream; it resumes through
//!   the catch-up reader
//!
//! The engine publishes a bucket's commits in seq order, before the writer releases the entity
//! lock. A live stream still overlaps or trails the replay it started from; [`fill_gaps`] drops
//! rows already delivered and reads missing ones back from the log.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::storage::{Bucket, StorageResult, UpdateLog, UpdateRow};

/// Subscription errors.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(i64),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// One live subscriber of a bucket.
pub struct Subscription {
    pub id: i64,
    pub bucket: Bucket,
    /// Rows at or below this seq are not delivered
    pub after_seq: i64,
    tx: mpsc::Sender<Vec<UpdateRow>>,
    canceled: AtomicBool,
}

/// Fans committed rows out to subscribers.
pub struct RealtimeHub {
    /// Map of subscription id -> subscription
    subscriptions: DashMap<i64, Arc<Subscription>>,

    /// Map of bucket -> ids of its subscribers
    bucket_subscribers: DashMap<Bucket, Vec<i64>>,

    next_id: AtomicI64,

    /// Channel capacity per subscriber, in commits
    buffer: usize,
}

impl RealtimeHub {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(RealtimeHub {
            subscriptions: DashMap::new(),
            bucket_subscribers: DashMap::new(),
            next_id: AtomicI64::new(1),
            buffer: buffer.max(1),
        })
    }

    /// Subscribes to rows of `bucket` with `seq > after_seq`.
    ///
    /// The receiver yields one batch per commit and ends when the subscription is canceled,
    /// including when the hub drops it for falling behind.
    pub fn subscribe(
        &self,
        bucket: Bucket,
        after_seq: i64,
    ) -> RealtimeResult<(i64, mpsc::Receiver<Vec<UpdateRow>>)> {
        if after_seq < 0 {
            return Err(RealtimeError::InvalidSubscription(format!(
                "after_seq must not be negative, got {}",
                after_seq
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer);

        self.subscriptions.insert(
            id,
            Arc::new(Subscription {
                id,
                bucket,
                after_seq,
                tx,
                canceled: AtomicBool::new(false),
            }),
        );
        self.bucket_subscribers.entry(bucket).or_default().push(id);

        debug!(subscription = id, bucket = %bucket, after_seq, "Subscription created");
        Ok((id, rx))
    }

    /// Cancels a subscription; its receiver ends once drained.
    pub fn cancel(&self, id: i64) -> RealtimeResult<()> {
        let (_, subscription) = self
            .subscriptions
            .remove(&id)
            .ok_or(RealtimeError::SubscriptionNotFound(id))?;
        subscription.canceled.store(true, Ordering::SeqCst);

        if let Some(mut entry) = self.bucket_subscribers.get_mut(&subscription.bucket) {
            entry.retain(|sub| *sub != id);
            if entry.is_empty() {
                drop(entry);
                self.bucket_subscribers
                    .remove_if(&subscription.bucket, |_, ids| ids.is_empty());
            }
        }

        debug!(subscription = id, bucket = %subscription.bucket, "Subscription canceled");
        Ok(())
    }

    /// Delivers the rows of one commit to the subscribers of their buckets.
    pub fn publish(&self, rows: &[UpdateRow]) {
        if rows.is_empty() || self.subscriptions.is_empty() {
            return;
        }

        let mut by_bucket: BTreeMap<Bucket, Vec<&UpdateRow>> = BTreeMap::new();
        for row in rows {
            by_bucket.entry(row.bucket).or_default().push(row);
        }

        let mut dropped = Vec::new();
        for (bucket, bucket_rows) in by_bucket {
            let ids = match self.bucket_subscribers.get(&bucket) {
                Some(ids) => ids.value().clone(),
                None => continue,
            };

            for id in ids {
                let Some(subscription) = self.subscriptions.get(&id).map(|s| s.value().clone())
                else {
                    continue;
                };
                if subscription.canceled.load(Ordering::SeqCst) {
                    continue;
                }

                let batch: Vec<UpdateRow> = bucket_rows
                    .iter()
                    .filter(|row| row.seq > subscription.after_seq)
                    .map(|row| (*row).clone())
                    .collect();
                if batch.is_empty() {
                    continue;
                }

                match subscription.tx.try_send(batch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            subscription = id,
                            bucket = %bucket,
                            "Subscriber fell behind, dropping subscription"
                        );
                        dropped.push(id);
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(id),
                }
            }
        }

        for id in dropped {
            self.cancel(id).ok();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of buckets with at least one subscriber.
    pub fn bucket_count(&self) -> usize {
        self.bucket_subscribers.len()
    }
}

/// Puts live rows of one bucket into log order for a subscriber that has applied everything up
/// to `delivered`.
///
/// Rows already delivered are skipped. When a row arrives ahead of the next expected seq, the
/// missing rows are read back from the log; they are committed, since a seq is only published
/// after every lower seq of its bucket committed.
pub fn fill_gaps(
    log: &UpdateLog,
    bucket: Bucket,
    delivered: &mut i64,
    rows: Vec<UpdateRow>,
) -> StorageResult<Vec<UpdateRow>> {
    let mut ordered = Vec::with_capacity(rows.len());
    for row in rows {
        if row.seq <= *delivered {
            continue;
        }
        if row.seq > *delivered + 1 {
            for missing in log.scan(bucket, *delivered, row.seq - 1, 0)? {
                *delivered = missing.seq;
                ordered.push(missing);
            }
        }
        *delivered = row.seq;
        ordered.push(row);
    }
    Ok(ordered)
}
