//! Catch-up reads.
//!
//! A client that was offline asks for everything after the last seq it has seen. The reader
//! answers with one bounded page plus the bucket's latest seq, or with `TooLong` when the gap is
//! too large (or reaches into pruned rows) and the client has to resynchronize from a snapshot.
//! Reads only see committed rows and never wait for writers.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::storage::{Bucket, UpdateLog, UpdateRow};
use crate::updates::{EngineConfig, UpdatesError, UpdatesResult};

/// Outcome kind of a catch-up request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultType {
    /// A regular page of updates.
    Slice,
    /// The span is too large to serve incrementally.
    TooLong,
}

/// A catch-up request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetUpdates {
    pub bucket: Bucket,
    /// Exclusive lower bound: the last seq the client has seen
    pub seq_start: i64,
    /// Inclusive upper bound, `None` (or `Some(0)`) for the bucket's end
    pub seq_end: Option<i64>,
    /// Page size, 0 for the configured default
    pub limit: usize,
}

impl GetUpdates {
    pub fn new(bucket: Bucket, seq_start: i64) -> Self {
        Self {
            bucket,
            seq_start,
            seq_end: None,
            limit: 0,
        }
    }

    pub fn with_seq_end(mut self, seq_end: i64) -> Self {
        self.seq_end = Some(seq_end);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A catch-up response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatesSlice {
    pub updates: Vec<UpdateRow>,
    /// Latest committed seq of the bucket when the request was served
    pub latest_seq: i64,
    /// The client is caught up with `latest_seq` after applying `updates`
    pub is_final: bool,
    pub result_type: ResultType,
}

impl UpdatesSlice {
    fn too_long(latest_seq: i64) -> Self {
        Self {
            updates: Vec::new(),
            latest_seq,
            is_final: false,
            result_type: ResultType::TooLong,
        }
    }
}

/// Latest committed position of a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketState {
    pub latest_seq: i64,
    pub latest_date: Option<DateTime<Utc>>,
}

/// Serves catch-up requests from the update log.
#[derive(Clone)]
pub struct CatchUpReader {
    log: UpdateLog,
    max_total_updates: usize,
    default_page_size: usize,
    max_page_size: usize,
}

impl CatchUpReader {
    pub fn new(log: UpdateLog, config: &EngineConfig) -> Self {
        Self {
            log,
            max_total_updates: config.max_total_updates,
            default_page_size: config.default_page_size.max(1),
            max_page_size: config.max_page_size.max(1),
        }
    }

    pub fn get_updates(&self, request: &GetUpdates) -> UpdatesResult<UpdatesSlice> {
        let bucket = request.bucket;
        if request.seq_start < 0 {
            return Err(UpdatesError::InvalidArgument(format!(
                "seq_start must not be negative, got {}",
                request.seq_start
            )));
        }
        let seq_end = match request.seq_end {
            Some(end) if end < 0 => {
                return Err(UpdatesError::InvalidArgument(format!(
                    "seq_end must not be negative, got {}",
                    end
                )))
            }
            Some(0) | None => None,
            Some(end) => Some(end),
        };

        let latest_seq = self.log.latest_seq(bucket)?;
        let upper = seq_end.map_or(latest_seq, |end| end.min(latest_seq));
        let page_size = match request.limit {
            0 => self.default_page_size,
            limit => limit.min(self.max_page_size),
        };

        if request.seq_start >= upper {
            return Ok(UpdatesSlice {
                updates: Vec::new(),
                latest_seq,
                is_final: request.seq_start >= latest_seq,
                result_type: ResultType::Slice,
            });
        }

        if request.seq_start < self.log.pruned_floor(bucket)? {
            debug!(bucket = %bucket, seq_start = request.seq_start, "Catch-up reaches pruned rows");
            return Ok(UpdatesSlice::too_long(latest_seq));
        }

        let cap = self.max_total_updates.saturating_add(1);
        let span = self.log.count_between(bucket, request.seq_start, upper, cap)?;
        if span > self.max_total_updates {
            debug!(
                bucket = %bucket,
                seq_start = request.seq_start,
                latest_seq,
                "Catch-up span too long"
            );
            return Ok(UpdatesSlice::too_long(latest_seq));
        }

        let updates = self.log.scan(bucket, request.seq_start, upper, page_size)?;

        // Rows may have been pruned between the floor check and the scan.
        if request.seq_start < self.log.pruned_floor(bucket)? {
            return Ok(UpdatesSlice::too_long(latest_seq));
        }

        let reached = updates.last().map_or(request.seq_start, |row| row.seq);
        Ok(UpdatesSlice {
            is_final: reached >= latest_seq,
            updates,
            latest_seq,
            result_type: ResultType::Slice,
        })
    }

    pub fn get_state(&self, bucket: Bucket) -> UpdatesResult<BucketState> {
        Ok(match self.log.latest(bucket)? {
            Some(row) => BucketState {
                latest_seq: row.seq,
                latest_date: Some(row.created_at),
            },
            None => BucketState {
                latest_seq: 0,
                latest_date: None,
            },
        })
    }
}
