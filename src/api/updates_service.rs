use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, warn};

use crate::realtime::fill_gaps;
use crate::storage::{Bucket, BucketKind, UpdateRow};
use crate::syncpb;
use crate::syncpb::updates_server::Updates;
use crate::syncpb::{
    BucketSelector, GetUpdatesRequest, GetUpdatesResponse, GetUpdatesStateRequest,
    GetUpdatesStateResponse, SubscribeRequest, SubscribeResponse,
};
use crate::updates::{GetUpdates, ResultType, UpdateEngine};

/// Responses buffered per subscribe stream.
const SUBSCRIBE_STREAM_BUFFER: usize = 64;

pub struct UpdatesService {
    engine: Arc<UpdateEngine>,
}

impl UpdatesService {
    pub fn new(engine: Arc<UpdateEngine>) -> Self {
        Self { engine }
    }

    /// Resolves a bucket selector from a request.
    fn bucket(selector: Option<BucketSelector>) -> Result<Bucket, Status> {
        let selector =
            selector.ok_or_else(|| Status::new(Code::InvalidArgument, "bucket is required"))?;
        let kind = match syncpb::BucketKind::try_from(selector.kind) {
            Ok(syncpb::BucketKind::User) => BucketKind::User,
            Ok(syncpb::BucketKind::Chat) => BucketKind::Chat,
            Ok(syncpb::BucketKind::Space) => BucketKind::Space,
            _ => {
                return Err(Status::new(
                    Code::InvalidArgument,
                    format!("unknown bucket kind {}", selector.kind),
                ))
            }
        };
        Ok(Bucket::new(kind, selector.entity_id))
    }

    fn convert_row(row: UpdateRow) -> syncpb::UpdateRow {
        syncpb::UpdateRow {
            seq: row.seq,
            date: row.created_at.timestamp(),
            payload: row.payload,
        }
    }

    fn convert_result_type(result_type: ResultType) -> i32 {
        match result_type {
            ResultType::Slice => syncpb::ResultType::Slice as i32,
            ResultType::TooLong => syncpb::ResultType::TooLong as i32,
        }
    }

    /// A stream message; `seq` is the position the client has reached after applying it.
    fn subscribe_response(
        result_type: ResultType,
        seq: i64,
        rows: Vec<UpdateRow>,
    ) -> SubscribeResponse {
        SubscribeResponse {
            result_type: Self::convert_result_type(result_type),
            seq,
            updates: rows.into_iter().map(Self::convert_row).collect(),
        }
    }
}

#[tonic::async_trait]
impl Updates for UpdatesService {
    type SubscribeStream = ReceiverStream<Result<SubscribeResponse, Status>>;

    async fn get_updates(
        &self,
        request: Request<GetUpdatesRequest>,
    ) -> Result<Response<GetUpdatesResponse>, Status> {
        let req = request.into_inner();
        let bucket = Self::bucket(req.bucket)?;

        // Non-positive limits fall back to the configured page size
        let query = GetUpdates {
            bucket,
            seq_start: req.start_seq,
            seq_end: (req.seq_end != 0).then_some(req.seq_end),
            limit: usize::try_from(req.total_limit).unwrap_or(0),
        };
        let slice = self.engine.get_updates(&query)?;

        debug!(
            bucket = %bucket,
            start_seq = req.start_seq,
            returned = slice.updates.len(),
            latest_seq = slice.latest_seq,
            "Served GetUpdates"
        );

        Ok(Response::new(GetUpdatesResponse {
            seq: slice.latest_seq,
            r#final: slice.is_final,
            result_type: Self::convert_result_type(slice.result_type),
            updates: slice.updates.into_iter().map(Self::convert_row).collect(),
        }))
    }

    async fn get_updates_state(
        &self,
        request: Request<GetUpdatesStateRequest>,
    ) -> Result<Response<GetUpdatesStateResponse>, Status> {
        let bucket = Self::bucket(request.into_inner().bucket)?;
        let state = self.engine.get_state(bucket)?;

        Ok(Response::new(GetUpdatesStateResponse {
            seq: state.latest_seq,
            date: state.latest_date.map_or(0, |date| date.timestamp()),
        }))
    }

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let bucket = Self::bucket(req.bucket)?;
        if req.start_seq < 0 {
            return Err(Status::new(
                Code::InvalidArgument,
                "start_seq must not be negative",
            ));
        }

        // Register before replaying so rows committed during the replay are not missed
        let (subscription, live) = self
            .engine
            .hub()
            .subscribe(bucket, req.start_seq)
            .map_err(|e| Status::new(Code::InvalidArgument, e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_STREAM_BUFFER);
        let engine = self.engine.clone();
        tokio::spawn(async move {
            stream_bucket(engine.clone(), bucket, req.start_seq, live, tx).await;
            engine.hub().cancel(subscription).ok();
            debug!(subscription, bucket = %bucket, "Subscribe stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Replays the log after `start_seq`, then forwards live rows in log order.
async fn stream_bucket(
    engine: Arc<UpdateEngine>,
    bucket: Bucket,
    start_seq: i64,
    mut live: mpsc::Receiver<Vec<UpdateRow>>,
    tx: mpsc::Sender<Result<SubscribeResponse, Status>>,
) {
    let mut delivered = start_seq;

    loop {
        let slice = match engine.get_updates(&GetUpdates::new(bucket, delivered)) {
            Ok(slice) => slice,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        if slice.result_type == ResultType::TooLong {
            // The client resynchronizes from a snapshot at `latest_seq`
            delivered = slice.latest_seq;
            let marker =
                UpdatesService::subscribe_response(ResultType::TooLong, delivered, Vec::new());
            if tx.send(Ok(marker)).await.is_err() {
                return;
            }
            break;
        }

        let done = slice.is_final || slice.updates.is_empty();
        if let Some(last) = slice.updates.last() {
            delivered = last.seq;
            let page =
                UpdatesService::subscribe_response(ResultType::Slice, delivered, slice.updates);
            if tx.send(Ok(page)).await.is_err() {
                return;
            }
        }
        if done {
            break;
        }
    }

    loop {
        let rows = tokio::select! {
            _ = tx.closed() => return,
            rows = live.recv() => rows,
        };

        let Some(rows) = rows else {
            warn!(bucket = %bucket, delivered, "Subscriber dropped by realtime hub");
            let _ = tx
                .send(Err(Status::new(
                    Code::Aborted,
                    format!("subscriber fell behind at seq {}, resume with GetUpdates", delivered),
                )))
                .await;
            return;
        };

        let rows = match fill_gaps(engine.log(), bucket, &mut delivered, rows) {
            Ok(rows) => rows,
            Err(e) => {
                let _ = tx
                    .send(Err(Status::new(Code::Internal, e.to_string())))
                    .await;
                return;
            }
        };
        if rows.is_empty() {
            continue;
        }

        let response = UpdatesService::subscribe_response(ResultType::Slice, delivered, rows);
        if tx.send(Ok(response)).await.is_err() {
            return;
        }
    }
}
