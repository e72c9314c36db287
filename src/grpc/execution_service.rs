use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::action::Action;
use crate::grpc::convert::required_digest;
use crate::proto::execute_request::ActionSource as ProtoActionSource;
use crate::proto::execution_server::Execution;
use crate::proto::watcher_server::Watcher;
use crate::proto::{self, ExecuteResponse, WatchRequest};
use crate::worker::{ActionSource, ExecuteRequest, ExecutionDispatcher};

/// Snapshots buffered per watcher before the forwarding task waits on the
/// client.
const WATCH_BUFFER: usize = 16;

/// gRPC front of the execution dispatcher.
pub struct ExecutionService {
    dispatcher: ExecutionDispatcher,
}

impl ExecutionService {
    pub fn new(dispatcher: ExecutionDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[tonic::async_trait]
impl Execution for ExecutionService {
    async fn execute(
        &self,
        request: Request<proto::ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let req = request.into_inner();

        let action = match req.action_source {
            Some(ProtoActionSource::Action(action)) => ActionSource::Inline(Action::try_from(action)?),
            Some(ProtoActionSource::ActionDigest(digest)) => {
                ActionSource::Digest(required_digest(Some(digest), "action_digest")?)
            }
            None => {
                return Err(Status::invalid_argument(
                    "Either an action or an action digest is required",
                ))
            }
        };

        let submission = self
            .dispatcher
            .submit(ExecuteRequest {
                action,
                skip_cache_lookup: req.skip_cache_lookup,
            })
            .await?;

        Ok(Response::new(ExecuteResponse {
            operation_id: submission.operation_id.to_string(),
            action_digest: Some(submission.action_digest.into()),
        }))
    }
}

/// Streams operation snapshots to clients until the operation is terminal.
pub struct WatcherService {
    dispatcher: ExecutionDispatcher,
}

impl WatcherService {
    pub fn new(dispatcher: ExecutionDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[tonic::async_trait]
impl Watcher for WatcherService {
    type WatchStream = Pin<Box<dyn Stream<Item = Result<proto::Operation, Status>> + Send>>;

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let req = request.into_inner();
        // An id that doesn't parse can't name an existing operation.
        let id = Uuid::parse_str(&req.operation_id).map_err(|_| {
            Status::not_found(format!("Operation not found: {}", req.operation_id))
        })?;
        let mut watch = self.dispatcher.watch(&id)?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        tracing::debug!(operation_id = %id, "Watcher disconnected");
                        break;
                    }
                    next = watch.next() => match next {
                        Some(op) => {
                            if tx.send(Ok((&op).into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
