use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::cache::CacheGateway;
use crate::grpc::bytestream_service::ByteStreamService;
use crate::grpc::cas_service::{ActionCacheService, CasService};
use crate::grpc::execution_service::{ExecutionService, WatcherService};
use crate::proto::action_cache_server::ActionCacheServer;
use crate::proto::byte_stream_server::ByteStreamServer;
use crate::proto::content_addressable_storage_server::ContentAddressableStorageServer;
use crate::proto::execution_server::ExecutionServer;
use crate::proto::watcher_server::WatcherServer;
use crate::worker::ExecutionDispatcher;

/// The worker's gRPC surface. The cache services are always served;
/// Execution and Watcher only when a dispatcher is present.
pub struct GrpcServer {
    cache: CacheGateway,
    dispatcher: Option<ExecutionDispatcher>,
}

impl GrpcServer {
    pub fn new(cache: CacheGateway, dispatcher: Option<ExecutionDispatcher>) -> Self {
        Self { cache, dispatcher }
    }

    /// Serve on an already bound listener until `shutdown` is cancelled.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let local_addr = listener.local_addr().ok();
        let execution = self
            .dispatcher
            .clone()
            .map(|d| ExecutionServer::new(ExecutionService::new(d)));
        let watcher = self
            .dispatcher
            .map(|d| WatcherServer::new(WatcherService::new(d)));

        tracing::info!(
            addr = ?local_addr,
            execution = execution.is_some(),
            "Starting gRPC server"
        );

        Server::builder()
            .add_service(ContentAddressableStorageServer::new(CasService::new(
                self.cache.clone(),
            )))
            .add_service(ActionCacheServer::new(ActionCacheService::new(
                self.cache.clone(),
            )))
            .add_service(ByteStreamServer::new(ByteStreamService::new(self.cache)))
            .add_optional_service(execution)
            .add_optional_service(watcher)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
            .await
    }
}
