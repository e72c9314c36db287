use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::{BlobStore, CacheGateway, InMemoryBlobStore};
use crate::config::WorkerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{Result, WorkerError};
use crate::grpc::GrpcServer;
use crate::operations::OperationRegistry;
use crate::pidfile::PidFile;
use crate::worker::{sandbox, CommandRunner, ExecutionDispatcher, ProcessRunner};

/// What the worker accepts, decided once at startup.
#[derive(Debug, Clone)]
pub enum WorkerMode {
    /// Only the CAS, action cache and byte stream services are served.
    CacheOnly,
    /// Actions are executed as well.
    Execution(ExecutionDispatcher),
}

impl WorkerMode {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerMode::CacheOnly => "cache-only",
            WorkerMode::Execution(_) => "execution",
        }
    }

    pub fn dispatcher(&self) -> Option<&ExecutionDispatcher> {
        match self {
            WorkerMode::CacheOnly => None,
            WorkerMode::Execution(dispatcher) => Some(dispatcher),
        }
    }
}

/// A worker process: cache, operation registry and, in execution mode, the
/// dispatcher, behind one gRPC listener.
pub struct WorkerNode {
    config: WorkerConfig,
    cache: CacheGateway,
    registry: Arc<OperationRegistry>,
    mode: WorkerMode,
}

impl WorkerNode {
    /// Build a worker backed by the in-memory blob store.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        tracing::warn!("Using the in-memory blob store; contents are lost on exit (testing only)");
        Self::with_store(config, Arc::new(InMemoryBlobStore::new())).await
    }

    /// Build a worker on top of `store`.
    ///
    /// A work path that cannot be created is fatal. A sandbox that was asked
    /// for but doesn't work only disables execution.
    pub async fn with_store(config: WorkerConfig, store: Arc<dyn BlobStore>) -> Result<Self> {
        let cache = CacheGateway::new(store);
        let registry = Arc::new(OperationRegistry::new());
        let mode = resolve_mode(&config, cache.clone(), registry.clone()).await?;

        tracing::info!(mode = mode.name(), "Worker initialized");
        Ok(Self {
            config,
            cache,
            registry,
            mode,
        })
    }

    pub fn mode(&self) -> &WorkerMode {
        &self.mode
    }

    pub fn cache(&self) -> &CacheGateway {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on `listener` until `shutdown` is cancelled.
    ///
    /// The pid file is written once the listener is bound and removed when
    /// this returns. The dashboard, if configured, shuts down with the server.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr: SocketAddr = listener.local_addr()?;

        let _pid_file = match &self.config.pid_file {
            Some(path) => Some(PidFile::create(path)?),
            None => None,
        };

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let state = DashboardState {
                registry: self.registry.clone(),
                mode: self.mode.name(),
            };
            let dashboard_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(dashboard_addr, state, dashboard_shutdown).await;
            });
        }

        tracing::info!(addr = %local_addr, mode = self.mode.name(), "Worker listening");

        let server = GrpcServer::new(self.cache.clone(), self.mode.dispatcher().cloned());
        server.serve(listener, shutdown).await?;

        tracing::info!("Worker stopped");
        Ok(())
    }
}

async fn resolve_mode(
    config: &WorkerConfig,
    cache: CacheGateway,
    registry: Arc<OperationRegistry>,
) -> Result<WorkerMode> {
    let Some(work_path) = &config.work_path else {
        if config.sandbox.enabled {
            tracing::warn!("Sandboxing requested without a work path; execution disabled");
        }
        return Ok(WorkerMode::CacheOnly);
    };

    tokio::fs::create_dir_all(work_path)
        .await
        .map_err(|source| WorkerError::WorkPath {
            path: work_path.clone(),
            source,
        })?;

    let runner: Arc<dyn CommandRunner> = if config.sandbox.enabled {
        match sandbox::prepare(&config.sandbox, Some(work_path)).await {
            Ok(binary) => Arc::new(ProcessRunner::sandboxed(binary)),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Sandboxing requested but unavailable; serving cache only"
                );
                return Ok(WorkerMode::CacheOnly);
            }
        }
    } else {
        tracing::warn!("Sandboxing disabled; actions run directly on the host");
        Arc::new(ProcessRunner::direct())
    };

    let dispatcher = ExecutionDispatcher::new(registry, cache, runner, work_path.clone())
        .with_default_timeout(config.default_timeout)
        .with_worker_name(format!("remote-worker@{}", config.listen_addr));

    Ok(WorkerMode::Execution(dispatcher))
}
