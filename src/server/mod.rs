//! Main server module that orchestrates all subsystems.
//!
//! This module coordinates the initialization and execution of:
//! - Persistent storage backend (sled-based key-value store)
//! - Update engine (sequence allocation, update log, catch-up reads)
//! - Realtime hub (live delivery of committed updates)
//! - Retention pruner (optional bound on log length)
//! - gRPC service server

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::api::UpdatesService;
use crate::realtime::RealtimeHub;
use crate::storage::{Backend, BackendConfig, Pruner, RetentionMode};
use crate::syncpb::updates_server::UpdatesServer;
use crate::updates::{EngineConfig, UpdateEngine};

/// Main server that coordinates all subsystems.
pub struct SyncServer {
    config: ServerConfig,
    backend: Arc<Backend>,
    engine: Arc<UpdateEngine>,
    hub: Arc<RealtimeHub>,
    background_tasks: Vec<JoinHandle<()>>,
}

/// Configuration for the sync server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Human-readable name for this server.
    pub name: String,

    /// Path to the data directory.
    pub data_dir: PathBuf,

    /// List of URLs to listen on for client traffic.
    pub listen_client_urls: Vec<String>,

    /// Backend page cache size in megabytes.
    pub cache_size_mb: u64,

    /// Backend flush interval in milliseconds (0 disables periodic flushing).
    pub flush_interval_ms: u64,

    /// Engine tuning.
    pub engine: EngineConfig,

    /// Rows kept per bucket by the retention pruner (0 disables pruning).
    pub retention_updates: u64,

    /// Interval between retention passes.
    pub retention_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            data_dir: PathBuf::from("default.chatsync"),
            listen_client_urls: vec!["http://localhost:7400".to_string()],
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            engine: EngineConfig::default(),
            retention_updates: 0,
            retention_interval: Duration::from_secs(300),
        }
    }
}

impl SyncServer {
    /// Create a new server instance with the given configuration.
    ///
    /// This initializes all subsystems:
    /// 1. Persistent storage backend
    /// 2. Realtime hub
    /// 3. Update engine
    /// 4. Retention pruner, when enabled
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        info!(
            name = %config.name,
            data_dir = %config.data_dir.display(),
            "Initializing sync server"
        );

        // 1. Initialize backend storage (sled-based)
        let backend_config = BackendConfig {
            data_dir: config.data_dir.clone(),
            cache_size_mb: config.cache_size_mb,
            flush_interval_ms: config.flush_interval_ms,
            temporary: false,
        };
        let backend = Backend::new(backend_config)
            .map_err(|e| anyhow::anyhow!("Failed to initialize backend: {}", e))?;
        info!("Backend storage initialized");

        // 2. Initialize realtime hub
        let hub = RealtimeHub::new(config.engine.subscriber_buffer);
        info!("Realtime hub initialized");

        // 3. Initialize update engine
        let engine = UpdateEngine::new(backend.clone(), config.engine.clone(), hub.clone());

        let mut server = Self {
            config,
            backend,
            engine,
            hub,
            background_tasks: Vec::new(),
        };

        // 4. Start retention pruner
        if server.config.retention_updates > 0 {
            let pruner = Pruner::new(
                server.engine.log().clone(),
                server.engine.entities().clone(),
                RetentionMode::Periodic(server.config.retention_interval),
                server.config.retention_updates,
            );
            server.background_tasks.push(pruner.run());
            info!(
                retain = server.config.retention_updates,
                "Retention pruner started"
            );
        } else {
            info!("Retention disabled");
        }

        info!("Sync server initialization complete");
        Ok(server)
    }

    /// Run the server, starting the gRPC server.
    ///
    /// This method will block until the shutdown signal is received or an error occurs.
    pub async fn run(
        mut self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let client_urls = parse_socket_addrs(&self.config.listen_client_urls)?;
        if client_urls.is_empty() {
            return Err(anyhow::anyhow!("No valid client URLs to listen on"));
        }

        // We use the first URL as the primary listener
        let addr = client_urls[0];

        info!(addr = %addr, "Starting gRPC server");

        let updates_service = UpdatesService::new(self.engine.clone());

        let server = Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(10)))
            .http2_keepalive_timeout(Some(Duration::from_secs(20)))
            .add_service(UpdatesServer::new(updates_service))
            .serve_with_shutdown(addr, shutdown);

        info!("Sync server listening on {}", addr);
        info!("Data directory: {}", self.config.data_dir.display());
        info!("Server name: {}", self.config.name);

        let result = server.await;

        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self.backend.flush() {
            warn!(error = %e, "Failed to flush backend on shutdown");
        }

        result?;
        info!("Sync server shutting down");
        Ok(())
    }

    /// Get reference to the update engine.
    pub fn engine(&self) -> Arc<UpdateEngine> {
        self.engine.clone()
    }

    /// Get reference to the realtime hub.
    pub fn hub(&self) -> Arc<RealtimeHub> {
        self.hub.clone()
    }

    /// Get reference to the storage backend.
    pub fn backend(&self) -> Arc<Backend> {
        self.backend.clone()
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Parse listen URLs into socket addresses.
pub fn parse_socket_addrs(urls: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    let mut addrs = Vec::new();
    for url in urls {
        // Simple parser for http://host:port format
        let url_str = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .unwrap_or(url.as_str());

        match url_str.to_socket_addrs() {
            Ok(mut iter) => {
                if let Some(addr) = iter.next() {
                    addrs.push(addr);
                }
            }
            Err(e) => {
                warn!(url = url, error = %e, "Failed to parse listen URL");
            }
        }
    }

    Ok(addrs)
}
