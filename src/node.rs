use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::authz::{AuthorizationGate, PolicyStore};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::grpc::WorkerServer;
use crate::tls::TlsIdentity;
use crate::worker::{JobRegistry, LogSink};

/// A configured worker, ready to serve.
pub struct Node {
    pub config: WorkerConfig,
    pub registry: JobRegistry,
    server: WorkerServer,
}

impl Node {
    /// Build every component from `config` and bind the listening socket.
    ///
    /// # Errors
    ///
    /// Fails if the log directory cannot be created, the server certificate
    /// material cannot be loaded, or the address cannot be bound.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.global.log_dir).await?;

        let identity = TlsIdentity::load(&config.server.tls).await?;
        let tls = identity.server_config()?;

        let policy: Arc<PolicyStore> = Arc::new(config.policy.clone());
        let gate = Arc::new(AuthorizationGate::new(policy));
        let registry = JobRegistry::new(LogSink::new(config.global.log_dir.clone()));

        let server =
            WorkerServer::bind(config.server.socket_addr(), tls, registry.clone(), gate).await?;

        Ok(Self {
            config,
            registry,
            server,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled. Running jobs are stopped before
    /// this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            log_dir = %self.config.global.log_dir.display(),
            hostname = %self.config.server.hostname,
            "Worker node starting"
        );
        self.server.run(shutdown).await?;
        Ok(())
    }
}
