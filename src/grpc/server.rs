use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::authz::AuthorizationGate;
use crate::grpc::authz_layer::AuthzLayer;
use crate::grpc::worker_service::WorkerApi;
use crate::proto::worker_service_server::WorkerServiceServer;
use crate::worker::JobRegistry;

/// Connections that do not complete the handshake in time are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WorkerServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: JobRegistry,
    gate: Arc<AuthorizationGate>,
}

impl WorkerServer {
    /// Bind the listening socket. Port 0 picks a free port; see
    /// [`WorkerServer::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        registry: JobRegistry,
        gate: Arc<AuthorizationGate>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            registry,
            gate,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled, then stop every job that is
    /// still running.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let addr = self.local_addr().ok();
        let service = WorkerApi::new(self.registry.clone(), shutdown.clone());
        let incoming = tls_incoming(self.listener, self.acceptor, shutdown.clone());

        tracing::info!(addr = ?addr, "Starting gRPC server");

        let result = Server::builder()
            .layer(AuthzLayer::new(self.gate))
            .add_service(WorkerServiceServer::new(service))
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
            .await;

        tracing::info!("gRPC server stopped");
        self.registry.shutdown().await;
        result
    }
}

/// Accept TCP connections and run the TLS handshake for each one in its own
/// task, so a slow or failing handshake never blocks the accept loop.
fn tls_incoming(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shutdown: CancellationToken,
) -> ReceiverStream<io::Result<TlsStream<TcpStream>>> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => {
                        let _ = tx.send(Ok(tls)).await;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(%peer, error = %e, "TLS handshake failed");
                    }
                    Err(_) => {
                        tracing::debug!(%peer, "TLS handshake timed out");
                    }
                }
            });
        }
    });

    ReceiverStream::new(rx)
}
