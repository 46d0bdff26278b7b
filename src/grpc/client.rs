use tonic::transport::{Channel, Endpoint};

use crate::error::Result;
use crate::proto::worker_service_client::WorkerServiceClient;
use crate::tls::TlsIdentity;

/// Connect to a worker at `endpoint` (`https://host:port`) over mTLS,
/// verifying the server certificate against `domain`.
pub async fn connect(
    endpoint: &str,
    identity: &TlsIdentity,
    domain: &str,
) -> Result<WorkerServiceClient<Channel>> {
    let channel = Endpoint::from_shared(endpoint.to_string())?
        .tls_config(identity.client_tls_config(domain))?
        .connect()
        .await?;
    Ok(WorkerServiceClient::new(channel))
}
