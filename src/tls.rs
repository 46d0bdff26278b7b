//! TLS utilities for loading certificates and configuring mTLS.
//!
//! The server side is a rustls configuration pinned to TLS 1.3 that requires
//! and verifies a client certificate. The client side is a tonic
//! [`ClientTlsConfig`] presenting a role-bearing certificate.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio_rustls::rustls::{
    self, pki_types::CertificateDer, server::VerifierBuilderError, server::WebPkiClientVerifier,
    RootCertStore,
};
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::TlsConfig;

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("No certificates found in {0}")]
    NoCertificates(&'static str),

    #[error("No private key found")]
    NoPrivateKey,

    #[error("Invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Invalid client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// PEM material loaded from the paths in a [`TlsConfig`].
#[derive(Clone)]
pub struct TlsIdentity {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl TlsIdentity {
    /// Load TLS materials from file paths specified in the config.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Any required path is not configured
    /// - Any file does not exist or cannot be read
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path.clone()));
        }
        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path.clone()));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path.clone()));
        }

        Ok(Self {
            ca_pem: fs::read(ca_cert_path).await?,
            cert_pem: fs::read(cert_path).await?,
            key_pem: fs::read(key_path).await?,
        })
    }

    /// Build the server-side rustls configuration.
    ///
    /// The returned config:
    /// - Accepts TLS 1.3 only
    /// - Requires a client certificate chaining to the configured CA
    /// - Presents this server's certificate
    /// - Negotiates `h2` via ALPN
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem, "CA certificate")? {
            roots.add(cert)?;
        }

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()?;

        let certs = parse_certs(&self.cert_pem, "server certificate")?;
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_slice())?
            .ok_or(TlsError::NoPrivateKey)?;

        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Arc::new(config))
    }

    /// Create client TLS config for connecting to the worker.
    ///
    /// The returned config:
    /// - Presents this client's certificate to the server
    /// - Verifies the server's certificate against the CA
    /// - Checks the server certificate against `domain`
    pub fn client_tls_config(&self, domain: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(Certificate::from_pem(&self.ca_pem))
            .identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
    }
}

fn parse_certs(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what));
    }
    Ok(certs)
}
