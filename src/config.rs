use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::authz::PolicyStore;

pub const DEFAULT_PORT: u16 = 6000;
pub const DEFAULT_LOG_DIR: &str = "/var/lib/jobworker/logs";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Certificate material for one side of the mTLS connection.
///
/// Both the server and the client verify their peer against `ca_cert`
/// and present `ssl_cert`/`ssl_key` as their own identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate (PEM) used to verify the peer.
    #[serde(rename = "ca_cert")]
    pub ca_cert_path: Option<PathBuf>,

    /// Certificate (PEM) presented to the peer.
    #[serde(rename = "ssl_cert")]
    pub cert_path: Option<PathBuf>,

    /// Private key (PEM) matching `cert_path`.
    #[serde(rename = "ssl_key")]
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn new(
        ca_cert_path: impl Into<PathBuf>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
        }
    }

    /// Check if all three files are configured.
    pub fn is_complete(&self) -> bool {
        self.ca_cert_path.is_some() && self.cert_path.is_some() && self.key_path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Directory holding one `<job_id>/output.log` per job.
    pub log_dir: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name the server certificate is issued for. Clients verify against it.
    pub hostname: String,
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: DEFAULT_PORT,
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    /// `https://hostname:port`, the endpoint clients dial.
    pub fn endpoint(&self) -> String {
        format!("https://{}:{}", self.hostname, self.listen_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub tls: TlsConfig,
}

/// Complete worker configuration, as read from a TOML file.
///
/// ```toml
/// [global]
/// log_dir = "/var/lib/jobworker/logs"
///
/// [server]
/// hostname = "localhost"
/// listen_addr = "127.0.0.1"
/// listen_port = 6000
/// ca_cert = "certs/ca.crt"
/// ssl_cert = "certs/server.crt"
/// ssl_key = "certs/server.key"
///
/// [client]
/// ca_cert = "certs/ca.crt"
/// ssl_cert = "certs/client_write.crt"
/// ssl_key = "certs/client_write.key"
/// ```
///
/// An optional `[policy]` section replaces the built-in role table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub global: GlobalConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub policy: PolicyStore,
}

impl WorkerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}
