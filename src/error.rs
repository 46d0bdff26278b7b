use thiserror::Error;

use crate::config::ConfigError;
use crate::tls::TlsError;
use crate::worker::logs::LogError;
use crate::worker::process::ProcessError;
use crate::worker::JobId;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to start job {job_id}: {source}")]
    SpawnFailed {
        job_id: JobId,
        #[source]
        source: ProcessError,
    },

    #[error("Failed to terminate job {job_id}: {source}")]
    Terminate {
        job_id: JobId,
        #[source]
        source: ProcessError,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// The job an error is attributed to, including ids generated by a start
    /// attempt that never registered.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerError::SpawnFailed { job_id, .. } | WorkerError::Terminate { job_id, .. } => {
                Some(*job_id)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
