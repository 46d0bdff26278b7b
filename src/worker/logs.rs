//! Per-job log files and tail-follow streaming.
//!
//! Each job writes its merged stdout/stderr to `<log_dir>/<job_id>/output.log`.
//! [`LogSink::stream`] opens an independent read handle and follows the file
//! like `tail -f`, handing chunks to a [`LogStream`] until the stream is
//! cancelled or the file can no longer be read.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::worker::job::JobId;

const LOG_FILE_NAME: &str = "output.log";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_BUFFER_SIZE: usize = 8192;
const CHUNK_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to create log {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("log not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to open log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Creates, removes and follows job logs under a single directory.
#[derive(Debug, Clone)]
pub struct LogSink {
    log_dir: PathBuf,
    poll_interval: Duration,
}

impl LogSink {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.log_dir.join(job_id.to_string())
    }

    pub fn log_path(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join(LOG_FILE_NAME)
    }

    /// Create the log file for `job_id`, creating directories as needed.
    pub async fn create(&self, job_id: &JobId) -> Result<std::fs::File, LogError> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| LogError::Create {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(LOG_FILE_NAME);
        let file = File::create(&path)
            .await
            .map_err(|source| LogError::Create {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(job_id = %job_id, path = %path.display(), "Log created");
        Ok(file.into_std().await)
    }

    /// Remove everything stored for `job_id`. Missing artifacts are ignored.
    pub async fn remove(&self, job_id: &JobId) {
        let dir = self.job_dir(job_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to remove job log");
            }
        }
    }

    /// Follow the log of `job_id` from its beginning until `cancel` fires,
    /// the returned stream is closed or dropped, or reading fails.
    pub async fn stream(
        &self,
        cancel: CancellationToken,
        job_id: &JobId,
    ) -> Result<LogStream, LogError> {
        let path = self.log_path(job_id);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LogError::NotFound(path));
            }
            Err(source) => return Err(LogError::Open { path, source }),
        };

        // Closing or dropping this stream must not cancel the caller's token.
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let follower = Follower {
            path,
            file,
            tx,
            cancel: cancel.clone(),
            poll_interval: self.poll_interval,
        };
        tokio::spawn(follower.run());

        Ok(LogStream {
            rx,
            cancel,
            state: StreamState::Open,
        })
    }
}

/// Why a follower stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowEnd {
    Cancelled,
    ReceiverClosed,
    SourceGone,
    ReadFailed,
}

struct Follower {
    path: PathBuf,
    file: File,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl Follower {
    async fn run(mut self) {
        let end = self.follow().await;
        match end {
            FollowEnd::Cancelled | FollowEnd::ReceiverClosed => {
                tracing::debug!(path = %self.path.display(), reason = ?end, "Finished streaming log");
            }
            FollowEnd::SourceGone | FollowEnd::ReadFailed => {
                tracing::warn!(path = %self.path.display(), reason = ?end, "Log stream terminated");
            }
        }
        // Dropping self closes the file and the channel.
    }

    async fn follow(&mut self) -> FollowEnd {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return FollowEnd::Cancelled,
                read = self.file.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    if !self.source_exists().await {
                        return FollowEnd::SourceGone;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => return FollowEnd::Cancelled,
                        _ = self.tx.closed() => return FollowEnd::ReceiverClosed,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return FollowEnd::Cancelled,
                        sent = self.tx.send(chunk) => {
                            if sent.is_err() {
                                return FollowEnd::ReceiverClosed;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to read log");
                    return FollowEnd::ReadFailed;
                }
            }
        }
    }

    async fn source_exists(&self) -> bool {
        tokio::fs::metadata(&self.path).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

/// Cancellable stream of log chunks.
///
/// Never yields empty chunks. Ends (`None`) after [`LogStream::close`], after
/// the cancel token fires, or when the follower hits a read failure. Dropping
/// the stream cancels its follower.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    state: StreamState,
}

impl LogStream {
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if self.state == StreamState::Closed {
            return None;
        }
        match self.rx.recv().await {
            Some(chunk) => Some(chunk),
            None => {
                self.state = StreamState::Closed;
                None
            }
        }
    }

    /// Stop following. Chunks not yet received are discarded.
    pub fn close(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::Closed;
            self.cancel.cancel();
            self.rx.close();
        }
    }
}

impl Stream for LogStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        if self.state == StreamState::Closed {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                self.state = StreamState::Closed;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
