use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::worker::job::{CmdStatus, Job, JobId, JobState, JobSummary};
use crate::worker::logs::{LogSink, LogStream};
use crate::worker::process::{Process, ProcessError};

/// Concurrency-safe registry of jobs started by this worker.
///
/// Jobs are inserted only after their process has spawned and are never
/// evicted. All status changes go through the registry's write lock.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    logs: LogSink,
}

impl JobRegistry {
    pub fn new(logs: LogSink) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            logs,
        }
    }

    /// Start `command_and_args[0]` with the remaining elements as arguments.
    ///
    /// The job is registered as `Running` before this returns. On spawn
    /// failure the log is removed and the error carries the generated id;
    /// that id is never registered.
    pub async fn start(&self, command_and_args: Vec<String>) -> Result<JobId> {
        let mut parts = command_and_args.into_iter();
        let command = match parts.next() {
            Some(command) if !command.trim().is_empty() => command,
            _ => {
                return Err(WorkerError::InvalidArgument(
                    "command cannot be empty".to_string(),
                ))
            }
        };
        let args: Vec<String> = parts.collect();

        let job_id = Uuid::new_v4();
        let log = self.logs.create(&job_id).await?;

        let (process, child) = match Process::spawn(&command, &args, log) {
            Ok(spawned) => spawned,
            Err(source) => {
                self.logs.remove(&job_id).await;
                tracing::warn!(job_id = %job_id, command, error = %source, "Job failed to start");
                return Err(WorkerError::SpawnFailed { job_id, source });
            }
        };

        let pid = process.pid();
        let job = Job::new(job_id, command.clone(), args, process.clone());
        self.jobs.write().await.insert(job_id, job);
        tracing::info!(job_id = %job_id, command, pid = ?pid, "Job started");

        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let exit = process.wait(child).await;
            {
                let mut jobs = jobs.write().await;
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status.state = exit.state;
                    job.status.exit_code = exit.exit_code;
                    job.status.finished_at = Some(Utc::now());
                }
            }
            process.complete();
            tracing::info!(
                job_id = %job_id,
                state = %exit.state,
                exit_code = exit.exit_code,
                "Job finished"
            );
        });

        Ok(job_id)
    }

    /// Terminate a job: SIGTERM, then SIGKILL after the grace interval.
    ///
    /// Fails for jobs that already reached a terminal state.
    pub async fn stop(&self, job_id: &JobId) -> Result<()> {
        let process = {
            let jobs = self.jobs.read().await;
            let job = jobs
                .get(job_id)
                .ok_or_else(|| WorkerError::JobNotFound(job_id.to_string()))?;
            job.process.clone()
        };

        // The lock is released here so the completion watcher can publish
        // the terminal status while we wait out the grace interval.
        process
            .terminate()
            .await
            .map_err(|source| WorkerError::Terminate {
                job_id: *job_id,
                source,
            })?;

        tracing::info!(job_id = %job_id, "Job stopped");
        Ok(())
    }

    pub async fn query(&self, job_id: &JobId) -> Result<CmdStatus> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| WorkerError::JobNotFound(job_id.to_string()))
    }

    /// Follow the output of a job until `cancel` fires or the stream is
    /// dropped. Works for finished jobs as well.
    pub async fn stream(&self, cancel: CancellationToken, job_id: &JobId) -> Result<LogStream> {
        if !self.jobs.read().await.contains_key(job_id) {
            return Err(WorkerError::JobNotFound(job_id.to_string()));
        }
        Ok(self.logs.stream(cancel, job_id).await?)
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<JobSummary> {
        let jobs = self.jobs.read().await;
        let mut summaries: Vec<JobSummary> = jobs.values().map(Job::summary).collect();
        summaries.sort_by_key(|job| job.status.started_at);
        summaries
    }

    /// Terminate every job that is still running. Returns how many were
    /// signalled.
    pub async fn shutdown(&self) -> usize {
        let running: Vec<(JobId, Arc<Process>)> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .filter(|job| job.status.state == JobState::Running)
                .map(|job| (job.id, job.process.clone()))
                .collect()
        };

        let count = running.len();
        let mut tasks = JoinSet::new();
        for (job_id, process) in running {
            tasks.spawn(async move {
                match process.terminate().await {
                    Ok(()) | Err(ProcessError::AlreadyFinished(_)) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to stop job on shutdown");
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        if count > 0 {
            tracing::info!(count, "Stopped running jobs");
        }
        count
    }
}
