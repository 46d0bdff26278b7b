//! OS process control for a single job.
//!
//! A [`Process`] is created by [`Process::spawn`], which hands back the
//! [`Child`] separately so that exactly one task (the registry's completion
//! watcher) can wait on it while any number of callers signal through the
//! shared `Arc<Process>`.

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::worker::job::{JobState, NO_EXIT_CODE};

/// Time allowed between SIGTERM and SIGKILL.
pub const TERMINATION_GRACE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process not started")]
    NotStarted,

    #[error("process {0} already finished")]
    AlreadyFinished(u32),

    #[error("failed to send {signal:?} to process {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: Errno,
    },
}

/// Terminal classification of a process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub state: JobState,
    pub exit_code: i32,
}

/// Classify an exit status. A stop request always wins; a signal death that
/// nobody requested still counts as stopped since the process did not exit.
pub fn classify(status: ExitStatus, stop_requested: bool) -> Exit {
    let code = status.code();
    let state = match (stop_requested, code) {
        (true, _) => JobState::Stopped,
        (false, Some(0)) => JobState::Success,
        (false, Some(_)) => JobState::Failed,
        (false, None) => JobState::Stopped,
    };

    if let Some(signal) = status.signal() {
        tracing::debug!(signal, ?state, "Process terminated by signal");
    }

    Exit {
        state,
        exit_code: code.unwrap_or(NO_EXIT_CODE),
    }
}

#[derive(Debug)]
pub struct Process {
    pid: Option<u32>,
    stop_requested: AtomicBool,
    finished: watch::Sender<bool>,
}

impl Process {
    /// Launch `command` with `args` in its own process group, with stdout
    /// and stderr both appended to `log`.
    pub fn spawn(
        command: &str,
        args: &[String],
        log: std::fs::File,
    ) -> Result<(Arc<Self>, Child), ProcessError> {
        let spawn_error = |source| ProcessError::Spawn {
            command: command.to_string(),
            source,
        };

        let stderr = log.try_clone().map_err(spawn_error)?;
        let mut std_command = std::process::Command::new(command);
        std_command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let child = Command::from(std_command).spawn().map_err(spawn_error)?;

        let (finished, _) = watch::channel(false);
        let process = Self {
            pid: child.id(),
            stop_requested: AtomicBool::new(false),
            finished,
        };

        tracing::debug!(command, pid = ?process.pid, "Process spawned");
        Ok((Arc::new(process), child))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once the completion signal has fired.
    pub async fn finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Wait for the child to exit and classify the result. Does not fire the
    /// completion signal; the caller publishes the status first and then
    /// calls [`Process::complete`].
    pub async fn wait(&self, mut child: Child) -> Exit {
        match child.wait().await {
            Ok(status) => classify(status, self.stop_requested.load(Ordering::SeqCst)),
            Err(e) => {
                tracing::error!(pid = ?self.pid, error = %e, "Failed to wait for process");
                Exit {
                    state: JobState::Failed,
                    exit_code: NO_EXIT_CODE,
                }
            }
        }
    }

    /// Fire the completion signal. Only the first call has an effect.
    pub fn complete(&self) {
        self.finished.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        });
    }

    /// SIGTERM the process group, then SIGKILL it if the completion signal
    /// has not fired within [`TERMINATION_GRACE_INTERVAL`].
    ///
    /// Returns as soon as SIGKILL is dispatched; it does not wait for the
    /// kill to take effect.
    pub async fn terminate(&self) -> Result<(), ProcessError> {
        let pid = self.pid.ok_or(ProcessError::NotStarted)?;

        let mut finished = self.finished.subscribe();
        if *finished.borrow() {
            return Err(ProcessError::AlreadyFinished(pid));
        }

        // The child may have exited without the watcher having published it
        // yet. A stop request must not relabel that exit as Stopped.
        if has_exited(pid) {
            return Err(ProcessError::AlreadyFinished(pid));
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        match signal_group(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(ProcessError::Signal { source: Errno::ESRCH, .. }) => {
                self.stop_requested.store(false, Ordering::SeqCst);
                return Err(ProcessError::AlreadyFinished(pid));
            }
            Err(e) => {
                self.stop_requested.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        tokio::select! {
            _ = finished.wait_for(|done| *done) => {
                tracing::debug!(pid, "Process exited after SIGTERM");
            }
            _ = tokio::time::sleep(TERMINATION_GRACE_INTERVAL) => {
                match signal_group(pid, Signal::SIGKILL) {
                    Ok(()) => {
                        tracing::warn!(pid, "SIGTERM did not stop the process within 2s, SIGKILL sent");
                    }
                    // Exited between the timeout and the kill.
                    Err(ProcessError::Signal { source: Errno::ESRCH, .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }
}

/// Whether the child has exited, as a zombie still waiting to be reaped or
/// already reaped. Leaves the child reapable.
fn has_exited(pid: u32) -> bool {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => true,
        Err(Errno::ECHILD) => true,
        Err(e) => {
            tracing::debug!(pid, error = %e, "Could not check process state");
            false
        }
    }
}

fn signal_group(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    killpg(Pid::from_raw(pid as i32), signal).map_err(|source| ProcessError::Signal {
        pid,
        signal,
        source,
    })
}
