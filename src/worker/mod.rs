//! Job worker engine.
//!
//! - [`process`]: spawns one OS process, signals it, classifies its exit
//! - [`logs`]: per-job log files and cancellable tail-follow streams
//! - [`registry`]: the [`JobRegistry`] tying both together behind
//!   Start/Stop/Query/Stream
//!
//! # Job lifecycle
//!
//! 1. [`JobRegistry::start`] creates the log, spawns the process with stdout
//!    and stderr redirected into it, and registers the job as `Running`
//! 2. A completion watcher task waits for the process, writes the terminal
//!    status under the registry lock, then fires the completion signal
//! 3. [`JobRegistry::stop`] sends SIGTERM and waits up to 2s for that signal
//!    before escalating to SIGKILL
//!
//! Jobs and their logs stay in the registry for the lifetime of the worker.

pub mod job;
pub mod logs;
pub mod process;
pub mod registry;

pub use job::{CmdStatus, JobId, JobState, JobSummary, NO_EXIT_CODE};
pub use logs::{LogSink, LogStream};
pub use registry::JobRegistry;
