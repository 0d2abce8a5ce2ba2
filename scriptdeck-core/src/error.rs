//! Error taxonomy for the execution engine.
//!
//! Only `SpawnError` and unrecoverable runtime failures ever reach the host's
//! output. Stop/write races are benign and get swallowed by the session.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The interpreter or the script could not be launched.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("interpreter '{program}' was not found on PATH")]
    InterpreterNotFound {
        program: String,
        #[source]
        source: which::Error,
    },

    #[error("script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("failed to spawn '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Stopping a process that is already gone.
#[derive(Debug, Error)]
pub enum StopError {
    #[error("process {pid} has already exited")]
    AlreadyExited { pid: u32 },

    #[error("process {pid} did not exit within {waited:?} after kill")]
    ExitTimeout { pid: u32, waited: Duration },
}

/// Writing to a process input stream that can no longer accept data.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("process {pid} has already exited")]
    Exited { pid: u32 },

    #[error("input stream of process {pid} is closed")]
    InputClosed { pid: u32 },

    #[error("failed to write to process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Resource group creation / assignment failures.
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("resource group is closed")]
    Closed,

    #[error("{action} failed for {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to apply {resource} limit to pid {pid}: {source}")]
    Limit {
        resource: &'static str,
        pid: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("loop interval must be greater than zero")]
    InvalidInterval,
}

/// Contract violations on a `BlockSession`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("block session {0} has been disposed")]
    Disposed(uuid::Uuid),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
