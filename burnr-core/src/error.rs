//! Error types for the burn engine and its collaborators.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Classification of external process failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    FailedToStart,
    Crashed,
    TimedOut,
}

impl ProcessErrorKind {
    pub fn message(self) -> &'static str {
        match self {
            ProcessErrorKind::FailedToStart => "Failed to start process",
            ProcessErrorKind::Crashed => "Process crashed",
            ProcessErrorKind::TimedOut => "Process timed out",
        }
    }
}

/// Errors from running external tools.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to start '{0}': {1}")]
    FailedToStart(String, #[source] io::Error),

    #[error("'{0}' timed out after {1:?}")]
    TimedOut(String, std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from device enumeration and unmount/eject operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to run device listing tool: {0}")]
    Listing(#[source] ProcessError),

    #[error("device not found: {0}")]
    DeviceNotFound(PathBuf),

    #[error("failed to unmount {0}")]
    UnmountFailed(String),

    #[error("failed to eject {0}")]
    EjectFailed(PathBuf),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from partition table creation and formatting.
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("{0} exited with code {1}")]
    ToolFailed(&'static str, i32),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("invalid cluster size {size} for {fs}")]
    InvalidClusterSize { fs: &'static str, size: u32 },
}

/// Errors from checksum verification.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by [`crate::engine::BurnEngine`] job submission and control.
#[derive(Error, Debug)]
pub enum BurnError {
    #[error("burn operation already in progress")]
    AlreadyRunning,

    #[error("image file does not exist: {0}")]
    ImageNotFound(PathBuf),

    #[error("failed to prepare device: {0}")]
    PrepareFailed(String),

    #[error("failed to launch burn process: {0}")]
    LaunchFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no paused job to resume")]
    NothingToResume,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
