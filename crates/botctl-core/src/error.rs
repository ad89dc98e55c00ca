//! Error types for the botctl core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the botctl [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the supervisor's own operations.
///
/// A stale pid file is not represented here: the liveness check heals it
/// in place. Collaborator failures use [`crate::diagnostics::DiagnosticError`]
/// and never reach this type.
#[derive(Debug, Error)]
pub enum Error {
    /// The process was not alive once the launch grace period elapsed.
    #[error("{service} failed to start (pid {pid} exited); see {}", .log.display())]
    LaunchFailed {
        service: String,
        pid: u32,
        log: PathBuf,
    },

    /// A required file or a working configuration is missing.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The service id is not in the registry.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// A pid file holds something other than a usable process id.
    #[error("invalid pid file {}: {contents:?}", .path.display())]
    InvalidPidFile { path: PathBuf, contents: String },

    /// The requested log file does not exist; `available` lists the log
    /// files that do.
    #[error("log file not found: {}", .path.display())]
    LogNotFound {
        path: PathBuf,
        available: Vec<PathBuf>,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Signal delivery error
    #[error("signal error: {0}")]
    Signal(#[from] nix::errno::Errno),
}
