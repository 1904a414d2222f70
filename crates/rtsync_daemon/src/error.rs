//! Error types for the daemon.

use rtsync_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Errors that stop the daemon from starting.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The settings file could not be used.
    #[error("settings file {}: {message}", .path.display())]
    Settings {
        /// Settings file.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A required option was given neither on the command line nor in the
    /// settings file.
    #[error("missing required option {0}")]
    MissingOption(&'static str),

    /// Another process holds the pidfile.
    #[error("pidfile {} is locked by another process", .0.display())]
    PidfileLocked(PathBuf),

    /// The control socket could not be bound.
    #[error("control socket {}: {source}", .path.display())]
    ControlSocket {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The store could not be opened.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Creates a settings error.
    pub fn settings(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Settings {
            path: path.into(),
            message: message.into(),
        }
    }
}
