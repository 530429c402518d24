//! Installer collaborator errors

use nodeforge_workflow::{ErrorKind, Interrupt, StepError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error returned by [`Installable`](crate::Installable) operations
#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Host environment prevents the operation; `hint` says how to fix it
    #[error("{message}")]
    Environment { message: String, hint: String },

    #[error("{0}")]
    Failed(String),
}

impl InstallerError {
    /// `map_err` adapter attaching the path an I/O error happened at
    pub fn io(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| InstallerError::Io { path, source }
    }

    /// Tag this error with the stage it happened in
    ///
    /// Environment errors are not stage failures: they map to
    /// [`ErrorKind::Internal`] and carry their hint.
    pub fn into_step_error(self, kind: ErrorKind) -> StepError {
        match self {
            InstallerError::Environment { message, hint } => {
                StepError::new(ErrorKind::Internal, message).with_hint(hint)
            }
            other => StepError::from_cause(kind, other),
        }
    }
}

impl From<Interrupt> for InstallerError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => InstallerError::Cancelled,
            Interrupt::DeadlineExceeded => InstallerError::DeadlineExceeded,
        }
    }
}

/// Result type for installer operations
pub type Result<T> = std::result::Result<T, InstallerError>;
