//! Error types for step and workflow execution
//!
//! Every failure surfaced in a [`Report`](crate::Report) is a [`StepError`]
//! tagged with the pipeline stage that produced it. Callers match on
//! [`StepError::kind`] instead of inspecting messages or downcasting.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Pipeline stage a [`StepError`] originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Fetching a release artifact failed
    Download,
    /// Unpacking a downloaded artifact failed
    Extraction,
    /// Placing binaries or creating resources failed
    Installation,
    /// Removing temporary files after installation failed
    Cleanup,
    /// Writing or applying configuration failed
    Configuration,
    /// Host or environment failure not tied to a collaborator stage
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Download => "download error",
            ErrorKind::Extraction => "extraction error",
            ErrorKind::Installation => "installation error",
            ErrorKind::Cleanup => "cleanup error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

type Cause = Arc<dyn StdError + Send + Sync>;

/// Stage-tagged error carried by failed reports
///
/// Cloning is cheap: the cause chain is shared, so the same error can sit
/// on a child report and on the enclosing workflow report.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Cause>,
    hint: Option<String>,
}

impl StepError {
    /// Create an error of the given kind with no underlying cause
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            hint: None,
        }
    }

    /// Attach the underlying cause
    pub fn caused_by(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(cause));
        self
    }

    /// Attach a human-actionable resolution hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Wrap a cause, using its message as the error message
    pub fn from_cause(kind: ErrorKind, cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::new(kind, cause.to_string()).caused_by(cause)
    }

    pub fn download(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::from_cause(ErrorKind::Download, cause)
    }

    pub fn extraction(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::from_cause(ErrorKind::Extraction, cause)
    }

    pub fn installation(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::from_cause(ErrorKind::Installation, cause)
    }

    pub fn cleanup(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::from_cause(ErrorKind::Cleanup, cause)
    }

    pub fn configuration(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::from_cause(ErrorKind::Configuration, cause)
    }

    /// Internal error without a collaborator cause
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Check the stage this error is tagged with
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Messages of the underlying cause chain, outermost first
    pub fn causes(&self) -> Vec<String> {
        let mut causes = Vec::new();
        let mut next: Option<&(dyn StdError + 'static)> =
            self.source.as_deref().map(|c| c as &(dyn StdError + 'static));
        while let Some(err) = next {
            causes.push(err.to_string());
            next = err.source();
        }
        causes
    }
}

impl Serialize for StepError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StepError", 4)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("hint", &self.hint)?;
        state.serialize_field("causes", &self.causes())?;
        state.end()
    }
}

/// Error returned when a workflow cannot be assembled
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// Workflow id is empty
    #[error("workflow id must not be empty")]
    EmptyId,

    /// Workflow has no steps
    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    /// Two steps share an id
    #[error("workflow '{workflow}' has more than one step with id '{step}'")]
    DuplicateStep { workflow: String, step: String },

    /// A step was given an empty id
    #[error("workflow '{0}' contains a step with an empty id")]
    EmptyStepId(String),
}

/// Result type for step operations
pub type Result<T> = std::result::Result<T, StepError>;
