//! Resource manager errors

use nodeforge_workflow::{ErrorKind, Interrupt, StepError};
use std::io;
use thiserror::Error;

/// Error returned by [`ResourceManager`](crate::ResourceManager) operations
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Helm {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid component '{component}': {reason}")]
    InvalidComponent { component: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl ResourceError {
    pub fn into_step_error(self, kind: ErrorKind) -> StepError {
        StepError::from_cause(kind, self)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ResourceError::NotFound { .. } => true,
            ResourceError::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

impl From<Interrupt> for ResourceError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => ResourceError::Cancelled,
            Interrupt::DeadlineExceeded => ResourceError::Timeout("step deadline".to_string()),
        }
    }
}

/// Result type for resource operations
pub type Result<T> = std::result::Result<T, ResourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ResourceError::NotFound {
            kind: "service",
            name: "traefik/traefik".to_string(),
        };
        assert_eq!(err.to_string(), "service 'traefik/traefik' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_into_step_error() {
        let err = ResourceError::Timeout("deployment kube-system/coredns".to_string())
            .into_step_error(ErrorKind::Installation);
        assert!(err.is(ErrorKind::Installation));
        assert_eq!(err.message(), "timed out waiting for deployment kube-system/coredns");
    }

    #[test]
    fn test_deadline_maps_to_timeout() {
        assert!(matches!(
            ResourceError::from(Interrupt::DeadlineExceeded),
            ResourceError::Timeout(_)
        ));
    }
}
