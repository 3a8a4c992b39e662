//! Error types for tidepool
//!
//! Every error names the instance it concerns and the operation that failed,
//! so a failing test run reports what went wrong without extra logging.
//! Collaborator failures (cluster, builder, fault sidecar, proxy) are wrapped
//! with the instance and operation they happened under.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific instance is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Boxed source error from an external collaborator
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for tidepool operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Operation invoked outside the lifecycle states that allow it
    #[error("{operation} is not allowed for instance {instance} in state {state}")]
    StateViolation {
        /// Name of the instance
        instance: String,
        /// Operation that was attempted
        operation: String,
        /// Lifecycle state the instance was in
        state: String,
    },

    /// Invalid input (bad port, duplicate registration, missing fields)
    #[error("validation error for {instance}: {message}")]
    Validation {
        /// Name of the instance
        instance: String,
        /// Description of what's invalid
        message: String,
    },

    /// Failure reported by an external collaborator
    #[error("{operation} failed for {instance}: {source}")]
    Collaborator {
        /// Name of the instance (or resource) the call was made for
        instance: String,
        /// Operation that was in flight
        operation: String,
        /// Underlying cause
        #[source]
        source: BoxError,
    },

    /// A wait exceeded its deadline or was cancelled
    #[error("timed out after {elapsed:?} waiting for {operation} on {instance}")]
    Timeout {
        /// Name of the instance
        instance: String,
        /// What was being waited for
        operation: String,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// Sidecar/parent relationship rule violated
    #[error("invariant violation for {instance}: {message}")]
    Invariant {
        /// Name of the instance
        instance: String,
        /// Which rule was violated
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a state violation error
    pub fn state_violation(
        instance: impl Into<String>,
        operation: impl std::fmt::Display,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::StateViolation {
            instance: instance.into(),
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a validation error without instance context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            instance: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for an instance
    pub fn validation_for(instance: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            instance: instance.into(),
            message: msg.into(),
        }
    }

    /// Wrap a collaborator failure with instance and operation context
    pub fn collaborator(
        instance: impl Into<String>,
        operation: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Collaborator {
            instance: instance.into(),
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(
        instance: impl Into<String>,
        operation: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self::Timeout {
            instance: instance.into(),
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create an invariant violation error
    pub fn invariant(instance: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invariant {
            instance: instance.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Get the instance name if this error is associated with one
    pub fn instance(&self) -> Option<&str> {
        match self {
            Error::StateViolation { instance, .. }
            | Error::Validation { instance, .. }
            | Error::Collaborator { instance, .. }
            | Error::Timeout { instance, .. }
            | Error::Invariant { instance, .. } => Some(instance),
            Error::Kube { .. } | Error::Serialization { .. } | Error::Internal { .. } => None,
        }
    }

    /// True for lifecycle state violations
    pub fn is_state_violation(&self) -> bool {
        matches!(self, Error::StateViolation { .. })
    }

    /// True for timeouts, including a timeout wrapped by a collaborator error
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Collaborator { source, .. } => source
                .downcast_ref::<Error>()
                .is_some_and(Error::is_timeout),
            _ => false,
        }
    }

    /// True if the error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}
