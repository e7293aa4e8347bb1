//! Error types for the Lodestone convergence engine
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like field paths,
//! sub-resource targets, and remote diagnostics.

use thiserror::Error;

/// Default target value when no specific sub-resource is available
pub const UNKNOWN_TARGET: &str = "unknown";

/// Main error type for Lodestone operations
#[derive(Debug, Error)]
pub enum Error {
    /// Desired-state document failed validation
    #[error("invalid configuration{}: {message}", field_suffix(.field))]
    InvalidConfiguration {
        /// The offending field path (e.g., "keyManagementService.keyVaultKeyId")
        field: Option<String>,
        /// Description of what's invalid
        message: String,
    },

    /// The operation planner found a dependency cycle
    #[error("unsatisfiable dependency: {message}")]
    UnsatisfiableDependency {
        /// Description of the cycle, naming the participating targets
        message: String,
    },

    /// The remote control plane rejected a call
    #[error("remote operation failed [{target}]: {message}")]
    RemoteOperationFailed {
        /// Sub-resource target of the failed call
        target: String,
        /// Remote diagnostic, surfaced verbatim
        message: String,
    },

    /// A pending remote operation did not reach a terminal state in time
    #[error("operation timed out [{target}] after {deadline_secs}s")]
    OperationTimedOut {
        /// Sub-resource target of the pending operation
        target: String,
        /// Deadline that was exceeded, in seconds
        deadline_secs: u64,
    },

    /// The remote identifier no longer resolves (deleted out-of-band)
    #[error("resource not found: {id}")]
    ResourceNotFound {
        /// The identifier that failed to resolve
        id: String,
    },

    /// Transient remote failure (rate limiting, network); retried with backoff
    #[error("transient failure [{target}]: {message}")]
    Transient {
        /// Sub-resource target of the failed call
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(f) => format!(" for {f}"),
        None => String::new(),
    }
}

impl Error {
    /// Create a configuration error without a field path
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: None,
            message: msg.into(),
        }
    }

    /// Create a configuration error carrying the offending field path
    pub fn invalid_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: Some(field.into()),
            message: msg.into(),
        }
    }

    /// Create a planning error for an unsatisfiable dependency graph
    pub fn unsatisfiable(msg: impl Into<String>) -> Self {
        Self::UnsatisfiableDependency {
            message: msg.into(),
        }
    }

    /// Create a remote failure for a specific sub-resource target
    pub fn remote_failed(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteOperationFailed {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for a pending operation
    pub fn timed_out(target: impl Into<String>, deadline_secs: u64) -> Self {
        Self::OperationTimedOut {
            target: target.into(),
            deadline_secs,
        }
    }

    /// Create a not-found error for a remote identifier
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::ResourceNotFound { id: id.into() }
    }

    /// Create a transient error without target context
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            target: UNKNOWN_TARGET.to_string(),
            message: msg.into(),
        }
    }

    /// Create a transient error for a specific sub-resource target
    pub fn transient_for(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transient failures are retried; everything else either needs a
    /// configuration fix, already carries a remote rejection, or is a
    /// distinct signal the caller must act on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Get the field path if this error is associated with a specific field
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::InvalidConfiguration { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Get the sub-resource target if this error has one
    pub fn target(&self) -> Option<&str> {
        match self {
            Error::RemoteOperationFailed { target, .. } => Some(target),
            Error::OperationTimedOut { target, .. } => Some(target),
            Error::Transient { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
