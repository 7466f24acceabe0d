//! Error types for the stackdiff engine.
//!
//! This module provides the error hierarchy for every stage of the stack
//! lifecycle: stack file loading, graph building and validation, planning,
//! applied-state storage, provisioning backends, and plan execution.

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::{ResourceKind, ValidationIssue};

/// The main error type for the stackdiff engine.
#[derive(Debug, Error)]
pub enum StackError {
    /// Stack file and configuration errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph building and validation errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Applied-state storage errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provisioning backend errors.
    #[error("Provisioning backend error: {0}")]
    Backend(#[from] BackendError),

    /// Plan execution errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stack file and configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A stack setting is invalid.
    #[error("Invalid stack configuration: {message}")]
    ValidationError {
        /// Description of the problem.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Resource graph building and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two declarations share the same id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// A reference names an id that is not declared in the stack.
    #[error("Resource '{id}' property '{property}' references unknown resource '{target}'")]
    UnresolvedReference {
        /// Id of the referencing resource.
        id: String,
        /// Property holding the reference.
        property: String,
        /// The missing target id.
        target: String,
    },

    /// References form a cycle.
    #[error("Cyclic dependency detected: {}", format_cycle(.cycle))]
    CyclicDependency {
        /// Ids on the cycle, in reference order.
        cycle: Vec<String>,
    },

    /// The graph built but failed validation.
    #[error("{} validation issue(s) found", .issues.len())]
    ValidationFailed {
        /// Every issue found.
        issues: Vec<ValidationIssue>,
    },
}

/// Planning errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// A resource changed kind between the applied state and the declarations.
    #[error("Resource '{id}' changed kind from {before} to {after}; delete it and declare a new id instead")]
    ImmutableKindChange {
        /// Resource id.
        id: String,
        /// Kind in the applied state.
        before: ResourceKind,
        /// Kind in the new declarations.
        after: ResourceKind,
    },

    /// An update would change a property that cannot change in place.
    #[error("Property '{property}' of {kind} '{id}' is immutable and cannot be updated in place")]
    ImmutableProperty {
        /// Resource id.
        id: String,
        /// Resource kind.
        kind: ResourceKind,
        /// The immutable property.
        property: String,
    },
}

/// Applied-state storage errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The state lock could not be taken or was lost.
    #[error("State lock failed: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("Stack '{stack}' is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Stack name.
        stack: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The stored state changed since it was read.
    #[error(
        "Concurrent modification of stack '{stack}': expected revision {}, found {}",
        format_revision(.expected),
        format_revision(.found)
    )]
    ConcurrentModification {
        /// Stack name.
        stack: String,
        /// Revision the caller planned against.
        expected: Option<u64>,
        /// Revision currently stored.
        found: Option<u64>,
    },

    /// Storage backend IO error.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors reported by a provisioning backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Authentication with the provider failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected or failed the operation.
    #[error("Provider request failed: {status} - {message}")]
    Provider {
        /// HTTP-style status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Plan execution errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// An operation failed; earlier operations stay applied.
    #[error(
        "Operation {index} ({operation}) failed after {} completed operation(s): {source}",
        .completed.len()
    )]
    OperationFailed {
        /// Position of the failed operation in the plan.
        index: usize,
        /// The failed operation, e.g. `CREATE web1`.
        operation: String,
        /// Operations completed before the failure.
        completed: Vec<String>,
        /// The backend error.
        #[source]
        source: BackendError,
    },

    /// The approved plan was computed for a different declared graph.
    #[error("Approved plan was computed for graph {approved}, but the declared graph is {declared}")]
    PlanMismatch {
        /// Short hash of the graph the approved plan targets.
        approved: String,
        /// Short hash of the graph passed to the apply.
        declared: String,
    },

    /// Execution was cancelled.
    #[error("Apply cancelled at operation {index} after {} completed operation(s)", .completed.len())]
    Cancelled {
        /// Position of the operation that did not complete.
        index: usize,
        /// Operations completed before cancellation.
        completed: Vec<String>,
    },
}

/// Result type alias for stackdiff operations.
pub type Result<T> = std::result::Result<T, StackError>;

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {first}", cycle.join(" -> ")),
        None => String::from("(empty)"),
    }
}

fn format_revision(revision: &Option<u64>) -> String {
    revision.map_or_else(|| String::from("none"), |r| r.to_string())
}

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Backend(err) => err.retry_delay_secs(),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if another apply got to the stack first.
    #[must_use]
    pub const fn is_concurrent_modification(&self) -> bool {
        matches!(
            self,
            Self::State(
                StateError::ConcurrentModification { .. } | StateError::LockedByOther { .. }
            )
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl BackendError {
    /// Creates a provider error.
    #[must_use]
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network { .. } => true,
            Self::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_closes_loop() {
        let err = GraphError::CyclicDependency {
            cycle: vec![String::from("a"), String::from("b")],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_backend_retryable() {
        assert!(BackendError::network("reset").is_retryable());
        assert!(BackendError::provider(503, "unavailable").is_retryable());
        assert!(!BackendError::provider(400, "bad request").is_retryable());
        assert!(
            !BackendError::AuthenticationFailed {
                message: String::from("denied")
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_concurrent_modification_display() {
        let err = StackError::State(StateError::ConcurrentModification {
            stack: String::from("blog"),
            expected: None,
            found: Some(3),
        });
        assert!(err.is_concurrent_modification());
        assert!(err.to_string().contains("expected revision none, found 3"));
    }
}
