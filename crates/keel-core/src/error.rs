//! Unified error types for the Keel core.
//!
//! This module provides the error types shared by every layer built on top
//! of the core. Framework-level errors (routing, argument resolution,
//! dispatch) are defined in `keel-framework`.

use thiserror::Error;

/// A boxed, thread-safe error, as produced by fallible constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Container Errors
// =============================================================================

/// Errors raised while resolving the dependency graph.
///
/// A missing constructor and a dependency cycle are deliberately distinct
/// variants so callers can tell a misconfigured graph from an impossible one.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// No constructor is registered for a type the graph needs.
    #[error("no constructor registered for `{ty}`{}", required_by_suffix(.required_by))]
    MissingConstructor {
        /// The type that could not be built.
        ty: &'static str,
        /// The type whose constructor declared the dependency, if any.
        required_by: Option<&'static str>,
    },

    /// The type is already on the current resolution stack.
    #[error("circular dependency: {}", .path.join(" -> "))]
    Cycle {
        /// The cycle, starting and ending with the same type.
        path: Vec<&'static str>,
    },

    /// The constructor ran and returned an error.
    #[error("constructor for `{ty}` failed: {source}")]
    Construction {
        /// The type whose constructor failed.
        ty: &'static str,
        /// The constructor's error.
        #[source]
        source: BoxError,
    },

    /// A stored instance did not have the requested type.
    #[error("instance registered for `{ty}` has an unexpected type")]
    TypeMismatch {
        /// The requested type.
        ty: &'static str,
    },
}

fn required_by_suffix(required_by: &Option<&'static str>) -> String {
    required_by
        .map(|owner| format!(" (required by `{owner}`)"))
        .unwrap_or_default()
}

impl ContainerError {
    /// Returns `true` for the missing-constructor class.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingConstructor { .. })
    }

    /// Returns `true` for the circular-dependency class.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle { .. })
    }
}

// =============================================================================
// Context Errors
// =============================================================================

/// Errors from the open key-value store on an execution context.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// User code tried to write a key owned by the runtime.
    #[error("context key '{0}' is reserved")]
    Reserved(String),
}

/// Errors from a response writer.
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    /// A response was already written for this request.
    #[error("response already written")]
    AlreadyWritten,

    /// The peer is gone.
    #[error("response channel closed")]
    Closed,
}

/// Errors from an event sink.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// The receiving side of the sink was dropped.
    #[error("event sink closed while publishing '{event}'")]
    Closed {
        /// The event that could not be delivered.
        event: String,
    },
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors that can occur in transport adapters.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The transport stopped accepting work.
    #[error("transport '{transport}' closed")]
    Closed {
        /// The transport's name.
        transport: String,
    },

    /// The reply for a request was dropped before it was sent.
    #[error("no reply for request: {0}")]
    NoReply(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_constructor_message_names_owner() {
        let err = ContainerError::MissingConstructor {
            ty: "Db",
            required_by: Some("UserService"),
        };
        assert_eq!(
            err.to_string(),
            "no constructor registered for `Db` (required by `UserService`)"
        );
        assert!(err.is_missing());
        assert!(!err.is_cycle());
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ContainerError::Cycle {
            path: vec!["A", "B", "A"],
        };
        assert_eq!(err.to_string(), "circular dependency: A -> B -> A");
        assert!(err.is_cycle());
    }
}
