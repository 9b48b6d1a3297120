//! Error types for the Keel framework.
//!
//! Each pipeline stage has its own error enum. Registry errors are
//! boot-fatal; everything else is surfaced to the client through the
//! return dispatcher.

use keel_core::{ContainerError, HttpError, Verb, WriteError};
use thiserror::Error;

// =============================================================================
// Registration
// =============================================================================

/// Errors raised while registering handlers and routes.
///
/// These abort startup; they never reach request time.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The reference is a closure or function pointer, not a method path.
    #[error("`{name}` is not a method; register `Type::method` instead of a closure")]
    NotAMethod {
        /// The rejected reference's type name.
        name: &'static str,
    },

    /// The function is not defined on its receiver's type.
    #[error("`{method}` is not a method of `{owner}`")]
    ForeignMethod {
        /// The function's path.
        method: &'static str,
        /// The receiver type.
        owner: &'static str,
    },

    /// The route pattern is malformed.
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The handler declares more path values than the pattern binds.
    #[error(
        "`{method}` takes {declared} path value(s) but '{pattern}' binds only {available}"
    )]
    PathArity {
        /// The handler method.
        method: &'static str,
        /// The route pattern (or event name).
        pattern: String,
        /// Path-value parameters declared by the handler.
        declared: usize,
        /// Named segments in the pattern.
        available: usize,
    },
}

/// Result type for registration.
pub type RegistryResult<T> = Result<T, RegistryError>;

// =============================================================================
// Routing
// =============================================================================

/// Errors raised while matching a context to a handler.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    /// No route matches the verb and path.
    #[error("handler not found for {verb} {path}")]
    NotFound { verb: Verb, path: String },

    /// No consumer is registered for the event.
    #[error("handler not found for event '{name}'")]
    EventNotFound { name: String },
}

impl From<RouteError> for HttpError {
    fn from(err: RouteError) -> Self {
        HttpError::not_found(err.to_string())
    }
}

// =============================================================================
// Argument resolution
// =============================================================================

/// Errors raised while producing a handler argument.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No resolver supports the parameter.
    #[error("no resolver supports parameter #{index} of type `{ty}`")]
    Unmatched { index: usize, ty: &'static str },

    /// The context lacks the capability set the resolver needs.
    #[error("parameter #{index} requires an {capability} context")]
    MissingCapability {
        index: usize,
        capability: &'static str,
    },

    /// No path value was bound for a path-typed parameter.
    #[error("no path value bound for parameter #{index}")]
    MissingPathValue { index: usize },

    /// The body or payload could not be decoded.
    #[error("malformed body for parameter #{index}: {reason}")]
    MalformedBody { index: usize, reason: String },

    /// A custom resolver rejected the request.
    #[error("parameter #{index} rejected: {reason}")]
    Rejected { index: usize, reason: String },

    /// An injected service could not be resolved.
    #[error("service for parameter #{index} unavailable: {source}")]
    Service {
        index: usize,
        #[source]
        source: ContainerError,
    },

    /// A resolver panicked.
    #[error("argument resolution panicked: {0}")]
    Panicked(String),
}

impl ResolveError {
    /// Returns `true` for errors caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Service { .. } | Self::Panicked(_))
    }

    /// Maps the error to the response the client sees.
    pub fn to_http_error(&self) -> HttpError {
        if self.is_client_error() {
            HttpError::bad_request(self.to_string())
        } else {
            HttpError::internal("internal server error")
        }
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// Structural failures of a dynamic call.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The receiver could not be resolved from the container.
    #[error("cannot resolve receiver `{ty}`: {source}")]
    Receiver {
        ty: &'static str,
        #[source]
        source: ContainerError,
    },

    /// The argument count does not match the method signature.
    #[error("wrong arity: expected {expected} argument(s), got {got}")]
    Arity { expected: usize, got: usize },

    /// An argument does not have the declared type.
    #[error("argument #{index} is not a `{expected}`")]
    ArgumentType {
        index: usize,
        expected: &'static str,
    },

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

// =============================================================================
// Dispatch
// =============================================================================

/// Errors raised while turning a result into a response.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No response handler supports the result's type.
    #[error("no response handler for `{ty}`")]
    NoHandler { ty: &'static str },

    /// The transport did not install a response writer.
    #[error("no response writer in context")]
    NoWriter,

    /// The response could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(String),

    /// The writer rejected the response.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// A response handler panicked.
    #[error("response handler panicked: {0}")]
    Panicked(String),
}

// =============================================================================
// Pipeline
// =============================================================================

/// Failures the pipeline cannot turn into a response.
///
/// Every other failure is written to the client and reported through
/// [`Outcome::Failed`](crate::pipeline::Outcome::Failed).
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The result could not be dispatched.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Result type for pipeline execution.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_errors_map_to_client_errors() {
        let err = ResolveError::Unmatched {
            index: 2,
            ty: "Widget",
        };
        let http = err.to_http_error();
        assert_eq!(http.status(), 400);
        assert!(http.message().contains("#2"));
    }

    #[test]
    fn test_service_errors_do_not_leak() {
        let err = ResolveError::Service {
            index: 0,
            source: ContainerError::MissingConstructor {
                ty: "secret::Database",
                required_by: None,
            },
        };
        let http = err.to_http_error();
        assert_eq!(http.status(), 500);
        assert!(!http.message().contains("Database"));
    }

    #[test]
    fn test_route_error_is_not_found() {
        let http = HttpError::from(RouteError::NotFound {
            verb: Verb::GET,
            path: "/nope".into(),
        });
        assert_eq!(http.status(), 404);
        assert_eq!(http.message(), "handler not found for GET /nope");
    }
}
