//! Runtime error types.

use keel_core::{ContainerError, TransportError};
use keel_framework::RegistryError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that abort startup. None of these can occur at request time.
#[derive(Error, Debug)]
pub enum BootError {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A route or consumer declaration was rejected.
    #[error("invalid registration: {0}")]
    Registry(#[from] RegistryError),

    /// A controller could not be constructed during warm-up.
    #[error("warm-up failed: {0}")]
    Container(#[from] ContainerError),

    /// An interceptor marker could not be resolved from the container.
    #[error("interceptor could not be resolved: {0}")]
    Interceptor(#[source] ContainerError),
}

impl BootError {
    /// The container error behind this failure, if any.
    pub fn container_error(&self) -> Option<&ContainerError> {
        match self {
            Self::Container(err) | Self::Interceptor(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors that can occur while serving.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A mounted transport failed.
    #[error("transport '{name}' failed: {source}")]
    Transport {
        name: String,
        #[source]
        source: TransportError,
    },

    /// A transport task panicked or was cancelled.
    #[error("transport '{name}' task ended abnormally: {reason}")]
    TransportTask { name: String, reason: String },
}

/// Result type for boot operations.
pub type BootResult<T> = Result<T, BootError>;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
