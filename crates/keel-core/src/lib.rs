//! # Keel Core
//!
//! The core engine of the Keel execution runtime.
//!
//! This crate holds the pieces every other layer builds on and that do not
//! depend on how handlers are described:
//!
//! - **Dependency injection**: constructor-based singleton graph ([`Container`])
//! - **Execution context**: request-scoped state and capabilities ([`ExecutionContext`])
//! - **Protocol model**: `http` methods, status codes and headers, plus query
//!   and path values and responses
//! - **Output boundaries**: [`ResponseWriter`] and [`EventSink`], implemented by transports
//!
//! The handler model, routing, interceptors and the execution pipeline live
//! in `keel-framework`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_core::{Container, TypeKey};
//! use std::sync::Arc;
//!
//! struct Config { url: String }
//! struct Database { url: String }
//!
//! let mut container = Container::new();
//! container.instance(Config { url: "mem://".into() });
//! container.provide(|config: Arc<Config>| Database { url: config.url.clone() });
//!
//! let db = container.resolve::<Database>()?;
//! ```

pub mod container;
pub mod context;
pub mod error;
pub mod http;
pub mod sink;
pub mod types;
pub mod writer;

pub use container::{Container, ConstructorSpec, Instance, Provider, TryProvider};
pub use context::{ContextBuilder, EventMessage, ExecutionContext, HttpRequest, Input, keys};
pub use error::{
    BoxError, ContainerError, ContainerResult, PublishError, StoreError, TransportError,
    TransportResult, WriteError,
};
pub use self::http::{
    HeaderMap, HeaderName, HeaderValue, HttpError, PathParams, QueryMap, Response, StatusCode, Verb,
};
pub use sink::{BoxedSink, ChannelSink, EventSink, NoopSink, PublishedEvent};
pub use types::TypeKey;
pub use writer::{BoxedWriter, RecordingWriter, ResponseWriter};

/// Re-export of `tokio_util`'s cancellation token.
pub use tokio_util::sync::CancellationToken;
/// Re-export of the request-id type.
pub use uuid::Uuid;

/// Prelude for common imports.
pub mod prelude {
    pub use super::container::Container;
    pub use super::context::{ExecutionContext, Input};
    pub use super::http::{HttpError, Response, StatusCode, Verb};
    pub use super::types::TypeKey;
}
