//! # Keel
//!
//! An execution runtime that keeps every step of request handling explicit.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────────────────────────────────────────┐
//! │ Transport │──▶│ Pipeline                                                     │
//! │ (adapter) │   │  route ─▶ pre_handle ─▶ resolve args ─▶ invoke ─▶ dispatch  │──▶ ResponseWriter
//! └───────────┘   │            (in order)                               │       │
//!                 │  after_completion (reverse, always) ◀── post_handle ◀┘      │
//!                 └──────────────────────────────────────────────────────────────┘
//!                                 │ receivers and Inject<T>
//!                                 ▼
//!                            Container (singletons)
//! ```
//!
//! - **Container**: constructor-based singletons, resolved from the dependency graph
//! - **Router**: verb + path patterns and event names mapped to controller methods
//! - **Resolvers**: turn the request context into typed method arguments
//! - **Interceptors**: ordered pre/post hooks with a clean abort and guaranteed cleanup
//! - **Dispatcher**: converts results, errors first, into responses
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! struct Greeter;
//!
//! impl Greeter {
//!     async fn hello(self: Arc<Self>, name: PathValue) -> String {
//!         format!("hello, {}", name.as_str())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut app = Keel::builder()
//!         .provide(|| Greeter)
//!         .route(Verb::GET, "/hello/:name", Greeter::hello)
//!         .build()?;
//!
//!     let (transport, client) = LocalTransport::new("local", 64);
//!     app.mount(transport);
//!     assert_eq!(client.get("/hello/keel").await?.body_text(), "hello, keel");
//!
//!     app.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: `keel.toml` configuration files
//! - `yaml-config`: `keel.yaml` configuration files
//! - `json-log`: JSON log output

pub use keel_core as core;
pub use keel_framework as framework;
pub use keel_runtime as runtime;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use std::sync::Arc;

    // Boot and lifecycle
    pub use keel_runtime::{
        App, BootError, ConfigLoader, Keel, KeelConfig, LocalClient, LocalRequest,
        LocalTransport, Transport,
    };

    // Protocol model
    pub use keel_core::{
        Container, ExecutionContext, HttpError, Response, StatusCode, TypeKey, Verb,
    };

    // Handler parameters
    pub use keel_framework::{
        Cancellation, Headers, Inject, Json, PathValue, Publisher, Query, RequestInfo,
    };

    // Extension points
    pub use keel_framework::{
        ArgumentResolver, Flow, Interceptor, InterceptorRef, ParameterMeta, ResponseHandler,
        ReturnValue, async_trait,
    };
}
