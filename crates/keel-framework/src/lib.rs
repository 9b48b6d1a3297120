//! # Keel Framework
//!
//! The request-handling layer of the Keel runtime.
//!
//! This layer provides:
//! - Handler metadata built from controller methods ([`HandlerMeta`])
//! - Verb + path and event-name routing ([`Router`])
//! - Typed argument resolution ([`ArgumentResolverChain`])
//! - Ordered interceptors with a clean abort ([`InterceptorChain`], [`Flow`])
//! - Dynamic invocation through the container ([`Invoker`])
//! - Result-to-response conversion ([`ReturnDispatcher`])
//! - The per-request orchestration of all of the above ([`Pipeline`])
//!
//! It is built on `keel-core` and knows nothing about sockets; transports
//! live in `keel-runtime`.

pub mod error;
pub mod extract;
pub mod handler;
pub mod interceptor;
pub mod invoker;
pub mod pipeline;
pub mod response;
pub mod routing;

pub use error::{
    DispatchError, InvokeError, PipelineError, PipelineResult, RegistryError, RegistryResult,
    ResolveError, RouteError,
};
pub use extract::{
    ArgValue, ArgumentResolver, ArgumentResolverChain, BoxedResolver, Cancellation, Headers,
    Inject, Json, ParamKind, ParamType, Parameter, ParameterMeta, PathValue, Publisher, Query,
    RequestInfo,
};
pub use handler::{HandlerMeta, Method, MethodDescriptor};
pub use interceptor::{
    BoxedInterceptor, ChainState, Flow, Interceptor, InterceptorChain, InterceptorRef,
};
pub use invoker::Invoker;
pub use pipeline::{Outcome, Pipeline, PipelineBuilder, PipelineService};
pub use response::{
    BoxedResponseHandler, Dispatched, IntoResults, Reply, ResponseHandler, ReturnDispatcher,
    ReturnValue, write_response,
};
pub use routing::{ConsumerEntry, PathPattern, RouteEntry, RouteId, RouteMatch, Router};

/// Re-export of `async_trait` for implementing interceptors, resolvers and
/// response handlers.
pub use async_trait::async_trait;
