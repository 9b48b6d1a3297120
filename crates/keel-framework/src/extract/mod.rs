//! Argument resolution.
//!
//! For every declared parameter of a handler, the [`ArgumentResolverChain`]
//! asks its resolvers, in registration order, whether they support the
//! parameter. The first one that does produces the value. A parameter no
//! resolver supports fails with [`ResolveError::Unmatched`].
//!
//! The chain itself is protocol-agnostic: it dispatches on the declared
//! type only. Resolvers decide how to read the context (path values, query,
//! JSON body, event payload, container lookups).
//!
//! # Path binding
//!
//! Path-typed parameters are bound by position, not by name: the Nth
//! [`PathValue`] in the signature receives the Nth named segment of the
//! matched route. [`ParameterMeta::bind`] computes this once per request.

mod resolvers;
mod types;

pub use resolvers::{
    ContextResolver, EventMessageResolver, HeadersResolver, JsonResolver, PathValueResolver,
    QueryResolver, ServiceResolver,
};
pub use types::{
    ArgValue, Cancellation, Headers, Inject, Json, JsonDecoder, ParamKind, ParamType, Parameter,
    PathValue, Publisher, Query, RequestInfo, ServiceSlot,
};

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{Container, ExecutionContext, TypeKey};
use tracing::trace;

use crate::error::ResolveError;

// =============================================================================
// ParameterMeta
// =============================================================================

/// One declared parameter, as seen by resolvers for a specific request.
#[derive(Debug, Clone)]
pub struct ParameterMeta {
    /// Position in the signature, receiver excluded.
    pub index: usize,
    /// Declared type.
    pub ty: ParamType,
    /// The matched path key, for path-typed parameters.
    pub path_key: Option<String>,
}

impl ParameterMeta {
    /// Builds the per-request parameter list from a handler's declared types
    /// and the matched route's path keys.
    ///
    /// The Nth path-typed parameter gets the Nth key. Surplus path-typed
    /// parameters get no key.
    pub fn bind(params: &[ParamType], path_keys: &[String]) -> Vec<Self> {
        let mut keys = path_keys.iter();
        params
            .iter()
            .enumerate()
            .map(|(index, ty)| Self {
                index,
                ty: *ty,
                path_key: if ty.is_path_value() {
                    keys.next().cloned()
                } else {
                    None
                },
            })
            .collect()
    }

    /// Returns `true` if the declared type is `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.ty.key() == TypeKey::of::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.ty.key().name()
    }
}

// =============================================================================
// ArgumentResolver
// =============================================================================

/// Produces one kind of handler argument from the execution context.
#[async_trait]
pub trait ArgumentResolver: Send + Sync {
    /// Returns `true` if this resolver can produce `param`.
    fn supports(&self, param: &ParameterMeta) -> bool;

    /// Produces the argument. Only called when [`supports`](Self::supports)
    /// returned `true`.
    async fn resolve(
        &self,
        ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError>;
}

/// Type alias for a shared resolver.
pub type BoxedResolver = Arc<dyn ArgumentResolver>;

// =============================================================================
// ArgumentResolverChain
// =============================================================================

/// Ordered list of resolvers. First supporting resolver wins.
#[derive(Clone, Default)]
pub struct ArgumentResolverChain {
    resolvers: Vec<BoxedResolver>,
}

impl ArgumentResolverChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain with the built-in resolvers, in their fixed order.
    pub fn with_defaults(container: Arc<Container>) -> Self {
        let mut chain = Self::new();
        chain
            .push(PathValueResolver)
            .push(QueryResolver)
            .push(HeadersResolver)
            .push(JsonResolver)
            .push(EventMessageResolver)
            .push(ServiceResolver::new(container))
            .push(ContextResolver);
        chain
    }

    /// Appends a resolver after every existing one.
    pub fn push<R: ArgumentResolver + 'static>(&mut self, resolver: R) -> &mut Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    /// Appends a shared resolver.
    pub fn push_shared(&mut self, resolver: BoxedResolver) -> &mut Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// The first resolver supporting `param`.
    pub fn find(&self, param: &ParameterMeta) -> Option<&BoxedResolver> {
        self.resolvers.iter().find(|resolver| resolver.supports(param))
    }

    /// Resolves one parameter.
    pub async fn resolve(
        &self,
        ctx: &ExecutionContext,
        param: &ParameterMeta,
    ) -> Result<ArgValue, ResolveError> {
        let resolver = self.find(param).ok_or(ResolveError::Unmatched {
            index: param.index,
            ty: param.type_name(),
        })?;
        trace!(index = param.index, ty = param.type_name(), "Resolving argument");
        resolver.resolve(ctx, param).await
    }

    /// Resolves every parameter in order, stopping at the first failure.
    pub async fn resolve_all(
        &self,
        ctx: &ExecutionContext,
        params: &[ParameterMeta],
    ) -> Result<Vec<ArgValue>, ResolveError> {
        let mut args = Vec::with_capacity(params.len());
        for param in params {
            args.push(self.resolve(ctx, param).await?);
        }
        Ok(args)
    }
}
