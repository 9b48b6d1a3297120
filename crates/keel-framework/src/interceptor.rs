//! Interceptors: ordered hooks around handler execution.
//!
//! Each interceptor has three hooks:
//!
//! - [`pre_handle`](Interceptor::pre_handle) runs before argument
//!   resolution and invocation, in registration order (global interceptors
//!   first, then route interceptors). It returns a [`Flow`]: continue, or
//!   abort cleanly. Any error short-circuits the remaining pre-hooks.
//! - [`post_handle`](Interceptor::post_handle) runs in reverse order after
//!   the handler's result was dispatched successfully.
//! - [`after_completion`](Interceptor::after_completion) always runs, in
//!   reverse order, for every interceptor whose `pre_handle` ran, no matter
//!   which phase failed.
//!
//! Aborting is not an error. An interceptor that aborts is expected to have
//! written the response itself. A panicking `pre_handle` counts as a failure
//! of that hook; panics in the other hooks are logged and skipped.
//!
//! ```rust,ignore
//! struct RequireToken;
//!
//! #[async_trait]
//! impl Interceptor for RequireToken {
//!     async fn pre_handle(&self, ctx: &ExecutionContext, _meta: &HandlerMeta) -> anyhow::Result<Flow> {
//!         if ctx.headers().get("authorization").is_some() {
//!             return Ok(Flow::Continue);
//!         }
//!         write_response(ctx, Response::new(StatusCode::UNAUTHORIZED)).await?;
//!         Ok(Flow::Abort)
//!     }
//! }
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use keel_core::{Container, ContainerError, ContainerResult, ExecutionContext, Instance, TypeKey};
use tracing::{error, trace};

use crate::handler::HandlerMeta;
use crate::invoker::panic_message;

/// Result of a pre-hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Proceed to the next interceptor, then the handler.
    Continue,
    /// Stop here without failing.
    Abort,
}

/// Hooks around handler execution.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Runs before the handler.
    async fn pre_handle(&self, _ctx: &ExecutionContext, _meta: &HandlerMeta) -> anyhow::Result<Flow> {
        Ok(Flow::Continue)
    }

    /// Runs after a successful dispatch.
    async fn post_handle(&self, _ctx: &ExecutionContext, _meta: &HandlerMeta) {}

    /// Always runs once `pre_handle` has run.
    async fn after_completion(
        &self,
        _ctx: &ExecutionContext,
        _meta: &HandlerMeta,
        _error: Option<&anyhow::Error>,
    ) {
    }

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Type alias for a shared interceptor.
pub type BoxedInterceptor = Arc<dyn Interceptor>;

// =============================================================================
// InterceptorRef
// =============================================================================

/// An interceptor registration: an instance, or a type to resolve from the
/// container when the pipeline is assembled.
#[derive(Clone)]
pub enum InterceptorRef {
    Instance(BoxedInterceptor),
    Resolve {
        key: TypeKey,
        cast: fn(Instance) -> Option<BoxedInterceptor>,
    },
}

impl InterceptorRef {
    /// Registers a ready-made interceptor.
    pub fn instance<I: Interceptor>(interceptor: I) -> Self {
        Self::Instance(Arc::new(interceptor))
    }

    /// Registers a shared interceptor.
    pub fn shared(interceptor: BoxedInterceptor) -> Self {
        Self::Instance(interceptor)
    }

    /// Registers `I`, to be resolved from the container.
    pub fn resolve<I: Interceptor>() -> Self {
        Self::Resolve {
            key: TypeKey::of::<I>(),
            cast: |instance| {
                instance
                    .downcast::<I>()
                    .ok()
                    .map(|interceptor| interceptor as BoxedInterceptor)
            },
        }
    }

    /// Produces the interceptor, resolving it if needed.
    pub fn materialize(&self, container: &Container) -> ContainerResult<BoxedInterceptor> {
        match self {
            Self::Instance(interceptor) => Ok(Arc::clone(interceptor)),
            Self::Resolve { key, cast } => {
                let instance = container.resolve_key(*key)?;
                cast(instance).ok_or(ContainerError::TypeMismatch { ty: key.name() })
            }
        }
    }
}

impl fmt::Debug for InterceptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(interceptor) => f.debug_tuple("Instance").field(&interceptor.name()).finish(),
            Self::Resolve { key, .. } => f.debug_tuple("Resolve").field(key).finish(),
        }
    }
}

// =============================================================================
// InterceptorChain
// =============================================================================

/// Where a chain is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Pre-hooks have not finished.
    Pending,
    /// Every pre-hook continued.
    Invoking,
    /// A pre-hook aborted.
    Aborted,
    /// A pre-hook failed.
    Failed,
}

/// The per-request interceptor list: global, then route-specific.
pub struct InterceptorChain {
    interceptors: Vec<BoxedInterceptor>,
    entered: usize,
    state: ChainState,
}

impl InterceptorChain {
    pub fn new(global: &[BoxedInterceptor], route: &[BoxedInterceptor]) -> Self {
        Self {
            interceptors: global.iter().chain(route).cloned().collect(),
            entered: 0,
            state: ChainState::Pending,
        }
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs pre-hooks in order until one aborts or fails.
    pub async fn pre_handle(
        &mut self,
        ctx: &ExecutionContext,
        meta: &HandlerMeta,
    ) -> anyhow::Result<Flow> {
        for interceptor in &self.interceptors {
            self.entered += 1;
            trace!(interceptor = interceptor.name(), "pre_handle");
            let hook = AssertUnwindSafe(interceptor.pre_handle(ctx, meta)).catch_unwind();
            let result = hook.await.unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "interceptor `{}` panicked: {}",
                    interceptor.name(),
                    panic_message(panic.as_ref())
                ))
            });
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Abort) => {
                    self.state = ChainState::Aborted;
                    return Ok(Flow::Abort);
                }
                Err(err) => {
                    self.state = ChainState::Failed;
                    return Err(err);
                }
            }
        }
        self.state = ChainState::Invoking;
        Ok(Flow::Continue)
    }

    /// Runs post-hooks in reverse order. Does nothing unless every
    /// pre-hook continued.
    pub async fn post_handle(&self, ctx: &ExecutionContext, meta: &HandlerMeta) {
        if self.state != ChainState::Invoking {
            return;
        }
        for interceptor in self.entered_rev() {
            trace!(interceptor = interceptor.name(), "post_handle");
            let hook = AssertUnwindSafe(interceptor.post_handle(ctx, meta)).catch_unwind();
            if let Err(panic) = hook.await {
                error!(
                    interceptor = interceptor.name(),
                    "post_handle panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Runs cleanup hooks in reverse order for every entered interceptor.
    pub async fn after_completion(
        &self,
        ctx: &ExecutionContext,
        meta: &HandlerMeta,
        error: Option<&anyhow::Error>,
    ) {
        for interceptor in self.entered_rev() {
            trace!(interceptor = interceptor.name(), "after_completion");
            let hook = AssertUnwindSafe(interceptor.after_completion(ctx, meta, error)).catch_unwind();
            if let Err(panic) = hook.await {
                error!(
                    interceptor = interceptor.name(),
                    "after_completion panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    fn entered_rev(&self) -> impl Iterator<Item = &BoxedInterceptor> {
        self.interceptors[..self.entered].iter().rev()
    }
}
