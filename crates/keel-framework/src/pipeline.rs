//! The execution pipeline.
//!
//! [`Pipeline::execute`] runs one unit of work through the fixed stage
//! order:
//!
//! ```text
//! match ─▶ bind params ─▶ pre_handle* ─▶ resolve args ─▶ invoke ─▶ dispatch ─▶ post_handle* ─▶ after_completion*
//!   │                          │               │             │          │                              ▲
//!   └─ 404 ─▶ dispatch         └── abort ──────┴─────────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! Stages run strictly sequentially. Failures short-circuit the forward
//! stages and are dispatched through the error-priority rule; cleanup
//! hooks always run for every interceptor that was entered. A panic in any
//! stage is caught and becomes that stage's error.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use keel_core::{Container, ContainerResult, ExecutionContext, HttpError, Response, StatusCode};
use tower::Service;
use tracing::{Instrument, Level, debug, error, span, warn};

use crate::error::{DispatchError, PipelineError, PipelineResult, ResolveError};
use crate::extract::{ArgValue, ArgumentResolver, ArgumentResolverChain, ParameterMeta};
use crate::interceptor::{BoxedInterceptor, Flow, InterceptorChain, InterceptorRef};
use crate::invoker::{Invoker, panic_message};
use crate::response::{Dispatched, ResponseHandler, ReturnDispatcher, ReturnValue};
use crate::routing::{RouteId, Router};

/// How a unit of work ended.
#[derive(Debug)]
pub enum Outcome {
    /// The handler ran and its result (if any) was written.
    Completed,
    /// An interceptor aborted.
    Aborted,
    /// A failure was written as an error response.
    Failed(anyhow::Error),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Orchestrates routing, interceptors, argument resolution, invocation and
/// dispatch for every request.
pub struct Pipeline {
    router: Arc<Router>,
    resolvers: ArgumentResolverChain,
    invoker: Invoker,
    dispatcher: ReturnDispatcher,
    global: Vec<BoxedInterceptor>,
    scoped: HashMap<RouteId, Vec<BoxedInterceptor>>,
}

impl Pipeline {
    /// Starts assembling a pipeline over a finished router and container.
    pub fn builder(router: Router, container: Arc<Container>) -> PipelineBuilder {
        PipelineBuilder::new(router, container)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn container(&self) -> &Arc<Container> {
        self.invoker.container()
    }

    /// Runs one unit of work.
    ///
    /// Returns `Err` only when no response could be dispatched; a `500`
    /// fallback has been attempted by then.
    pub async fn execute(&self, ctx: Arc<ExecutionContext>) -> PipelineResult<Outcome> {
        let span = span!(
            Level::DEBUG,
            "execute",
            request = %ctx.id(),
            target = %ctx.target()
        );
        self.run(&ctx).instrument(span).await
    }

    async fn run(&self, ctx: &ExecutionContext) -> PipelineResult<Outcome> {
        let matched = match self.router.match_context(ctx) {
            Ok(matched) => matched,
            Err(err) => {
                debug!("{err}");
                let results = vec![ReturnValue::error(HttpError::from(err))];
                return self.finish_unrouted(results, ctx).await;
            }
        };
        let meta = Arc::clone(matched.meta);
        ctx.set_route_match(matched.params, matched.path_keys);
        let params = ParameterMeta::bind(meta.params(), &ctx.path_keys());

        let scoped = self.scoped.get(&matched.id).map(Vec::as_slice).unwrap_or_default();
        let mut chain = InterceptorChain::new(&self.global, scoped);

        let results = match chain.pre_handle(ctx, &meta).await {
            Ok(Flow::Abort) => {
                debug!("Aborted by interceptor");
                chain.after_completion(ctx, &meta, None).await;
                return Ok(Outcome::Aborted);
            }
            Err(err) => vec![ReturnValue::Error(err)],
            Ok(Flow::Continue) => match self.resolve_args(ctx, &params).await {
                Err(err) => {
                    if !err.is_client_error() {
                        error!("Argument resolution failed: {err}");
                    }
                    vec![ReturnValue::error(err.to_http_error())]
                }
                Ok(args) => match self.invoker.invoke(&meta, args).await {
                    Ok(results) => results,
                    Err(err) => vec![ReturnValue::error(err)],
                },
            },
        };

        let dispatched = self.dispatch(&results, ctx).await;
        let failure = results.iter().find_map(ReturnValue::as_error);
        let dispatch_failure = dispatched
            .as_ref()
            .err()
            .map(|err| anyhow::Error::new(err.clone()));

        if failure.is_none() && dispatch_failure.is_none() {
            chain.post_handle(ctx, &meta).await;
        }
        chain
            .after_completion(ctx, &meta, failure.or(dispatch_failure.as_ref()))
            .await;

        self.conclude(dispatched, results, ctx).await
    }

    /// Dispatches results for a context that matched no route. No
    /// interceptor has run, so there is nothing to unwind.
    async fn finish_unrouted(
        &self,
        results: Vec<ReturnValue>,
        ctx: &ExecutionContext,
    ) -> PipelineResult<Outcome> {
        let dispatched = self.dispatch(&results, ctx).await;
        self.conclude(dispatched, results, ctx).await
    }

    async fn resolve_args(
        &self,
        ctx: &ExecutionContext,
        params: &[ParameterMeta],
    ) -> Result<Vec<ArgValue>, ResolveError> {
        AssertUnwindSafe(self.resolvers.resolve_all(ctx, params))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ResolveError::Panicked(panic_message(panic.as_ref()))))
    }

    async fn dispatch(
        &self,
        results: &[ReturnValue],
        ctx: &ExecutionContext,
    ) -> Result<Dispatched, DispatchError> {
        AssertUnwindSafe(self.dispatcher.handle(results, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic.as_ref()))))
    }

    async fn conclude(
        &self,
        dispatched: Result<Dispatched, DispatchError>,
        results: Vec<ReturnValue>,
        ctx: &ExecutionContext,
    ) -> PipelineResult<Outcome> {
        if let Err(err) = dispatched {
            error!("Dispatch failed: {err}");
            write_fallback(ctx).await;
            return Err(PipelineError::Dispatch(err));
        }

        Ok(results
            .into_iter()
            .find_map(ReturnValue::into_error)
            .map(Outcome::Failed)
            .unwrap_or(Outcome::Completed))
    }
}

async fn write_fallback(ctx: &ExecutionContext) {
    let Some(writer) = ctx.response_writer() else {
        return;
    };
    if writer.is_written() {
        return;
    }
    if let Err(err) = writer.write(Response::new(StatusCode::INTERNAL_SERVER_ERROR)).await {
        warn!("Failed to write fallback response: {err}");
    }
}

// =============================================================================
// PipelineBuilder
// =============================================================================

/// Assembles a [`Pipeline`]: built-in resolvers and response handlers
/// first, custom ones after, interceptors resolved from the container.
pub struct PipelineBuilder {
    router: Router,
    container: Arc<Container>,
    interceptors: Vec<InterceptorRef>,
    resolvers: Vec<Arc<dyn ArgumentResolver>>,
    response_handlers: Vec<Arc<dyn ResponseHandler>>,
    expose_error_details: bool,
}

impl PipelineBuilder {
    fn new(router: Router, container: Arc<Container>) -> Self {
        Self {
            router,
            container,
            interceptors: Vec::new(),
            resolvers: Vec::new(),
            response_handlers: Vec::new(),
            expose_error_details: false,
        }
    }

    /// Adds a global interceptor.
    pub fn interceptor(mut self, interceptor: InterceptorRef) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Adds a custom argument resolver after the built-in ones.
    pub fn resolver(mut self, resolver: Arc<dyn ArgumentResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Adds a custom response handler after the built-in ones.
    pub fn response_handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.response_handlers.push(handler);
        self
    }

    /// Sends untyped error messages to clients.
    pub fn expose_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }

    /// Resolves interceptor markers and builds the pipeline.
    pub fn build(self) -> ContainerResult<Pipeline> {
        let container = self.container;

        let global = self
            .interceptors
            .iter()
            .map(|interceptor| interceptor.materialize(&container))
            .collect::<ContainerResult<Vec<_>>>()?;

        let mut scoped = HashMap::new();
        let ids = (0..self.router.routes().len())
            .map(RouteId::Http)
            .chain((0..self.router.consumers().len()).map(RouteId::Event));
        for id in ids {
            let refs = self.router.interceptors(id);
            if refs.is_empty() {
                continue;
            }
            let resolved = refs
                .iter()
                .map(|interceptor| interceptor.materialize(&container))
                .collect::<ContainerResult<Vec<_>>>()?;
            scoped.insert(id, resolved);
        }

        let mut resolvers = ArgumentResolverChain::with_defaults(Arc::clone(&container));
        for resolver in self.resolvers {
            resolvers.push_shared(resolver);
        }

        let mut dispatcher = ReturnDispatcher::with_defaults(self.expose_error_details);
        for handler in self.response_handlers {
            dispatcher.push_shared(handler);
        }

        debug!(
            routes = self.router.len(),
            interceptors = global.len(),
            resolvers = resolvers.len(),
            response_handlers = dispatcher.len(),
            "Pipeline assembled"
        );

        Ok(Pipeline {
            router: Arc::new(self.router),
            resolvers,
            invoker: Invoker::new(container),
            dispatcher,
            global,
            scoped,
        })
    }
}

// =============================================================================
// PipelineService
// =============================================================================

/// A tower [`Service`] over a shared [`Pipeline`].
///
/// Lets transports stack ordinary tower layers (timeouts, concurrency
/// limits) in front of the pipeline.
#[derive(Clone)]
pub struct PipelineService {
    pipeline: Arc<Pipeline>,
}

impl PipelineService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

impl Service<Arc<ExecutionContext>> for PipelineService {
    type Response = Outcome;
    type Error = PipelineError;
    type Future = BoxFuture<'static, PipelineResult<Outcome>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: Arc<ExecutionContext>) -> Self::Future {
        let pipeline = Arc::clone(&self.pipeline);
        async move { pipeline.execute(ctx).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Json, PathValue};
    use crate::handler::HandlerMeta;
    use crate::interceptor::Interceptor;
    use crate::response::IntoResults;
    use async_trait::async_trait;
    use keel_core::{RecordingWriter, Verb};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Unrenderable;

    impl IntoResults for Unrenderable {
        fn into_results(self) -> Vec<ReturnValue> {
            vec![ReturnValue::value(self)]
        }
    }

    struct UserController {
        log: Log,
    }

    impl UserController {
        async fn pair(self: Arc<Self>, x: PathValue, y: PathValue) -> String {
            self.log.lock().push("handler".into());
            format!("x={},y={}", x.as_str(), y.as_str())
        }

        async fn create(self: Arc<Self>, body: Json<Value>) -> (Json<Value>, Result<(), HttpError>) {
            self.log.lock().push("handler".into());
            (
                Json(json!({"created": body.0})),
                Err(HttpError::new(StatusCode::CONFLICT, "duplicate user")),
            )
        }

        async fn broken(self: Arc<Self>) -> Unrenderable {
            Unrenderable
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        Abort,
        Panic,
    }

    struct Tracer {
        name: &'static str,
        fault: Option<Fault>,
        log: Log,
    }

    #[async_trait]
    impl Interceptor for Tracer {
        async fn pre_handle(&self, ctx: &ExecutionContext, _meta: &HandlerMeta) -> anyhow::Result<Flow> {
            self.log.lock().push(format!("pre:{}", self.name));
            match self.fault {
                Some(Fault::Abort) => {
                    crate::response::write_response(ctx, Response::new(StatusCode::UNAUTHORIZED)).await?;
                    Ok(Flow::Abort)
                }
                Some(Fault::Panic) => panic!("{} lost its session store", self.name),
                None => Ok(Flow::Continue),
            }
        }

        async fn post_handle(&self, _ctx: &ExecutionContext, _meta: &HandlerMeta) {
            self.log.lock().push(format!("post:{}", self.name));
        }

        async fn after_completion(
            &self,
            _ctx: &ExecutionContext,
            _meta: &HandlerMeta,
            error: Option<&anyhow::Error>,
        ) {
            let mark = if error.is_some() { "!" } else { "" };
            self.log.lock().push(format!("after{mark}:{}", self.name));
        }
    }

    /// Panics while rendering `Unrenderable`.
    struct PanickingRenderer;

    #[async_trait]
    impl ResponseHandler for PanickingRenderer {
        fn supports(&self, result: &ReturnValue) -> bool {
            result.type_name().ends_with("Unrenderable")
        }

        async fn handle(&self, _result: &ReturnValue, _ctx: &ExecutionContext) -> Result<(), DispatchError> {
            panic!("template missing")
        }
    }

    fn tracer(name: &'static str, fault_at: Option<(&'static str, Fault)>, log: &Log) -> InterceptorRef {
        InterceptorRef::instance(Tracer {
            name,
            fault: fault_at.filter(|(at, _)| *at == name).map(|(_, fault)| fault),
            log: Arc::clone(log),
        })
    }

    fn pipeline(abort_at: Option<&'static str>) -> (Arc<Pipeline>, Log) {
        pipeline_with(abort_at.map(|at| (at, Fault::Abort)), false)
    }

    /// Routes: GET /users/:a/:b, POST /users, GET /broken.
    /// Interceptors: I1, I2 global; I3 on GET /users/:a/:b.
    fn pipeline_with(fault_at: Option<(&'static str, Fault)>, renderer: bool) -> (Arc<Pipeline>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut container = Container::new();
        container.instance(UserController {
            log: Arc::clone(&log),
        });

        let mut router = Router::new();
        router
            .register_with(
                Verb::GET,
                "/users/:a/:b",
                HandlerMeta::new(UserController::pair).unwrap(),
                vec![tracer("I3", fault_at, &log)],
            )
            .unwrap();
        router
            .register(Verb::POST, "/users", HandlerMeta::new(UserController::create).unwrap())
            .unwrap();
        router
            .register(Verb::GET, "/broken", HandlerMeta::new(UserController::broken).unwrap())
            .unwrap();

        let mut builder = Pipeline::builder(router, Arc::new(container))
            .interceptor(tracer("I1", fault_at, &log))
            .interceptor(tracer("I2", fault_at, &log));
        if renderer {
            builder = builder.response_handler(Arc::new(PanickingRenderer));
        }
        (Arc::new(builder.build().unwrap()), log)
    }

    fn request(verb: Verb, target: &str, body: &str) -> (Arc<ExecutionContext>, Arc<RecordingWriter>) {
        let ctx = ExecutionContext::for_http(verb, target).body(body).build();
        let writer = Arc::new(RecordingWriter::new());
        ctx.set_response_writer(writer.clone());
        (Arc::new(ctx), writer)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    #[tokio::test]
    async fn test_path_values_bind_positionally_end_to_end() {
        let (pipeline, log) = pipeline(None);
        let (ctx, writer) = request(Verb::GET, "/users/1/2", "");

        let outcome = pipeline.execute(ctx).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(writer.response().unwrap().body_text(), "x=1,y=2");
        assert_eq!(
            entries(&log),
            [
                "pre:I1", "pre:I2", "pre:I3", "handler", "post:I3", "post:I2", "post:I1",
                "after:I3", "after:I2", "after:I1",
            ]
        );
    }

    #[tokio::test]
    async fn test_abort_skips_handler_but_runs_cleanup() {
        let (pipeline, log) = pipeline(Some("I2"));
        let (ctx, writer) = request(Verb::GET, "/users/1/2", "");

        let outcome = pipeline.execute(ctx).await.unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(writer.response().unwrap().status, 401);
        assert_eq!(
            entries(&log),
            ["pre:I1", "pre:I2", "after:I2", "after:I1"]
        );
    }

    #[tokio::test]
    async fn test_error_result_wins_and_skips_post_handle() {
        let (pipeline, log) = pipeline(None);
        let (ctx, writer) = request(Verb::POST, "/users", r#"{"name":"ada"}"#);

        let outcome = pipeline.execute(ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));

        let response = writer.response().unwrap();
        assert_eq!(response.status, 409);
        assert!(!response.body_text().contains("created"));
        assert_eq!(
            entries(&log),
            ["pre:I1", "pre:I2", "handler", "after!:I2", "after!:I1"]
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_client_error() {
        let (pipeline, log) = pipeline(None);
        let (ctx, writer) = request(Verb::POST, "/users", "{not json");

        pipeline.execute(ctx).await.unwrap();
        assert_eq!(writer.response().unwrap().status, 400);
        assert!(!entries(&log).contains(&"handler".to_string()));
        assert!(entries(&log).contains(&"after!:I1".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (pipeline, log) = pipeline(None);
        let (ctx, writer) = request(Verb::DELETE, "/users/1/2", "");

        let outcome = pipeline.execute(ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(writer.response().unwrap().status, 404);
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_undispatchable_result_falls_back_to_500() {
        let (pipeline, log) = pipeline(None);
        let (ctx, writer) = request(Verb::GET, "/broken", "");

        let err = pipeline.execute(ctx).await.err().unwrap();
        assert!(matches!(err, PipelineError::Dispatch(DispatchError::NoHandler { .. })));
        assert_eq!(writer.response().unwrap().status, 500);
        assert!(!entries(&log).contains(&"post:I1".to_string()));
        assert!(entries(&log).contains(&"after!:I1".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_interceptor_still_unwinds() {
        let (pipeline, log) = pipeline_with(Some(("I2", Fault::Panic)), false);
        let (ctx, writer) = request(Verb::GET, "/users/1/2", "");

        let outcome = pipeline.execute(ctx).await.unwrap();
        match outcome {
            Outcome::Failed(err) => assert!(err.to_string().contains("lost its session store")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(writer.response().unwrap().status, 500);
        assert_eq!(
            entries(&log),
            ["pre:I1", "pre:I2", "after!:I2", "after!:I1"]
        );
    }

    #[tokio::test]
    async fn test_panicking_response_handler_falls_back_to_500() {
        let (pipeline, log) = pipeline_with(None, true);
        let (ctx, writer) = request(Verb::GET, "/broken", "");

        let err = pipeline.execute(ctx).await.err().unwrap();
        assert!(matches!(err, PipelineError::Dispatch(DispatchError::Panicked(ref msg)) if msg == "template missing"));
        assert_eq!(writer.response().unwrap().status, 500);
        assert_eq!(entries(&log), ["pre:I1", "pre:I2", "after!:I2", "after!:I1"]);
    }

    #[tokio::test]
    async fn test_pipeline_service_oneshot() {
        let (pipeline, _log) = pipeline(None);
        let (ctx, writer) = request(Verb::GET, "/users/a/b", "");

        let outcome = PipelineService::new(pipeline).oneshot(ctx).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(writer.response().unwrap().body_text(), "x=a,y=b");
    }
}
