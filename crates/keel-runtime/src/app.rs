//! Boot sequence and application lifecycle.
//!
//! Boot runs in a fixed order:
//!
//! 1. build the container
//! 2. build the router and collect handler metadata
//! 3. warm up every controller type
//! 4. assemble the pipeline
//! 5. mount transports
//!
//! Steps 1 to 4 happen in [`KeelBuilder::build`]; any failure there returns
//! a [`BootError`] before a transport can be mounted. Step 5 is
//! [`App::mount`].
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! let mut app = Keel::builder()
//!     .config_loader(ConfigLoader::new().with_current_dir())
//!     .provide(|config: Arc<KeelConfig>| Database::connect(&config))
//!     .provide(|db: Arc<Database>| UserController { db })
//!     .route(Verb::GET, "/users/:id", UserController::show)
//!     .interceptor(InterceptorRef::resolve::<AuthInterceptor>())
//!     .build()?;
//!
//! let (transport, client) = LocalTransport::new("local", 64);
//! app.mount(transport);
//! ```

use std::future::Future;
use std::sync::Arc;

use keel_core::{
    BoxedSink, CancellationToken, Container, NoopSink, Provider, TryProvider, TypeKey, Verb,
};
use keel_framework::{
    ArgumentResolver, HandlerMeta, InterceptorRef, Method, Pipeline, RegistryResult,
    ResponseHandler, RouteId, Router,
};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{ConfigLoader, KeelConfig};
use crate::error::{BootError, BootResult, RuntimeError, RuntimeResult};
use crate::logging;
use crate::transport::{Mount, Transport};

/// Entry point for building an application.
pub struct Keel;

impl Keel {
    pub fn builder() -> KeelBuilder {
        KeelBuilder::new()
    }
}

/// A route or consumer declaration, registered on the router in step 2.
enum Declaration {
    Route {
        verb: Verb,
        pattern: String,
        meta: RegistryResult<HandlerMeta>,
        interceptors: Vec<InterceptorRef>,
    },
    Consumer {
        event: String,
        meta: RegistryResult<HandlerMeta>,
        interceptors: Vec<InterceptorRef>,
    },
}

impl Declaration {
    fn register(self, router: &mut Router) -> RegistryResult<RouteId> {
        match self {
            Self::Route {
                verb,
                pattern,
                meta,
                interceptors,
            } => router.register_with(verb, &pattern, meta?, interceptors),
            Self::Consumer {
                event,
                meta,
                interceptors,
            } => router.consume_with(&event, meta?, interceptors),
        }
    }
}

// =============================================================================
// KeelBuilder
// =============================================================================

/// Collects registrations and runs boot steps 1 to 4.
///
/// Registration methods never fail; errors such as an invalid handler
/// reference are reported by [`build`](Self::build).
pub struct KeelBuilder {
    config: KeelConfig,
    config_loader: Option<ConfigLoader>,
    init_logging: bool,
    container: Container,
    declarations: Vec<Declaration>,
    interceptors: Vec<InterceptorRef>,
    resolvers: Vec<Arc<dyn ArgumentResolver>>,
    response_handlers: Vec<Arc<dyn ResponseHandler>>,
    sink: BoxedSink,
}

impl KeelBuilder {
    fn new() -> Self {
        Self {
            config: KeelConfig::default(),
            config_loader: None,
            init_logging: true,
            container: Container::new(),
            declarations: Vec::new(),
            interceptors: Vec::new(),
            resolvers: Vec::new(),
            response_handlers: Vec::new(),
            sink: Arc::new(NoopSink),
        }
    }

    // ─── Configuration ───────────────────────────────────────────────────────

    /// Uses an already loaded configuration.
    pub fn config(mut self, config: KeelConfig) -> Self {
        self.config = config;
        self.config_loader = None;
        self
    }

    /// Loads the configuration during [`build`](Self::build).
    pub fn config_loader(mut self, loader: ConfigLoader) -> Self {
        self.config_loader = Some(loader);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    /// The sink behind [`Publisher`](keel_framework::Publisher) arguments.
    pub fn sink(mut self, sink: BoxedSink) -> Self {
        self.sink = sink;
        self
    }

    // ─── Container ───────────────────────────────────────────────────────────

    pub fn provide<T, Args, F>(mut self, constructor: F) -> Self
    where
        F: Provider<T, Args>,
    {
        self.container.provide(constructor);
        self
    }

    pub fn try_provide<T, Args, F>(mut self, constructor: F) -> Self
    where
        F: TryProvider<T, Args>,
    {
        self.container.try_provide(constructor);
        self
    }

    pub fn instance<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.container.instance(value);
        self
    }

    // ─── Routes ──────────────────────────────────────────────────────────────

    pub fn route<C, Args, M>(self, verb: Verb, pattern: &str, method: M) -> Self
    where
        C: Send + Sync + 'static,
        Args: 'static,
        M: Method<C, Args>,
    {
        self.route_with(verb, pattern, method, Vec::new())
    }

    /// Declares a route with interceptors that run after the global ones.
    pub fn route_with<C, Args, M>(
        mut self,
        verb: Verb,
        pattern: &str,
        method: M,
        interceptors: Vec<InterceptorRef>,
    ) -> Self
    where
        C: Send + Sync + 'static,
        Args: 'static,
        M: Method<C, Args>,
    {
        self.declarations.push(Declaration::Route {
            verb,
            pattern: pattern.to_string(),
            meta: HandlerMeta::new(method),
            interceptors,
        });
        self
    }

    pub fn consume<C, Args, M>(self, event: &str, method: M) -> Self
    where
        C: Send + Sync + 'static,
        Args: 'static,
        M: Method<C, Args>,
    {
        self.consume_with(event, method, Vec::new())
    }

    pub fn consume_with<C, Args, M>(
        mut self,
        event: &str,
        method: M,
        interceptors: Vec<InterceptorRef>,
    ) -> Self
    where
        C: Send + Sync + 'static,
        Args: 'static,
        M: Method<C, Args>,
    {
        self.declarations.push(Declaration::Consumer {
            event: event.to_string(),
            meta: HandlerMeta::new(method),
            interceptors,
        });
        self
    }

    // ─── Pipeline ────────────────────────────────────────────────────────────

    /// Adds a global interceptor. Global interceptors run in registration
    /// order, before any route-specific ones.
    pub fn interceptor(mut self, interceptor: InterceptorRef) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Adds an argument resolver after the built-in ones.
    pub fn resolver<R: ArgumentResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    /// Adds a response handler after the built-in ones.
    pub fn response_handler<H: ResponseHandler + 'static>(mut self, handler: H) -> Self {
        self.response_handlers.push(Arc::new(handler));
        self
    }

    // ─── Boot ────────────────────────────────────────────────────────────────

    /// Runs boot steps 1 to 4.
    pub fn build(self) -> BootResult<App> {
        let config = match self.config_loader {
            Some(loader) => loader.load()?,
            None => self.config,
        };
        if self.init_logging {
            logging::init_from_config(&config.logging);
        }

        let span = info_span!("boot");
        let _enter = span.enter();

        // 1. Container. The configuration is injectable unless the
        // application registered its own.
        let mut container = self.container;
        if !container.contains(TypeKey::of::<KeelConfig>()) {
            container.instance(config.clone());
        }
        let container = Arc::new(container);
        info!(types = container.len(), "Container built");

        // 2. Router.
        let mut router = Router::new();
        for declaration in self.declarations {
            if let Err(err) = declaration.register(&mut router) {
                error!(error = %err, "Invalid route declaration");
                return Err(err.into());
            }
        }
        info!(
            routes = router.routes().len(),
            consumers = router.consumers().len(),
            "Router built"
        );

        // 3. Warm-up.
        let controllers = router.controller_types();
        if config.pipeline.warm_up {
            if let Err(err) = container.warm_up(controllers.iter().copied()) {
                error!(error = %err, "Controller warm-up failed");
                return Err(err.into());
            }
            info!(controllers = controllers.len(), "Controllers warmed up");
        } else {
            debug!(
                controllers = controllers.len(),
                "Warm-up disabled, controllers resolve on first request"
            );
        }

        // 4. Pipeline.
        let mut builder = Pipeline::builder(router, Arc::clone(&container))
            .expose_error_details(config.pipeline.expose_error_details);
        for interceptor in self.interceptors {
            builder = builder.interceptor(interceptor);
        }
        for resolver in self.resolvers {
            builder = builder.resolver(resolver);
        }
        for handler in self.response_handlers {
            builder = builder.response_handler(handler);
        }
        let pipeline = builder.build().map_err(|err| {
            error!(error = %err, "Interceptor resolution failed");
            BootError::Interceptor(err)
        })?;
        info!("Pipeline assembled");

        Ok(App {
            pipeline: Arc::new(pipeline),
            config: Arc::new(config),
            sink: self.sink,
            shutdown: CancellationToken::new(),
            transports: Vec::new(),
        })
    }
}

// =============================================================================
// App
// =============================================================================

/// A booted application.
pub struct App {
    pipeline: Arc<Pipeline>,
    config: Arc<KeelConfig>,
    sink: BoxedSink,
    shutdown: CancellationToken,
    transports: Vec<(String, JoinHandle<keel_core::TransportResult<()>>)>,
}

impl App {
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    pub fn container(&self) -> &Arc<Container> {
        self.pipeline.container()
    }

    /// Names of the mounted transports, in mount order.
    pub fn transports(&self) -> impl Iterator<Item = &str> {
        self.transports.iter().map(|(name, _)| name.as_str())
    }

    /// Boot step 5: starts serving `transport` on its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mount<T: Transport>(&mut self, transport: T) -> &mut Self {
        let name = transport.name().to_string();
        let mount = Mount::new(
            Arc::clone(&self.pipeline),
            self.shutdown.child_token(),
            self.config.pipeline.request_timeout(),
            Arc::clone(&self.sink),
        );

        let span = info_span!("transport", name = %name);
        let handle = tokio::spawn(transport.serve(mount).instrument(span));
        info!(transport = %name, "Transport mounted");
        self.transports.push((name, handle));
        self
    }

    /// Serves until `signal` completes, then shuts down.
    pub async fn run_until<F>(self, signal: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(transports = self.transports.len(), "Keel is running");
        signal.await;
        self.shutdown().await
    }

    /// Stops every transport and waits for in-flight work.
    ///
    /// Returns the first transport failure; the others are logged.
    pub async fn shutdown(self) -> RuntimeResult<()> {
        info!("Shutting down");
        self.shutdown.cancel();

        let mut first_error = None;
        for (name, handle) in self.transports {
            let failure = match handle.await {
                Ok(Ok(())) => {
                    debug!(transport = %name, "Transport stopped");
                    continue;
                }
                Ok(Err(source)) => RuntimeError::Transport { name, source },
                Err(join) => RuntimeError::TransportTask {
                    name,
                    reason: join.to_string(),
                },
            };
            if first_error.is_none() {
                first_error = Some(failure);
            } else {
                warn!(error = %failure, "Additional transport failure");
            }
        }

        info!("Shutdown complete");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalRequest, LocalTransport};
    use keel_core::{ChannelSink, ContainerError, ExecutionContext, HttpError, StatusCode};
    use keel_framework::{
        Flow, Inject, Interceptor, Json, PathValue, Publisher, RegistryError, async_trait,
    };
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ─── Fixtures ────────────────────────────────────────────────────────────

    struct Store {
        users: Mutex<Vec<String>>,
    }

    struct UserController {
        store: Arc<Store>,
    }

    impl UserController {
        async fn show(self: Arc<Self>, id: PathValue) -> Result<String, HttpError> {
            let index: usize = id
                .parse()
                .map_err(|_| HttpError::bad_request("id must be a number"))?;
            self.store
                .users
                .lock()
                .get(index)
                .cloned()
                .ok_or_else(|| HttpError::not_found("no such user"))
        }

        async fn create(
            self: Arc<Self>,
            body: Json<Value>,
            publisher: Publisher,
        ) -> anyhow::Result<StatusCode> {
            let name = body["name"].as_str().unwrap_or_default().to_string();
            self.store.users.lock().push(name.clone());
            publisher
                .publish("user.created", json!({ "name": name }))
                .await?;
            Ok(StatusCode::CREATED)
        }

        async fn on_created(self: Arc<Self>, payload: Json<Value>) {
            let _ = payload;
        }
    }

    struct ConfigController {
        config: Arc<KeelConfig>,
    }

    impl ConfigController {
        async fn details(self: Arc<Self>, _config: Inject<KeelConfig>) -> Json<Value> {
            Json(json!({ "expose": self.config.pipeline.expose_error_details }))
        }
    }

    #[derive(Default)]
    struct Gate {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Interceptor for Gate {
        async fn pre_handle(
            &self,
            ctx: &ExecutionContext,
            _meta: &HandlerMeta,
        ) -> anyhow::Result<Flow> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.headers().get("x-blocked").is_some() {
                keel_framework::write_response(
                    ctx,
                    keel_core::Response::text(StatusCode::FORBIDDEN, "blocked"),
                )
                .await?;
                return Ok(Flow::Abort);
            }
            Ok(Flow::Continue)
        }
    }

    fn users() -> KeelBuilder {
        Keel::builder()
            .without_logging()
            .instance(Store {
                users: Mutex::new(vec!["ada".into()]),
            })
            .provide(|store: Arc<Store>| UserController { store })
            .route(Verb::GET, "/users/:id", UserController::show)
            .route(Verb::POST, "/users", UserController::create)
            .consume("user.created", UserController::on_created)
    }

    // ─── Boot ────────────────────────────────────────────────────────────────

    #[test]
    fn test_build_warms_up_controllers() {
        let app = users().build().unwrap();
        assert!(
            app.container()
                .is_resolved(TypeKey::of::<UserController>())
        );
        assert!(app.container().is_resolved(TypeKey::of::<Store>()));
    }

    #[test]
    fn test_build_without_warm_up_is_lazy() {
        let mut config = KeelConfig::default();
        config.pipeline.warm_up = false;
        let app = users().config(config).build().unwrap();
        assert!(
            !app.container()
                .is_resolved(TypeKey::of::<UserController>())
        );
    }

    #[test]
    fn test_missing_dependency_aborts_boot() {
        let result = Keel::builder()
            .without_logging()
            .provide(|store: Arc<Store>| UserController { store })
            .route(Verb::GET, "/users/:id", UserController::show)
            .build();

        match result {
            Err(BootError::Container(err)) => assert!(err.is_missing()),
            other => panic!("expected a container error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_invalid_pattern_aborts_boot() {
        let result = users()
            .route(Verb::GET, "users/:id", UserController::show)
            .build();
        assert!(matches!(
            result,
            Err(BootError::Registry(RegistryError::InvalidPattern { .. }))
        ));
    }

    #[test]
    fn test_path_arity_mismatch_aborts_boot() {
        let result = users()
            .route(Verb::GET, "/users", UserController::show)
            .build();
        assert!(matches!(
            result,
            Err(BootError::Registry(RegistryError::PathArity { .. }))
        ));
    }

    #[test]
    fn test_unresolvable_interceptor_aborts_boot() {
        let result = users()
            .interceptor(InterceptorRef::resolve::<Gate>())
            .build();
        match result {
            Err(BootError::Interceptor(ContainerError::MissingConstructor { .. })) => {}
            other => panic!("expected an interceptor error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_config_is_injectable() {
        let mut config = KeelConfig::default();
        config.pipeline.expose_error_details = true;
        let app = Keel::builder()
            .without_logging()
            .config(config)
            .provide(|config: Arc<KeelConfig>| ConfigController { config })
            .route(Verb::GET, "/config", ConfigController::details)
            .build()
            .unwrap();

        let config = app.container().resolve::<KeelConfig>().unwrap();
        assert!(config.pipeline.expose_error_details);
    }

    // ─── Serving ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_end_to_end_over_local_transport() {
        let (sink, mut events) = ChannelSink::new();
        let mut app = users()
            .provide(Gate::default)
            .interceptor(InterceptorRef::resolve::<Gate>())
            .sink(Arc::new(sink))
            .build()
            .unwrap();

        let (transport, client) = LocalTransport::new("local", 16);
        app.mount(transport);
        assert_eq!(app.transports().collect::<Vec<_>>(), vec!["local"]);

        let response = client.get("/users/0").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), "ada");

        let response = client.get("/users/7").await.unwrap();
        assert_eq!(response.status, 404);

        let response = client.get("/users/x").await.unwrap();
        assert_eq!(response.status, 400);

        let response = client
            .post_json("/users", &json!({ "name": "grace" }))
            .await
            .unwrap();
        assert_eq!(response.status, 201);
        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "user.created");
        assert_eq!(event.payload, json!({ "name": "grace" }));

        let response = client.get("/users/1").await.unwrap();
        assert_eq!(response.body_text(), "grace");

        let response = client
            .send(LocalRequest::get("/users/0").header("x-blocked", "1"))
            .await
            .unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.body_text(), "blocked");

        let response = client
            .publish("user.created", json!({ "name": "linus" }))
            .await
            .unwrap();
        assert_eq!(response.status, 204);

        let gate = app.container().resolve::<Gate>().unwrap();
        assert_eq!(gate.calls.load(Ordering::SeqCst), 7);

        app.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests() {
        let mut app = users().build().unwrap();
        let (transport, client) = LocalTransport::new("local", 64);
        app.mount(transport);

        let requests = (0..32).map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get("/users/0").await })
        });
        for request in futures::future::join_all(requests).await {
            let response = request.unwrap().unwrap();
            assert_eq!(response.body_text(), "ada");
        }

        app.run_until(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let mut app = users().build().unwrap();
        let (transport, client) = LocalTransport::new("local", 4);
        app.mount(transport);
        app.shutdown().await.unwrap();

        assert!(client.get("/users/0").await.is_err());
    }
}
