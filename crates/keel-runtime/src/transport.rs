//! Transport adapters.
//!
//! A transport turns inbound units of work into [`ExecutionContext`]s and
//! runs the pipeline on them. [`Mount::execute`] implements the part of that
//! contract every transport shares: the response writer is stored in the
//! context before execution, the context is cancelled on shutdown, and the
//! request timeout is armed.
//!
//! [`LocalTransport`] is an in-process transport driven by a [`LocalClient`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use keel_core::{
    BoxedSink, BoxedWriter, CancellationToken, ContextBuilder, ExecutionContext, HeaderMap,
    HeaderName, HeaderValue, RecordingWriter, Response, StatusCode, TransportError,
    TransportResult, Verb,
};
use keel_framework::{Outcome, Pipeline, PipelineResult};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// An adapter that feeds units of work into the pipeline.
pub trait Transport: Send + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Serves until `mount.shutdown()` is cancelled or the source of work
    /// is exhausted, then waits for in-flight work.
    fn serve(self, mount: Mount) -> BoxFuture<'static, TransportResult<()>>;
}

// =============================================================================
// Mount
// =============================================================================

/// Everything a transport receives when it is mounted.
#[derive(Clone)]
pub struct Mount {
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
    request_timeout: Option<Duration>,
    sink: BoxedSink,
}

impl Mount {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        shutdown: CancellationToken,
        request_timeout: Option<Duration>,
        sink: BoxedSink,
    ) -> Self {
        Self {
            pipeline,
            shutdown,
            request_timeout,
            sink,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Cancelled when the application shuts down.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Runs one unit of work through the pipeline.
    ///
    /// The context's token is a child of the shutdown token and is also
    /// cancelled once the request timeout elapses. Both are advisory.
    pub async fn execute(
        &self,
        builder: ContextBuilder,
        writer: BoxedWriter,
    ) -> PipelineResult<Outcome> {
        let mut builder = builder
            .cancellation(&self.shutdown)
            .sink(Arc::clone(&self.sink));
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let ctx = Arc::new(builder.build());
        ctx.set_response_writer(writer);

        let timer = self
            .request_timeout
            .map(|timeout| arm_timeout(&ctx, timeout));
        let result = self.pipeline.execute(ctx).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        result
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("routes", &self.pipeline.router().len())
            .field("request_timeout", &self.request_timeout)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

fn arm_timeout(ctx: &ExecutionContext, timeout: Duration) -> JoinHandle<()> {
    let token = ctx.cancellation().clone();
    let id = ctx.id();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                debug!(request = %id, ?timeout, "Request timed out, cancelling");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

// =============================================================================
// LocalTransport
// =============================================================================

/// A unit of work sent through a [`LocalClient`].
#[derive(Debug, Clone)]
pub struct LocalRequest {
    input: LocalInput,
    headers: HeaderMap,
    body: Vec<u8>,
}

#[derive(Debug, Clone)]
enum LocalInput {
    Http { verb: Verb, target: String },
    Event { name: String, payload: Value },
}

impl LocalRequest {
    /// An HTTP request; `target` may carry a query string.
    pub fn http(verb: Verb, target: impl Into<String>) -> Self {
        Self {
            input: LocalInput::Http {
                verb,
                target: target.into(),
            },
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::http(Verb::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::http(Verb::POST, target)
    }

    /// A broker-style event.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self {
            input: LocalInput::Event {
                name: name.into(),
                payload,
            },
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Appends a header. Names or values that are not valid HTTP are dropped.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        match (name.try_into(), value.try_into()) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => warn!(request = %self, "Dropping invalid header"),
        }
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and its content type.
    pub fn json(self, body: &Value) -> Self {
        self.header("content-type", "application/json")
            .body(body.to_string())
    }

    fn into_context(self) -> ContextBuilder {
        let builder = match self.input {
            LocalInput::Http { verb, target } => {
                ExecutionContext::for_http(verb, &target).body(self.body)
            }
            LocalInput::Event { name, payload } => ExecutionContext::for_event(name, payload),
        };
        builder.headers(self.headers)
    }
}

impl fmt::Display for LocalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.input {
            LocalInput::Http { verb, target } => write!(f, "{verb} {target}"),
            LocalInput::Event { name, .. } => write!(f, "event {name}"),
        }
    }
}

struct Envelope {
    request: LocalRequest,
    reply: oneshot::Sender<Response>,
}

/// An in-process transport.
///
/// Each request runs on its own tokio task. A request that completes
/// without writing a response is answered with `204 No Content`.
pub struct LocalTransport {
    name: String,
    rx: mpsc::Receiver<Envelope>,
}

impl LocalTransport {
    /// Creates a transport and the client that feeds it. `capacity` bounds
    /// the number of queued, not yet started requests.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, LocalClient) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = LocalClient {
            name: name.clone(),
            tx,
        };
        (Self { name, rx }, client)
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn serve(mut self, mount: Mount) -> BoxFuture<'static, TransportResult<()>> {
        async move {
            let tracker = TaskTracker::new();
            info!(transport = %self.name, "Transport serving");

            loop {
                let envelope = tokio::select! {
                    _ = mount.shutdown().cancelled() => break,
                    next = self.rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let mount = mount.clone();
                tracker.spawn(handle_local(mount, envelope));
            }

            tracker.close();
            debug!(
                transport = %self.name,
                in_flight = tracker.len(),
                "Waiting for in-flight requests"
            );
            tracker.wait().await;
            info!(transport = %self.name, "Transport stopped");
            Ok(())
        }
        .boxed()
    }
}

async fn handle_local(mount: Mount, envelope: Envelope) {
    let Envelope { request, reply } = envelope;
    let target = request.to_string();
    let writer = Arc::new(RecordingWriter::new());

    if let Err(err) = mount
        .execute(request.into_context(), Arc::clone(&writer) as BoxedWriter)
        .await
    {
        warn!(%target, error = %err, "Request failed to dispatch");
    }

    let response = writer
        .take()
        .unwrap_or_else(|| Response::new(StatusCode::NO_CONTENT));
    if reply.send(response).is_err() {
        debug!(%target, "Client dropped before the reply was sent");
    }
}

/// Sends requests to a mounted [`LocalTransport`].
#[derive(Debug, Clone)]
pub struct LocalClient {
    name: String,
    tx: mpsc::Sender<Envelope>,
}

impl LocalClient {
    /// Sends a request and waits for its response.
    pub async fn send(&self, request: LocalRequest) -> TransportResult<Response> {
        let target = request.to_string();
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| TransportError::Closed {
                transport: self.name.clone(),
            })?;
        response.await.map_err(|_| TransportError::NoReply(target))
    }

    pub async fn get(&self, target: &str) -> TransportResult<Response> {
        self.send(LocalRequest::get(target)).await
    }

    pub async fn post_json(&self, target: &str, body: &Value) -> TransportResult<Response> {
        self.send(LocalRequest::post(target).json(body)).await
    }

    pub async fn publish(&self, name: &str, payload: Value) -> TransportResult<Response> {
        self.send(LocalRequest::event(name, payload)).await
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Container, NoopSink};
    use keel_framework::{HandlerMeta, PathValue, Router};

    struct Echo;

    impl Echo {
        async fn path(self: Arc<Self>, word: PathValue) -> String {
            word.into_inner()
        }

        async fn quiet(self: Arc<Self>) {}
    }

    fn mount() -> Mount {
        let mut container = Container::new();
        container.instance(Echo);

        let mut router = Router::new();
        router
            .register(Verb::GET, "/echo/:word", HandlerMeta::new(Echo::path).unwrap())
            .unwrap();
        router
            .consume("quiet", HandlerMeta::new(Echo::quiet).unwrap())
            .unwrap();

        let pipeline = Pipeline::builder(router, Arc::new(container))
            .build()
            .unwrap();
        Mount::new(
            Arc::new(pipeline),
            CancellationToken::new(),
            None,
            Arc::new(NoopSink),
        )
    }

    #[test]
    fn test_local_request_display() {
        assert_eq!(LocalRequest::get("/a?b=1").to_string(), "GET /a?b=1");
        assert_eq!(
            LocalRequest::event("user.created", Value::Null).to_string(),
            "event user.created"
        );
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let mount = mount();
        let (transport, client) = LocalTransport::new("local", 8);
        let server = tokio::spawn(transport.serve(mount.clone()));

        let response = client.get("/echo/hello").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), "hello");

        let response = client.publish("quiet", Value::Null).await.unwrap();
        assert_eq!(response.status, 204);

        let response = client.get("/nowhere").await.unwrap();
        assert_eq!(response.status, 404);

        mount.shutdown().cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let mount = mount();
        let (transport, client) = LocalTransport::new("local", 1);
        mount.shutdown().cancel();
        transport.serve(mount).await.unwrap();

        let err = client.get("/echo/late").await.unwrap_err();
        assert!(matches!(err, TransportError::Closed { .. }));
    }
}
