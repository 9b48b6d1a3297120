//! Request-scoped execution context.
//!
//! One [`ExecutionContext`] is created by the transport adapter for every
//! inbound unit of work (an HTTP request or a broker event) and dropped when
//! that unit of work ends. It is never shared between requests.
//!
//! The context exposes one base capability set to every component
//! (cancellation, event sink, headers, the open key-value store) and one
//! protocol-specific set, selected by its [`Input`]:
//!
//! - [`HttpRequest`]: verb, path, query values and body.
//! - [`EventMessage`]: event name and JSON payload.
//!
//! Components that need a protocol-specific capability ask for it through
//! [`ExecutionContext::http`] / [`ExecutionContext::event`] and fail clearly
//! when the context does not provide it.
//!
//! # Reserved keys
//!
//! The open store is keyed by string. Keys under [`keys::RESERVED_PREFIX`]
//! belong to the runtime and can only be written through the typed accessors:
//!
//! | Key                     | Written by     | Accessor                  |
//! |-------------------------|----------------|---------------------------|
//! | [`keys::PATH_PARAMS`]   | router         | [`ExecutionContext::path_params`] |
//! | [`keys::PATH_KEYS`]     | router         | [`ExecutionContext::path_keys`]   |
//! | [`keys::RESPONSE_WRITER`] | transport    | [`ExecutionContext::response_writer`] |

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::http::{HeaderMap, HeaderName, HeaderValue, PathParams, QueryMap, Verb};
use crate::sink::{BoxedSink, NoopSink};
use crate::writer::BoxedWriter;

/// Reserved context-store keys.
pub mod keys {
    /// Prefix shared by every runtime-owned key.
    pub const RESERVED_PREFIX: &str = "keel.";
    /// [`PathParams`](crate::http::PathParams) bound by the router.
    pub const PATH_PARAMS: &str = "keel.path_params";
    /// `Vec<String>` of the matched route's path keys, in declared order.
    pub const PATH_KEYS: &str = "keel.path_keys";
    /// The transport's [`BoxedWriter`](crate::writer::BoxedWriter).
    pub const RESPONSE_WRITER: &str = "keel.response_writer";
}

type StoreValue = Box<dyn Any + Send + Sync>;

// =============================================================================
// Input
// =============================================================================

/// The HTTP capability set.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    verb: Verb,
    path: String,
    query: QueryMap,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a request; a `?query` suffix on `target` is split off.
    pub fn new(verb: Verb, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, raw)) => (path, QueryMap::parse(raw)),
            None => (target, QueryMap::new()),
        };
        Self {
            verb,
            path: path.to_string(),
            query,
            body: Vec::new(),
        }
    }

    pub fn verb(&self) -> &Verb {
        &self.verb
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &QueryMap {
        &self.query
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// The event capability set.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    name: String,
    payload: Value,
}

impl EventMessage {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// What a context was created for.
#[derive(Debug, Clone)]
pub enum Input {
    Http(HttpRequest),
    Event(EventMessage),
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(req) => write!(f, "{} {}", req.verb, req.path),
            Self::Event(event) => write!(f, "event {}", event.name),
        }
    }
}

// =============================================================================
// ExecutionContext
// =============================================================================

/// The request-scoped context threaded through every pipeline stage.
///
/// The store uses interior mutability so interceptors, resolvers and
/// response handlers can all hold `&ExecutionContext`.
pub struct ExecutionContext {
    id: Uuid,
    input: Input,
    headers: HeaderMap,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    sink: BoxedSink,
    store: Mutex<HashMap<String, StoreValue>>,
}

impl ExecutionContext {
    /// Starts building a context for the given input.
    pub fn builder(input: Input) -> ContextBuilder {
        ContextBuilder::new(input)
    }

    /// Starts building an HTTP context. `target` may carry a query string.
    pub fn for_http(verb: Verb, target: &str) -> ContextBuilder {
        ContextBuilder::new(Input::Http(HttpRequest::new(verb, target)))
    }

    /// Starts building an event context.
    pub fn for_event(name: impl Into<String>, payload: Value) -> ContextBuilder {
        ContextBuilder::new(Input::Event(EventMessage::new(name, payload)))
    }

    // ─── Base capabilities ───────────────────────────────────────────────────

    /// Unique id of this unit of work.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input(&self) -> &Input {
        &self.input
    }

    /// Human-readable target, e.g. `GET /users/1` or `event user.created`.
    pub fn target(&self) -> String {
        self.input.to_string()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The cancellation signal. Advisory: the pipeline never unwinds on it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the token is cancelled or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn sink(&self) -> &BoxedSink {
        &self.sink
    }

    // ─── Protocol capabilities ───────────────────────────────────────────────

    /// The HTTP capability set, if this is an HTTP context.
    pub fn http(&self) -> Option<&HttpRequest> {
        match &self.input {
            Input::Http(req) => Some(req),
            Input::Event(_) => None,
        }
    }

    /// The event capability set, if this is an event context.
    pub fn event(&self) -> Option<&EventMessage> {
        match &self.input {
            Input::Event(event) => Some(event),
            Input::Http(_) => None,
        }
    }

    // ─── Open store ──────────────────────────────────────────────────────────

    /// Stores a value under `key`, replacing any previous value.
    ///
    /// Keys under the reserved prefix are rejected.
    pub fn insert<T: Send + Sync + 'static>(
        &self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), StoreError> {
        let key = key.into();
        if key.starts_with(keys::RESERVED_PREFIX) {
            return Err(StoreError::Reserved(key));
        }
        self.store.lock().insert(key, Box::new(value));
        Ok(())
    }

    /// Returns a clone of the value under `key` if it has type `T`.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.store
            .lock()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().contains_key(key)
    }

    /// Removes and returns the value under `key` if it has type `T`.
    ///
    /// Reserved keys cannot be removed.
    pub fn remove<T: 'static>(&self, key: &str) -> Option<T> {
        if key.starts_with(keys::RESERVED_PREFIX) {
            return None;
        }
        let mut store = self.store.lock();
        if !store.get(key).is_some_and(|value| value.is::<T>()) {
            return None;
        }
        store
            .remove(key)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    // ─── Reserved keys ───────────────────────────────────────────────────────

    /// Records the router's match. Written once per request by the router.
    pub fn set_route_match(&self, params: PathParams, path_keys: Vec<String>) {
        let mut store = self.store.lock();
        store.insert(keys::PATH_PARAMS.to_string(), Box::new(params));
        store.insert(keys::PATH_KEYS.to_string(), Box::new(path_keys));
    }

    /// Path values bound by the router (empty before routing).
    pub fn path_params(&self) -> PathParams {
        self.get::<PathParams>(keys::PATH_PARAMS)
            .unwrap_or_default()
    }

    /// The matched route's path keys in declared order.
    pub fn path_keys(&self) -> Vec<String> {
        self.get::<Vec<String>>(keys::PATH_KEYS).unwrap_or_default()
    }

    /// Installs the transport's response writer. Called before the pipeline.
    pub fn set_response_writer(&self, writer: BoxedWriter) {
        self.store
            .lock()
            .insert(keys::RESPONSE_WRITER.to_string(), Box::new(writer));
    }

    pub fn response_writer(&self) -> Option<BoxedWriter> {
        self.get::<BoxedWriter>(keys::RESPONSE_WRITER)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ContextBuilder
// =============================================================================

/// Builder used by transport adapters to assemble a context.
pub struct ContextBuilder {
    input: Input,
    headers: HeaderMap,
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
    sink: Option<BoxedSink>,
}

impl ContextBuilder {
    fn new(input: Input) -> Self {
        Self {
            input,
            headers: HeaderMap::new(),
            cancellation: None,
            deadline: None,
            sink: None,
        }
    }

    /// Appends a header. Names or values that are not valid HTTP are
    /// dropped with a warning.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        match (name.try_into(), value.try_into()) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => warn!("Dropping invalid header"),
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the HTTP body. Ignored for event inputs.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        if let Input::Http(req) = &mut self.input {
            req.body = body.into();
        }
        self
    }

    /// Uses a child of `parent` as this context's cancellation token.
    pub fn cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancellation = Some(parent.child_token());
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn sink(mut self, sink: BoxedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            id: Uuid::new_v4(),
            input: self.input,
            headers: self.headers,
            cancellation: self.cancellation.unwrap_or_default(),
            deadline: self.deadline,
            sink: self.sink.unwrap_or_else(|| Arc::new(NoopSink)),
            store: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::RecordingWriter;
    use serde_json::json;

    #[test]
    fn test_http_target_splits_query() {
        let ctx = ExecutionContext::for_http(Verb::GET, "/users?page=2").build();
        let req = ctx.http().unwrap();
        assert_eq!(req.path(), "/users");
        assert_eq!(req.query().get("page"), Some("2"));
        assert!(ctx.event().is_none());
        assert_eq!(ctx.target(), "GET /users");
    }

    #[test]
    fn test_event_context_exposes_payload_only() {
        let ctx = ExecutionContext::for_event("user.created", json!({"id": 1})).build();
        assert!(ctx.http().is_none());
        assert_eq!(ctx.event().unwrap().payload()["id"], 1);
        assert_eq!(ctx.target(), "event user.created");
    }

    #[test]
    fn test_store_rejects_reserved_keys() {
        let ctx = ExecutionContext::for_http(Verb::GET, "/").build();
        assert!(matches!(
            ctx.insert(keys::PATH_PARAMS, PathParams::new()),
            Err(StoreError::Reserved(_))
        ));
        assert!(ctx.remove::<PathParams>(keys::PATH_PARAMS).is_none());

        ctx.insert("tx", 42_u32).unwrap();
        assert_eq!(ctx.get::<u32>("tx"), Some(42));
        assert_eq!(ctx.get::<String>("tx"), None);
        assert_eq!(ctx.remove::<String>("tx"), None);
        assert_eq!(ctx.remove::<u32>("tx"), Some(42));
        assert!(!ctx.contains("tx"));
    }

    #[test]
    fn test_reserved_accessors_round_trip() {
        let ctx = ExecutionContext::for_http(Verb::GET, "/users/7").build();
        let mut params = PathParams::new();
        params.push("id", "7");
        ctx.set_route_match(params, vec!["id".to_string()]);
        ctx.set_response_writer(Arc::new(RecordingWriter::new()));

        assert_eq!(ctx.path_params().get("id"), Some("7"));
        assert_eq!(ctx.path_keys(), ["id"]);
        assert!(ctx.response_writer().is_some());
    }

    #[test]
    fn test_cancellation_follows_parent_and_deadline() {
        let parent = CancellationToken::new();
        let ctx = ExecutionContext::for_event("tick", Value::Null)
            .cancellation(&parent)
            .build();
        assert!(!ctx.is_cancelled());
        parent.cancel();
        assert!(ctx.is_cancelled());

        let expired = ExecutionContext::for_event("tick", Value::Null)
            .timeout(Duration::ZERO)
            .build();
        assert!(expired.is_cancelled());
    }
}
