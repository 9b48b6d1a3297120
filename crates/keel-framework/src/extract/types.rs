//! Built-in handler parameter types.
//!
//! A handler method declares what it needs through its parameter types:
//!
//! ```rust,ignore
//! impl UserController {
//!     async fn update(
//!         self: Arc<Self>,
//!         id: PathValue,
//!         body: Json<UpdateUser>,
//!         users: Inject<UserRepository>,
//!     ) -> Result<Json<User>, HttpError> {
//!         // ...
//!     }
//! }
//! ```
//!
//! Every parameter type implements [`Parameter`]. The chain only looks at
//! the declared type; interpretation is left to the resolver that supports
//! it.

use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use keel_core::{
    BoxedSink, CancellationToken, EventMessage, HeaderMap, Instance, PublishError, QueryMap,
    TypeKey, Uuid,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A resolved, type-erased argument.
pub type ArgValue = Box<dyn std::any::Any + Send>;

// =============================================================================
// Parameter trait
// =============================================================================

/// Marks a type as usable as a handler parameter.
///
/// Custom parameter types implement this with the default [`ParamKind::Plain`]
/// and are produced by a custom [`ArgumentResolver`](super::ArgumentResolver).
pub trait Parameter: Send + 'static {
    /// How the parameter is bound.
    fn kind() -> ParamKind {
        ParamKind::Plain
    }
}

/// Binding information the chain needs without knowing the concrete type.
#[derive(Clone, Copy)]
pub enum ParamKind {
    /// Produced by a resolver keyed on the type itself.
    Plain,
    /// Bound positionally to the route's named segments.
    PathValue,
    /// Decoded from the HTTP body or the event payload.
    Json(JsonDecoder),
    /// Resolved from the dependency container.
    Service(ServiceSlot),
}

/// Monomorphized JSON decoders for one `Json<T>`.
#[derive(Clone, Copy)]
pub struct JsonDecoder {
    from_slice: fn(&[u8]) -> serde_json::Result<ArgValue>,
    from_value: fn(Value) -> serde_json::Result<ArgValue>,
}

impl JsonDecoder {
    fn of<T: DeserializeOwned + Send + 'static>() -> Self {
        Self {
            from_slice: |bytes| Ok(Box::new(Json(serde_json::from_slice::<T>(bytes)?)) as ArgValue),
            from_value: |value| Ok(Box::new(Json(serde_json::from_value::<T>(value)?)) as ArgValue),
        }
    }

    pub fn decode_slice(&self, bytes: &[u8]) -> serde_json::Result<ArgValue> {
        (self.from_slice)(bytes)
    }

    pub fn decode_value(&self, value: Value) -> serde_json::Result<ArgValue> {
        (self.from_value)(value)
    }
}

/// The container type behind an `Inject<T>`, and how to wrap it.
#[derive(Clone, Copy)]
pub struct ServiceSlot {
    key: TypeKey,
    wrap: fn(Instance) -> Option<ArgValue>,
}

impl ServiceSlot {
    fn of<T: Send + Sync + 'static>() -> Self {
        Self {
            key: TypeKey::of::<T>(),
            wrap: |instance| {
                instance
                    .downcast::<T>()
                    .ok()
                    .map(|service| Box::new(Inject(service)) as ArgValue)
            },
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    /// Wraps a resolved instance into the argument, or `None` on type mismatch.
    pub fn wrap(&self, instance: Instance) -> Option<ArgValue> {
        (self.wrap)(instance)
    }
}

/// A declared parameter type together with its binding kind.
#[derive(Clone, Copy)]
pub struct ParamType {
    key: TypeKey,
    kind: ParamKind,
}

impl ParamType {
    pub fn of<T: Parameter>() -> Self {
        Self {
            key: TypeKey::of::<T>(),
            kind: T::kind(),
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn is_path_value(&self) -> bool {
        matches!(self.kind, ParamKind::PathValue)
    }
}

impl std::fmt::Debug for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key.name())
    }
}

// =============================================================================
// Built-in parameter types
// =============================================================================

/// One path value, bound by position to the route's named segments.
///
/// The Nth `PathValue` in a signature receives the Nth `:segment` of the
/// pattern. Names are not compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValue(pub String);

impl PathValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Parses the value, e.g. `id.parse::<u64>()`.
    pub fn parse<T: FromStr>(&self) -> Result<T, T::Err> {
        self.0.parse()
    }
}

impl Deref for PathValue {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Parameter for PathValue {
    fn kind() -> ParamKind {
        ParamKind::PathValue
    }
}

/// Multi-value query parameters of an HTTP request.
#[derive(Debug, Clone, Default)]
pub struct Query(pub QueryMap);

impl Deref for Query {
    type Target = QueryMap;

    fn deref(&self) -> &QueryMap {
        &self.0
    }
}

impl Parameter for Query {}

/// Request or message headers.
#[derive(Debug, Clone, Default)]
pub struct Headers(pub HeaderMap);

impl Deref for Headers {
    type Target = HeaderMap;

    fn deref(&self) -> &HeaderMap {
        &self.0
    }
}

impl Parameter for Headers {}

/// JSON body (HTTP) or payload (event), and a JSON response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: DeserializeOwned + Send + 'static> Parameter for Json<T> {
    fn kind() -> ParamKind {
        ParamKind::Json(JsonDecoder::of::<T>())
    }
}

impl Parameter for EventMessage {}

/// A singleton resolved from the container.
pub struct Inject<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> Deref for Inject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> Clone for Inject<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Send + Sync + 'static> Parameter for Inject<T> {
    fn kind() -> ParamKind {
        ParamKind::Service(ServiceSlot::of::<T>())
    }
}

/// The context's event sink.
#[derive(Clone)]
pub struct Publisher(pub BoxedSink);

impl Publisher {
    /// Publishes `payload` as event `name`.
    pub async fn publish(&self, name: &str, payload: Value) -> Result<(), PublishError> {
        self.0.publish(name, payload).await
    }
}

impl Parameter for Publisher {}

/// The context's cancellation token.
#[derive(Debug, Clone)]
pub struct Cancellation(pub CancellationToken);

impl Deref for Cancellation {
    type Target = CancellationToken;

    fn deref(&self) -> &CancellationToken {
        &self.0
    }
}

impl Parameter for Cancellation {}

/// Identity of the unit of work.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Request id.
    pub id: Uuid,
    /// `VERB /path` or `event name`.
    pub target: String,
}

impl Parameter for RequestInfo {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_json_kind_decodes_into_wrapper() {
        let ParamKind::Json(decoder) = ParamType::of::<Json<Point>>().kind() else {
            panic!("Json<T> must be a JSON parameter");
        };

        let arg = decoder.decode_slice(br#"{"x":1,"y":2}"#).unwrap();
        let Json(point) = *arg.downcast::<Json<Point>>().unwrap();
        assert_eq!(point, Point { x: 1, y: 2 });

        assert!(decoder.decode_value(serde_json::json!({"x": 1})).is_err());
    }

    #[test]
    fn test_inject_slot_wraps_instance() {
        let ParamKind::Service(slot) = ParamType::of::<Inject<String>>().kind() else {
            panic!("Inject<T> must be a service parameter");
        };
        assert_eq!(slot.key(), TypeKey::of::<String>());

        let instance: Instance = Arc::new(String::from("db"));
        let arg = slot.wrap(instance).unwrap();
        assert_eq!(&**arg.downcast::<Inject<String>>().unwrap(), "db");

        assert!(slot.wrap(Arc::new(7_u8)).is_none());
    }

    #[test]
    fn test_path_value_parses() {
        let id = PathValue("42".into());
        assert_eq!(id.parse::<u64>().unwrap(), 42);
        assert!(ParamType::of::<PathValue>().is_path_value());
        assert!(!ParamType::of::<Query>().is_path_value());
    }
}
