//! Return-value dispatch.
//!
//! A handler call produces a list of [`ReturnValue`]s. The
//! [`ReturnDispatcher`] picks the one to send:
//!
//! 1. If any result is an error, the first error is dispatched and every
//!    success value is ignored.
//! 2. Otherwise the first value is dispatched.
//! 3. No result at all means nothing is written.
//!
//! The chosen result goes to the first [`ResponseHandler`] that supports
//! it. Handlers write through the response writer stored in the context by
//! the transport.
//!
//! # Built-in return types
//!
//! | Return type            | Response                                 |
//! |------------------------|------------------------------------------|
//! | `()` / `None`          | nothing                                  |
//! | `String`, `&'static str` | `200 text/plain`                       |
//! | [`Json<T>`]            | `200 application/json`                   |
//! | [`StatusCode`]         | empty body with that status              |
//! | [`Response`]           | as given                                 |
//! | [`HttpError`]          | its status and message                   |
//! | `Result<T, E>`         | `T` on `Ok`, `E` as an error on `Err`    |
//! | `(A, B)`               | both result lists, concatenated          |

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{ExecutionContext, HttpError, Response, StatusCode, TypeKey};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, trace};

use crate::error::DispatchError;
use crate::extract::Json;

// =============================================================================
// Return values
// =============================================================================

/// A type-erased success value.
pub struct Reply {
    ty: TypeKey,
    value: Box<dyn Any + Send + Sync>,
}

impl Reply {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            ty: TypeKey::of::<T>(),
            value: Box::new(value),
        }
    }

    pub fn ty(&self) -> TypeKey {
        self.ty
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Reply").field(&self.ty).finish()
    }
}

/// One result of a handler call.
#[derive(Debug)]
pub enum ReturnValue {
    Value(Reply),
    Error(anyhow::Error),
}

impl ReturnValue {
    pub fn value<T: Send + Sync + 'static>(value: T) -> Self {
        Self::Value(Reply::new(value))
    }

    pub fn error(error: impl Into<anyhow::Error>) -> Self {
        Self::Error(error.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn as_value(&self) -> Option<&Reply> {
        match self {
            Self::Value(reply) => Some(reply),
            Self::Error(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Error(err) => Some(err),
            Self::Value(_) => None,
        }
    }

    pub fn into_error(self) -> Option<anyhow::Error> {
        match self {
            Self::Error(err) => Some(err),
            Self::Value(_) => None,
        }
    }

    /// The value's type name, or `anyhow::Error` for errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Value(reply) => reply.ty.name(),
            Self::Error(_) => std::any::type_name::<anyhow::Error>(),
        }
    }
}

// =============================================================================
// IntoResults
// =============================================================================

/// Converts a handler's return value into its result list.
///
/// Implement this for custom return types (usually as
/// `vec![ReturnValue::value(self)]`) and register a matching
/// [`ResponseHandler`].
pub trait IntoResults: Send {
    fn into_results(self) -> Vec<ReturnValue>;
}

impl IntoResults for () {
    fn into_results(self) -> Vec<ReturnValue> {
        Vec::new()
    }
}

impl IntoResults for String {
    fn into_results(self) -> Vec<ReturnValue> {
        vec![ReturnValue::value(self)]
    }
}

impl IntoResults for &'static str {
    fn into_results(self) -> Vec<ReturnValue> {
        vec![ReturnValue::value(self)]
    }
}

impl IntoResults for StatusCode {
    fn into_results(self) -> Vec<ReturnValue> {
        vec![ReturnValue::value(self)]
    }
}

impl IntoResults for Response {
    fn into_results(self) -> Vec<ReturnValue> {
        vec![ReturnValue::value(self)]
    }
}

impl IntoResults for HttpError {
    fn into_results(self) -> Vec<ReturnValue> {
        vec![ReturnValue::error(self)]
    }
}

/// Serialized eagerly so the dispatcher only ever sees `Json<Value>`.
impl<T: Serialize + Send> IntoResults for Json<T> {
    fn into_results(self) -> Vec<ReturnValue> {
        match serde_json::to_value(&self.0) {
            Ok(value) => vec![ReturnValue::value(Json(value))],
            Err(err) => vec![ReturnValue::error(err)],
        }
    }
}

impl<T: IntoResults> IntoResults for Option<T> {
    fn into_results(self) -> Vec<ReturnValue> {
        self.map(IntoResults::into_results).unwrap_or_default()
    }
}

impl<T, E> IntoResults for Result<T, E>
where
    T: IntoResults,
    E: Into<anyhow::Error> + Send,
{
    fn into_results(self) -> Vec<ReturnValue> {
        match self {
            Ok(value) => value.into_results(),
            Err(err) => vec![ReturnValue::error(err)],
        }
    }
}

impl<A: IntoResults, B: IntoResults> IntoResults for (A, B) {
    fn into_results(self) -> Vec<ReturnValue> {
        let mut results = self.0.into_results();
        results.extend(self.1.into_results());
        results
    }
}

// =============================================================================
// ResponseHandler
// =============================================================================

/// Converts one kind of result into a response.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Returns `true` if this handler can write `result`.
    fn supports(&self, result: &ReturnValue) -> bool;

    /// Writes the response for `result`.
    async fn handle(&self, result: &ReturnValue, ctx: &ExecutionContext)
    -> Result<(), DispatchError>;
}

/// Type alias for a shared response handler.
pub type BoxedResponseHandler = Arc<dyn ResponseHandler>;

/// Writes `response` through the context's writer.
pub async fn write_response(ctx: &ExecutionContext, response: Response) -> Result<(), DispatchError> {
    let writer = ctx.response_writer().ok_or(DispatchError::NoWriter)?;
    writer.write(response).await?;
    Ok(())
}

fn error_body(status: StatusCode, message: &str) -> Result<Response, DispatchError> {
    Response::json(status, &json!({ "status": status.as_u16(), "error": message }))
        .map_err(|err| DispatchError::Encode(err.to_string()))
}

/// Writes [`HttpError`]s with their own status and message.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpErrorHandler;

#[async_trait]
impl ResponseHandler for HttpErrorHandler {
    fn supports(&self, result: &ReturnValue) -> bool {
        result
            .as_error()
            .is_some_and(|err| err.downcast_ref::<HttpError>().is_some())
    }

    async fn handle(
        &self,
        result: &ReturnValue,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let Some(err) = result.as_error().and_then(|err| err.downcast_ref::<HttpError>()) else {
            return Err(DispatchError::NoHandler {
                ty: result.type_name(),
            });
        };
        write_response(ctx, error_body(err.status(), err.message())?).await
    }
}

/// Writes any other error as `500 Internal Server Error`.
///
/// The error's message is only sent when `expose_details` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct UntypedErrorHandler {
    expose_details: bool,
}

impl UntypedErrorHandler {
    pub fn new(expose_details: bool) -> Self {
        Self { expose_details }
    }
}

#[async_trait]
impl ResponseHandler for UntypedErrorHandler {
    fn supports(&self, result: &ReturnValue) -> bool {
        result.is_error()
    }

    async fn handle(
        &self,
        result: &ReturnValue,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let Some(err) = result.as_error() else {
            return Err(DispatchError::NoHandler {
                ty: result.type_name(),
            });
        };
        error!(request = %ctx.id(), target = %ctx.target(), "Handler failed: {err:#}");

        let message = if self.expose_details {
            format!("{err:#}")
        } else {
            "internal server error".to_string()
        };
        write_response(ctx, error_body(StatusCode::INTERNAL_SERVER_ERROR, &message)?).await
    }
}

/// Writes handler-built [`Response`]s unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawResponseHandler;

#[async_trait]
impl ResponseHandler for RawResponseHandler {
    fn supports(&self, result: &ReturnValue) -> bool {
        result.as_value().is_some_and(Reply::is::<Response>)
    }

    async fn handle(
        &self,
        result: &ReturnValue,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let response = result
            .as_value()
            .and_then(Reply::downcast_ref::<Response>)
            .ok_or(DispatchError::NoHandler {
                ty: result.type_name(),
            })?;
        write_response(ctx, response.clone()).await
    }
}

/// Writes [`Json`] values as `200 application/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHandler;

#[async_trait]
impl ResponseHandler for JsonHandler {
    fn supports(&self, result: &ReturnValue) -> bool {
        result.as_value().is_some_and(Reply::is::<Json<Value>>)
    }

    async fn handle(
        &self,
        result: &ReturnValue,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let Json(value) = result
            .as_value()
            .and_then(Reply::downcast_ref::<Json<Value>>)
            .ok_or(DispatchError::NoHandler {
                ty: result.type_name(),
            })?;
        let response =
            Response::json(StatusCode::OK, value).map_err(|err| DispatchError::Encode(err.to_string()))?;
        write_response(ctx, response).await
    }
}

/// Writes strings as `200 text/plain`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextHandler;

impl TextHandler {
    fn text(result: &ReturnValue) -> Option<&str> {
        let reply = result.as_value()?;
        reply
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| reply.downcast_ref::<&'static str>().copied())
    }
}

#[async_trait]
impl ResponseHandler for TextHandler {
    fn supports(&self, result: &ReturnValue) -> bool {
        Self::text(result).is_some()
    }

    async fn handle(
        &self,
        result: &ReturnValue,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let text = Self::text(result).ok_or(DispatchError::NoHandler {
            ty: result.type_name(),
        })?;
        write_response(ctx, Response::text(StatusCode::OK, text)).await
    }
}

/// Writes a bare [`StatusCode`] with an empty body.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusHandler;

#[async_trait]
impl ResponseHandler for StatusHandler {
    fn supports(&self, result: &ReturnValue) -> bool {
        result.as_value().is_some_and(Reply::is::<StatusCode>)
    }

    async fn handle(
        &self,
        result: &ReturnValue,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let status = result
            .as_value()
            .and_then(Reply::downcast_ref::<StatusCode>)
            .ok_or(DispatchError::NoHandler {
                ty: result.type_name(),
            })?;
        write_response(ctx, Response::new(*status)).await
    }
}

// =============================================================================
// ReturnDispatcher
// =============================================================================

/// What the dispatcher sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// An error result was written.
    Error,
    /// A success value was written.
    Value,
    /// There was no result to write.
    Nothing,
}

/// Ordered list of response handlers. First supporting handler wins.
#[derive(Clone, Default)]
pub struct ReturnDispatcher {
    handlers: Vec<BoxedResponseHandler>,
}

impl ReturnDispatcher {
    /// Creates a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dispatcher with the built-in handlers, in their fixed order.
    pub fn with_defaults(expose_error_details: bool) -> Self {
        let mut dispatcher = Self::new();
        dispatcher
            .push(HttpErrorHandler)
            .push(UntypedErrorHandler::new(expose_error_details))
            .push(RawResponseHandler)
            .push(JsonHandler)
            .push(TextHandler)
            .push(StatusHandler);
        dispatcher
    }

    /// Appends a handler after every existing one.
    pub fn push<H: ResponseHandler + 'static>(&mut self, handler: H) -> &mut Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Appends a shared handler.
    pub fn push_shared(&mut self, handler: BoxedResponseHandler) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatches the highest-priority result.
    pub async fn handle(
        &self,
        results: &[ReturnValue],
        ctx: &ExecutionContext,
    ) -> Result<Dispatched, DispatchError> {
        if let Some(err) = results.iter().find(|result| result.is_error()) {
            self.dispatch(err, ctx).await?;
            return Ok(Dispatched::Error);
        }

        match results.first() {
            Some(value) => {
                self.dispatch(value, ctx).await?;
                Ok(Dispatched::Value)
            }
            None => Ok(Dispatched::Nothing),
        }
    }

    /// Sends one result to the first handler that supports it.
    pub async fn dispatch(
        &self,
        result: &ReturnValue,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .iter()
            .find(|handler| handler.supports(result))
            .ok_or(DispatchError::NoHandler {
                ty: result.type_name(),
            })?;
        trace!(ty = result.type_name(), "Dispatching result");
        handler.handle(result, ctx).await
    }
}
