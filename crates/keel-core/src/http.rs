//! Protocol-neutral request and response model.
//!
//! Methods, status codes and headers are the `http` crate's types.
//! Keel adds the pieces `http` leaves to frameworks: decoded multi-value
//! query access, router-bound path values, the typed [`HttpError`] and an
//! owned [`Response`] that converts to and from `http::Response<Vec<u8>>`.

use std::collections::BTreeMap;

use ::http::header::{CONTENT_TYPE, IntoHeaderName};
use serde::Serialize;
use thiserror::Error;
use url::form_urlencoded;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method as Verb, StatusCode};

// =============================================================================
// Query / path values
// =============================================================================

/// Multi-value query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap {
    values: BTreeMap<String, Vec<String>>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an `application/x-www-form-urlencoded` query string.
    ///
    /// Keys and values are percent-decoded and `+` becomes a space. A key
    /// without `=` gets an empty value.
    pub fn parse(raw: &str) -> Self {
        let mut map = Self::new();
        for (key, value) in form_urlencoded::parse(raw.trim_start_matches('?').as_bytes()) {
            map.append(key, value);
        }
        map
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of `key`.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Path values bound by the router, in the route pattern's declared order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    values: Vec<(String, String)>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Keys in declared order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// HttpError
// =============================================================================

/// A typed error carrying the status and message the client should see.
///
/// Handlers and interceptors return it (directly, or inside
/// `anyhow::Error`) to choose the response; any other error degrades to a
/// generic `500`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

// =============================================================================
// Response
// =============================================================================

/// An owned response, handed to a [`ResponseWriter`].
///
/// [`ResponseWriter`]: crate::writer::ResponseWriter
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// `text/plain` response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_body(body.into().into_bytes())
    }

    /// `application/json` response.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> serde_json::Result<Self> {
        Ok(Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(serde_json::to_vec(body)?))
    }

    /// Sets `name`, replacing any earlier value.
    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Body as UTF-8, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl From<Response> for ::http::Response<Vec<u8>> {
    fn from(response: Response) -> Self {
        let mut out = ::http::Response::new(response.body);
        *out.status_mut() = response.status;
        *out.headers_mut() = response.headers;
        out
    }
}

impl From<::http::Response<Vec<u8>>> for Response {
    fn from(response: ::http::Response<Vec<u8>>) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }
}
